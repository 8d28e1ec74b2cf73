use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::Config;

/// Process-wide gateway state shared by the accept loop and every in-flight
/// request task.
///
/// The proxy table is behind an [`ArcSwap`] so a reload can rebuild it
/// atomically between requests: tasks that already loaded the old table keep
/// serving with it, new requests see the new one.
pub struct Gateway {
    config: ArcSwap<Config>,
    /// Accepted but not yet released requests, consulted before accept.
    inflight: AtomicUsize,
    next_client_id: AtomicU32,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            inflight: AtomicUsize::new(0),
            next_client_id: AtomicU32::new(1),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Swap in a freshly loaded configuration.
    pub fn reload(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    pub fn next_client_id(&self) -> u32 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Returns `false` when the gateway is at capacity and the connection
    /// should not be accepted yet.
    pub fn try_admit(&self) -> bool {
        let max = self.config.load().server.max_inflight;
        let mut current = self.inflight.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn release(&self, why: &str) {
        let before = self.inflight.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(inflight = before - 1, why, "inflight decremented");
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.load().server.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.config.load().server.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.config.load().server.write_timeout_secs)
    }
}

/// Decrements the inflight counter exactly once, on whatever path the request
/// ends on.
pub struct InflightGuard {
    gateway: Arc<Gateway>,
}

impl InflightGuard {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gateway.release("request released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn gateway_with_cap(max_inflight: usize) -> Gateway {
        Gateway::new(Config {
            server: ServerConfig {
                max_inflight,
                ..ServerConfig::default()
            },
            proxies: Vec::new(),
        })
    }

    #[test]
    fn test_admission_cap() {
        let gw = gateway_with_cap(2);
        assert!(gw.try_admit());
        assert!(gw.try_admit());
        assert!(!gw.try_admit());
        gw.release("test");
        assert!(gw.try_admit());
    }

    #[test]
    fn test_inflight_guard_releases_once() {
        let gw = Arc::new(gateway_with_cap(8));
        assert!(gw.try_admit());
        assert_eq!(gw.inflight(), 1);
        {
            let _guard = InflightGuard::new(gw.clone());
        }
        assert_eq!(gw.inflight(), 0);
    }

    #[test]
    fn test_reload_swaps_proxy_table() {
        let gw = gateway_with_cap(8);
        assert!(gw.config().proxies.is_empty());

        let next = Config::parse(
            r#"
[[proxy]]
host = "a.example"
proxy_addr = "g.example"
"#,
        )
        .unwrap();
        gw.reload(next);

        assert_eq!(gw.config().proxies.len(), 1);
    }

    #[test]
    fn test_client_ids_monotonic() {
        let gw = gateway_with_cap(8);
        let a = gw.next_client_id();
        let b = gw.next_client_id();
        assert!(b > a);
    }
}
