use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::path::Path;

/// Default number of worker threads, matching the historical prefork count.
pub const DEFAULT_WORKERS: usize = 3;

/// File descriptors kept in reserve when sizing the in-flight request cap.
pub const FD_RESERVE: usize = 5;

/// A Gemini request line may not exceed this many bytes, CRLF included.
pub const GEMINI_MAXLEN: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// One `[[proxy]]` table per virtual host, matched in file order.
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the FastCGI responder listens on.
    pub listen_addr: String,
    pub workers: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Accepted-but-unreleased request cap; new connections wait while the
    /// gateway is at capacity.
    pub max_inflight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
            workers: DEFAULT_WORKERS,
            connect_timeout_secs: 5,
            read_timeout_secs: 15,
            write_timeout_secs: 15,
            max_inflight: 512,
        }
    }
}

/// One virtual host entry: requests whose `SERVER_NAME` equals `host` are
/// proxied to the Gemini server at `proxy_addr:proxy_port`, dialed with
/// `proxy_name` as SNI and URL authority.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default)]
    pub proxy_name: String,
    pub proxy_addr: String,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: String,
    /// Injected as a `<link rel='stylesheet'>` into translated pages.
    #[serde(default)]
    pub stylesheet: String,
    /// Dial the origin in plaintext. Only useful for debugging.
    #[serde(default)]
    pub no_tls: bool,
    #[serde(default)]
    pub no_navbar: bool,
    #[serde(default)]
    pub no_footer: bool,
    /// Disable inline `<figure>` previews for image links.
    #[serde(default)]
    pub no_imgprv: bool,
}

fn default_proxy_port() -> String {
    "1965".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(raw).map_err(|e| GatewayError::ConfigError(e.to_string()))?;

        for proxy in &mut config.proxies {
            if proxy.proxy_name.is_empty() {
                proxy.proxy_name = proxy.proxy_addr.clone();
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            return Err(GatewayError::ConfigError(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.server.max_inflight <= FD_RESERVE {
            return Err(GatewayError::ConfigError(format!(
                "max_inflight must be greater than {}",
                FD_RESERVE
            )));
        }

        for proxy in &self.proxies {
            if proxy.host.is_empty() {
                return Err(GatewayError::ConfigError("proxy host is empty".to_string()));
            }
            if proxy.proxy_addr.is_empty() {
                return Err(GatewayError::ConfigError(format!(
                    "proxy {:?}: proxy_addr is empty",
                    proxy.host
                )));
            }
            if proxy.proxy_port.parse::<u16>().is_err() {
                return Err(GatewayError::ConfigError(format!(
                    "proxy {:?}: invalid port {:?}",
                    proxy.host, proxy.proxy_port
                )));
            }
        }

        Ok(())
    }

    /// Match a request's `SERVER_NAME` against the proxy table. First match
    /// wins; comparison is case-sensitive and there are no wildcards.
    pub fn find_proxy(&self, server_name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|p| p.host == server_name)
    }
}
