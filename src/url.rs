//! Pragmatic URL resolution for gemtext links and Gemini redirects.
//!
//! This is deliberately not a full RFC 3986 resolver: the gateway only needs
//! to decide whether a target stays inside the current virtual host (and can
//! be rewritten under the script mount) or escapes it.

/// Where a link or redirect target points, relative to the virtual host the
/// request came in on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Rewritten to a path under the local script mount.
    Local(String),
    /// Absolute URL leading outside this virtual host; left untouched.
    Foreign(String),
    /// Relative reference, left for the browser to resolve.
    Relative(String),
}

impl Target {
    /// The string to place in an `href` attribute, whatever the kind.
    pub fn href(&self) -> &str {
        match self {
            Target::Local(s) | Target::Foreign(s) | Target::Relative(s) => s,
        }
    }
}

/// Resolve a URL found in origin content against the client's virtual host.
///
/// `server_name` comparison is case-sensitive; the port must be absent or
/// string-equal to the configured `proxy_port`.
pub fn resolve(url: &str, server_name: &str, script_name: &str, proxy_port: &str) -> Target {
    // Scheme-relative or explicit gemini:// targets: local when the authority
    // matches the virtual host, foreign otherwise.
    let authority_form = url
        .strip_prefix("gemini://")
        .or_else(|| url.strip_prefix("//"));
    if let Some(rest) = authority_form {
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        };
        if host == server_name && port.is_none_or(|p| p == proxy_port) {
            return Target::Local(mount(script_name, path));
        }
        return Target::Foreign(url.to_string());
    }

    // Any other scheme is foreign.
    if let Some(i) = url.find("://")
        && i > 0
        && url[..i].bytes().all(|b| b.is_ascii_alphabetic())
    {
        return Target::Foreign(url.to_string());
    }

    // Absolute gemini path: remount under the script name.
    if url.is_empty() || url.starts_with('/') {
        return Target::Local(mount(script_name, url));
    }

    Target::Relative(url.to_string())
}

/// Join an absolute Gemini path under the script mount, consuming the path's
/// leading slash.
fn mount(script_name: &str, path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("{}{}", script_name, path)
}

/// Image links get an inline preview; matched on the path suffix only.
pub fn is_image(url: &str) -> bool {
    const SUFFIXES: [&str; 6] = [".jpg", ".jpeg", ".gif", ".png", ".svg", ".webp"];
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    SUFFIXES.iter().any(|s| path.ends_with(s))
}
