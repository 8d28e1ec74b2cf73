use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Upstream timed out while {0}")]
    UpstreamTimeout(&'static str),

    #[error("Unknown charset: {0:?}")]
    UpstreamCharset(String),

    #[error("Peer aborted the request")]
    PeerAbort,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GatewayError {
    /// CGI status this error renders as when no response headers have been
    /// written yet. Everything except a malformed client request maps to 501,
    /// matching how the gateway reports any upstream trouble.
    pub fn cgi_status(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            _ => 501,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
