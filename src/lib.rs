//! # Galileo
//!
//! A FastCGI gateway that lets plain HTTP clients browse the Gemini network.
//!
//! ## Overview
//!
//! Galileo sits behind a web server that already terminates HTTPS. For each
//! FastCGI request it:
//! - routes the incoming `SERVER_NAME` to a configured Gemini origin,
//! - dials the origin over TLS (certificate chain deliberately unverified),
//! - performs the one-line Gemini request/response exchange,
//! - and relays the body downstream, translating `text/gemini` to HTML on
//!   the fly.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use galileo::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::parse(r#"
//! [[proxy]]
//! host = "gemini.example.com"
//! proxy_addr = "gemini.example.com"
//! "#)?;
//!
//! let gateway = galileo::state::Gateway::new(config);
//! // hand `gateway` to galileo::fcgi::serve with a bound listener
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] - TOML configuration loading and validation
//! - [`error`] - Error taxonomy and CGI status mapping
//! - [`fcgi`] - FastCGI record framing and the responder loop
//! - [`gemini`] - Request line, response header and MIME parsing
//! - [`gemtext`] - Streaming gemtext to HTML translation
//! - [`proxy`] - The per-client proxy state machine
//! - [`state`] - Shared gateway state and admission control
//! - [`tmpl`] - Pluggable HTML fragments
//! - [`url`] - Pragmatic URL resolution for links and redirects

pub mod config;
pub mod error;
pub mod fcgi;
pub mod gemini;
pub mod gemtext;
pub mod proxy;
pub mod state;
pub mod tmpl;
pub mod url;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use state::Gateway;
