//! The Gemini wire protocol: one request line out, one header line in.

use crate::config::GEMINI_MAXLEN;
use crate::error::{GatewayError, Result};

/// A response header line may be at most 1024 bytes plus CRLF; anything
/// longer without a CRLF is a protocol error.
pub const MAX_HEADER_LINE: usize = GEMINI_MAXLEN + 2;

/// Build the single CRLF-terminated request line. `path_info` and `query`
/// arrive from CGI already URL-encoded and are used verbatim.
pub fn request_line(proxy_name: &str, path_info: &str, query: &str) -> Result<String> {
    let path = path_info.strip_prefix('/').unwrap_or(path_info);
    let mut line = format!("gemini://{}/{}", proxy_name, path);
    if !query.is_empty() {
        line.push('?');
        line.push_str(query);
    }
    line.push_str("\r\n");

    if line.len() > GEMINI_MAXLEN {
        return Err(GatewayError::BadRequest(format!(
            "request URL too long ({} bytes)",
            line.len()
        )));
    }
    Ok(line)
}

/// A parsed `DIGIT DIGIT SP META` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: u8,
    pub meta: String,
}

impl ResponseHeader {
    /// The status class, i.e. the first digit.
    pub fn class(&self) -> u8 {
        self.code / 10
    }
}

/// Parse the header line, CRLF already stripped.
pub fn parse_header(line: &str) -> Result<ResponseHeader> {
    let b = line.as_bytes();
    if b.len() < 4 || !b[0].is_ascii_digit() || !b[1].is_ascii_digit() || b[2] != b' ' {
        return Err(GatewayError::UpstreamProtocol(format!(
            "invalid response header {:?}",
            line
        )));
    }

    let code = (b[0] - b'0') * 10 + (b[1] - b'0');
    Ok(ResponseHeader {
        code,
        meta: line[3..].to_string(),
    })
}

/// How the response body will be handled after a 2x status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyMode {
    /// `text/gemini`: translate to HTML, optionally tagging `<html lang=…>`.
    Gemtext { lang: Option<String> },
    /// Anything else is relayed byte for byte under its declared type.
    Passthrough { content_type: String },
}

/// Parse the MIME meta of a successful response. Only UTF-8 compatible
/// charsets are accepted for gemtext; anything else is refused rather than
/// transcoded.
pub fn parse_mime(meta: &str) -> Result<BodyMode> {
    if !meta.starts_with("text/gemini") {
        return Ok(BodyMode::Passthrough {
            content_type: meta.to_string(),
        });
    }

    let mut lang = None;
    for param in meta.split(';').skip(1) {
        let param = param.trim();
        if let Some(charset) = param_value(param, "charset") {
            if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("ascii") {
                return Err(GatewayError::UpstreamCharset(charset.to_string()));
            }
        } else if let Some(value) = param_value(param, "lang") {
            // keep it short enough for an html attribute
            lang = Some(value.chars().take(32).collect());
        }
    }

    Ok(BodyMode::Gemtext { lang })
}

fn param_value<'a>(param: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = param.split_once('=')?;
    if k.trim().eq_ignore_ascii_case(key) {
        Some(v.trim())
    } else {
        None
    }
}
