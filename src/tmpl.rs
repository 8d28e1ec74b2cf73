use crate::config::ProxyConfig;
use crate::gemtext::{html_escape_into, url_escape_into};

/// HTML fragments emitted at fixed points around proxied content.
///
/// The gateway never builds whole pages itself; it calls into this trait so
/// an alternative skin can be substituted without touching the proxy state
/// machine. Fragments write raw bytes and are responsible for escaping the
/// dynamic values they interpolate.
pub trait Templates: Send + Sync {
    /// Document head up to and including the opening `<body>`.
    fn head(&self, out: &mut Vec<u8>, pc: &ProxyConfig, script_name: &str, lang: Option<&str>);

    /// Closing counterpart of [`Templates::head`].
    fn foot(&self, out: &mut Vec<u8>, pc: &ProxyConfig);

    /// Inline preview for an image link.
    fn figure(&self, out: &mut Vec<u8>, href: &str, label: &str);

    fn pre_open(&self, out: &mut Vec<u8>, alt: &str);

    fn pre_close(&self, out: &mut Vec<u8>);

    /// Error page body; `code` is the Gemini status when the origin answered
    /// with a failure class, or the CGI status for gateway-side errors.
    fn error_page(&self, out: &mut Vec<u8>, code: u16, meta: &str);

    /// Input form shown for Gemini status 1x; posts back to the same path.
    fn input_page(&self, out: &mut Vec<u8>, prompt: &str);
}

/// The stock skin.
pub struct DefaultTemplates;

impl Templates for DefaultTemplates {
    fn head(&self, out: &mut Vec<u8>, pc: &ProxyConfig, script_name: &str, lang: Option<&str>) {
        out.extend_from_slice(b"<!doctype html><html");
        if let Some(lang) = lang {
            out.extend_from_slice(b" lang='");
            html_escape_into(out, lang);
            out.extend_from_slice(b"'");
        }
        out.extend_from_slice(b"><head><meta charset='utf-8' />");
        out.extend_from_slice(b"<meta name='viewport' content='width=device-width, initial-scale=1' />");
        out.extend_from_slice(b"<title>");
        html_escape_into(out, &pc.host);
        out.extend_from_slice(b"</title>");
        if !pc.stylesheet.is_empty() {
            out.extend_from_slice(b"<link rel='stylesheet' href='");
            url_escape_into(out, &pc.stylesheet);
            out.extend_from_slice(b"' />");
        }
        out.extend_from_slice(b"</head><body>");
        if !pc.no_navbar {
            out.extend_from_slice(b"<header><nav><a href='");
            url_escape_into(out, script_name);
            out.extend_from_slice(b"'>");
            html_escape_into(out, &pc.host);
            out.extend_from_slice(b"</a></nav></header>");
        }
    }

    fn foot(&self, out: &mut Vec<u8>, pc: &ProxyConfig) {
        if !pc.no_footer {
            out.extend_from_slice(b"<footer><hr /><p>Proxied content from gemini://");
            html_escape_into(out, &pc.proxy_name);
            out.extend_from_slice(b"</p></footer>");
        }
        out.extend_from_slice(b"</body></html>");
    }

    fn figure(&self, out: &mut Vec<u8>, href: &str, label: &str) {
        out.extend_from_slice(b"<figure><a href='");
        url_escape_into(out, href);
        out.extend_from_slice(b"'><img src='");
        url_escape_into(out, href);
        out.extend_from_slice(b"' alt='");
        html_escape_into(out, label);
        out.extend_from_slice(b"' /></a><figcaption>");
        html_escape_into(out, label);
        out.extend_from_slice(b"</figcaption></figure>");
    }

    fn pre_open(&self, out: &mut Vec<u8>, alt: &str) {
        if alt.is_empty() {
            out.extend_from_slice(b"<pre>");
        } else {
            out.extend_from_slice(b"<pre aria-label='");
            html_escape_into(out, alt);
            out.extend_from_slice(b"'>");
        }
    }

    fn pre_close(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"</pre>");
    }

    fn error_page(&self, out: &mut Vec<u8>, code: u16, meta: &str) {
        out.extend_from_slice(b"<main><h1>Proxy error</h1><p>Request failed with code ");
        out.extend_from_slice(code.to_string().as_bytes());
        out.extend_from_slice(b": ");
        html_escape_into(out, meta);
        out.extend_from_slice(b"</p></main>");
    }

    fn input_page(&self, out: &mut Vec<u8>, prompt: &str) {
        out.extend_from_slice(b"<main><form method='post'><p><label>");
        html_escape_into(out, prompt);
        out.extend_from_slice(b" <input type='text' name='q' autofocus /></label></p>");
        out.extend_from_slice(b"<p><button type='submit'>Submit</button></p></form></main>");
    }
}
