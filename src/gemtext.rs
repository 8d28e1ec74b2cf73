//! Streaming gemtext to HTML translation.
//!
//! The translator is line oriented: it buffers raw origin bytes, consumes
//! only complete (CRLF or LF terminated) lines, and keeps just enough state
//! to group consecutive bullets into `<ul>`, consecutive links into
//! `<nav><ul>`, and fenced blocks into `<pre>`. Whatever structure is still
//! open when the origin closes is flushed by [`Translator::finish`].

use bytes::BytesMut;

use crate::config::ProxyConfig;
use crate::tmpl::Templates;
use crate::url;

/// Escape text content for HTML. Quotes are included so the same routine is
/// safe inside single-quoted attribute values.
pub fn html_escape_into(out: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        match b {
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'&' => out.extend_from_slice(b"&amp;"),
            b'\'' => out.extend_from_slice(b"&#39;"),
            _ => out.push(b),
        }
    }
}

/// Escape the few characters that would break out of a single-quoted `href`.
pub fn url_escape_into(out: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        match b {
            b' ' | b'\t' | b'\'' | b'\\' => {
                out.push(b'%');
                out.extend_from_slice(format!("{:02X}", b).as_bytes());
            }
            _ => out.push(b),
        }
    }
}

pub struct Translator<'a> {
    pc: &'a ProxyConfig,
    server_name: &'a str,
    script_name: &'a str,
    tmpl: &'a dyn Templates,
    pending: BytesMut,
    in_pre: bool,
    in_list: bool,
    in_nav: bool,
}

impl<'a> Translator<'a> {
    pub fn new(
        pc: &'a ProxyConfig,
        server_name: &'a str,
        script_name: &'a str,
        tmpl: &'a dyn Templates,
    ) -> Self {
        Self {
            pc,
            server_name,
            script_name,
            tmpl,
            pending: BytesMut::new(),
            in_pre: false,
            in_list: false,
            in_nav: false,
        }
    }

    /// Buffer a chunk of origin bytes and translate every complete line in
    /// it. The unterminated tail stays buffered until more data (or EOF)
    /// arrives, so the translator never reads ahead of what the origin sent.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(chunk);

        while let Some(nl) = self.pending.iter().position(|&b| b == b'\n') {
            let mut raw = self.pending.split_to(nl + 1);
            raw.truncate(nl);
            if raw.last() == Some(&b'\r') {
                raw.truncate(raw.len() - 1);
            }
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.line(&line, out);
        }
    }

    /// Flush on clean EOF: translate a trailing unterminated line, then close
    /// whatever structure is still open, pre first, then list, then nav.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.line(&line, out);
        }
        if self.in_pre {
            self.in_pre = false;
            self.tmpl.pre_close(out);
        }
        self.close_list(out);
        self.close_nav(out);
    }

    fn close_list(&mut self, out: &mut Vec<u8>) {
        if self.in_list {
            self.in_list = false;
            out.extend_from_slice(b"</ul>");
        }
    }

    fn close_nav(&mut self, out: &mut Vec<u8>) {
        if self.in_nav {
            self.in_nav = false;
            out.extend_from_slice(b"</ul></nav>");
        }
    }

    fn line(&mut self, line: &str, out: &mut Vec<u8>) {
        // Inside a fence everything is verbatim until the closing fence.
        if self.in_pre {
            if line.starts_with("```") {
                self.in_pre = false;
                self.tmpl.pre_close(out);
                return;
            }
            html_escape_into(out, line);
            out.push(b'\n');
            return;
        }

        if let Some(alt) = line.strip_prefix("```") {
            self.close_list(out);
            self.close_nav(out);
            self.in_pre = true;
            self.tmpl.pre_open(out, alt.trim_start());
            return;
        }

        if let Some(rest) = line.strip_prefix("* ") {
            self.close_nav(out);
            if !self.in_list {
                self.in_list = true;
                out.extend_from_slice(b"<ul>");
            }
            out.extend_from_slice(b"<li>");
            html_escape_into(out, rest);
            out.extend_from_slice(b"</li>");
            return;
        }

        if let Some(rest) = line.strip_prefix("=>") {
            self.close_list(out);
            self.link(rest, out);
            return;
        }

        if let Some(rest) = line.strip_prefix('>') {
            self.close_list(out);
            self.close_nav(out);
            out.extend_from_slice(b"<blockquote>");
            html_escape_into(out, rest);
            out.extend_from_slice(b"</blockquote>");
            return;
        }

        for (prefix, open, close) in [
            ("###", &b"<h3>"[..], &b"</h3>"[..]),
            ("##", &b"<h2>"[..], &b"</h2>"[..]),
            ("#", &b"<h1>"[..], &b"</h1>"[..]),
        ] {
            if let Some(rest) = line.strip_prefix(prefix) {
                self.close_list(out);
                self.close_nav(out);
                out.extend_from_slice(open);
                html_escape_into(out, rest);
                out.extend_from_slice(close);
                return;
            }
        }

        if line.is_empty() {
            self.close_list(out);
            self.close_nav(out);
            return;
        }

        self.close_list(out);
        self.close_nav(out);
        out.extend_from_slice(b"<p>");
        html_escape_into(out, line);
        out.extend_from_slice(b"</p>");
    }

    /// `rest` is the line after the `=>` marker: whitespace, the target URL,
    /// then an optional label after the first whitespace run. Without a label
    /// the URL doubles as one.
    fn link(&mut self, rest: &str, out: &mut Vec<u8>) {
        let rest = rest.trim_start_matches([' ', '\t']);
        let (target, label) = match rest.find([' ', '\t']) {
            Some(i) => {
                let label = rest[i..].trim_start_matches([' ', '\t']);
                (&rest[..i], if label.is_empty() { &rest[..i] } else { label })
            }
            None => (rest, rest),
        };

        let resolved = url::resolve(target, self.server_name, self.script_name, &self.pc.proxy_port);
        let href = resolved.href();

        if url::is_image(href) && !self.pc.no_imgprv {
            self.close_nav(out);
            self.tmpl.figure(out, href, label);
            return;
        }

        if !self.in_nav {
            self.in_nav = true;
            out.extend_from_slice(b"<nav><ul>");
        }
        out.extend_from_slice(b"<li><a href='");
        url_escape_into(out, href);
        out.extend_from_slice(b"'>");
        html_escape_into(out, label);
        out.extend_from_slice(b"</a></li>");
    }
}
