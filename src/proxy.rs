//! The per-client proxy state machine.
//!
//! One task per request: route the virtual host, resolve and dial the Gemini
//! origin, perform the one-line exchange, then stream the body downstream
//! either verbatim or through the gemtext translator. Every exit path funnels
//! through [`handle_request`], which renders an error page while response
//! headers are still pending and flags the request as failed afterwards.

use std::io::Write as _;
use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_util::either::Either;
use tracing::{debug, warn};

use crate::config::{Config, ProxyConfig};
use crate::error::{GatewayError, Result};
use crate::gemini::{self, BodyMode, MAX_HEADER_LINE, ResponseHeader};
use crate::gemtext::Translator;
use crate::state::Gateway;
use crate::tmpl::Templates;
use crate::url::{self, Target};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

const CSP: &[u8] =
    b"Content-Security-Policy: default-src 'self'; script-src 'none'; object-src 'none'\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Unknown,
}

impl Method {
    pub fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => Method::Unknown,
        }
    }
}

/// A request as decoded from CGI variables by the FastCGI layer.
#[derive(Debug, Clone)]
pub struct CgiRequest {
    pub server_name: String,
    pub script_name: String,
    pub path_info: String,
    pub query: String,
    pub method: Method,
    pub content_type: String,
    pub content_length: usize,
    pub body: Option<Bytes>,
}

/// Downstream writer the proxy emits into: FastCGI stdout records in
/// production, a plain buffer in tests.
///
/// `end_request` must tolerate being called more than once; only the first
/// call takes effect.
#[allow(async_fn_in_trait)]
pub trait ResponseSink {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
    /// Logical completion of the response; `success = false` flags the
    /// request as failed to the web server.
    async fn end_request(&mut self, success: bool) -> Result<()>;
}

struct Client<'a, S: ResponseSink> {
    id: u32,
    req: &'a CgiRequest,
    sink: &'a mut S,
    tmpl: &'a dyn Templates,
    headers_done: bool,
}

/// Serve one request to completion. This is the single entry and the single
/// exit of the state machine: errors raised anywhere inside are rendered (or
/// swallowed, for a peer abort) right here.
pub async fn handle_request<S: ResponseSink>(
    gateway: &Gateway,
    tmpl: &dyn Templates,
    req: CgiRequest,
    sink: &mut S,
) {
    let id = gateway.next_client_id();
    let config = gateway.config();
    let mut clt = Client {
        id,
        req: &req,
        sink,
        tmpl,
        headers_done: false,
    };
    debug!(id, server_name = %req.server_name, path_info = %req.path_info, "serving request");

    match clt.run(gateway, &config).await {
        Ok(()) => debug!(id, "request completed"),
        Err(GatewayError::PeerAbort) => debug!(id, "peer went away, dropping response"),
        Err(err) => {
            warn!(id, error = %err, "request failed");
            if !clt.headers_done {
                let pc = config.find_proxy(&req.server_name);
                let status = err.cgi_status();
                let _ = clt.error_page(pc, status, status, &err.to_string()).await;
            }
            let _ = clt.sink.end_request(false).await;
        }
    }
}

impl<S: ResponseSink> Client<'_, S> {
    async fn run(&mut self, gateway: &Gateway, config: &Config) -> Result<()> {
        let req = self.req;

        if req.content_length > 0 && req.body.is_none() {
            return Err(GatewayError::BadRequest(
                "request announced a body but none arrived".to_string(),
            ));
        }
        if req.path_info.is_empty() {
            return Err(GatewayError::NotImplemented("no PATH_INFO".to_string()));
        }

        let Some(pc) = config.find_proxy(&req.server_name) else {
            return Err(GatewayError::NotImplemented(format!(
                "unknown server {:?}",
                req.server_name
            )));
        };

        // A POSTed form never reaches the origin: the submission is bounced
        // back as a GET with the body as query string, which is how Gemini
        // expects input to arrive.
        if req.method == Method::Post
            && let Some(body) = &req.body
        {
            let ct = req.content_type.split(';').next().unwrap_or("").trim();
            if !ct.eq_ignore_ascii_case(FORM_URLENCODED) {
                return Err(GatewayError::BadRequest(format!(
                    "unsupported content type {:?}",
                    req.content_type
                )));
            }
            let body = std::str::from_utf8(body).map_err(|_| {
                GatewayError::BadRequest("form body is not valid UTF-8".to_string())
            })?;
            let location = format!(
                "{}{}?{}",
                req.script_name,
                req.path_info.strip_prefix('/').unwrap_or(&req.path_info),
                body
            );
            self.emit_redirect(&location).await?;
            return self.sink.end_request(true).await;
        }

        let mut origin = self.dial(gateway, pc).await?;

        let line = gemini::request_line(&pc.proxy_name, &req.path_info, &req.query)?;
        timeout(gateway.write_timeout(), origin.write_all(line.as_bytes()))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout("sending the request"))??;

        let (header, leftover) = self.read_header(gateway, &mut origin).await?;
        debug!(id = self.id, code = header.code, meta = %header.meta, "origin replied");

        match header.class() {
            1 => self.input_page(pc, &header).await,
            2 => self.relay(gateway, pc, &header.meta, leftover, origin).await,
            3 => self.redirect(pc, &header).await,
            4 | 5 | 6 => {
                self.error_page(Some(pc), 501, header.code as u16, &header.meta)
                    .await?;
                self.sink.end_request(false).await
            }
            _ => Err(GatewayError::UpstreamProtocol(format!(
                "unhandled gemini status {}",
                header.code
            ))),
        }
    }

    /// Resolve the origin, try each candidate address with its own timeout,
    /// then wrap the winner in TLS unless the proxy entry says otherwise.
    async fn dial(
        &mut self,
        gateway: &Gateway,
        pc: &ProxyConfig,
    ) -> Result<Either<tokio_rustls::client::TlsStream<TcpStream>, TcpStream>> {
        let port: u16 = pc
            .proxy_port
            .parse()
            .map_err(|_| GatewayError::ConfigError(format!("invalid port {:?}", pc.proxy_port)))?;

        let addrs: Vec<_> = tokio::net::lookup_host((pc.proxy_addr.as_str(), port))
            .await
            .map_err(|e| {
                GatewayError::UpstreamUnreachable(format!(
                    "can't resolve host {}:{}: {}",
                    pc.proxy_addr, pc.proxy_port, e
                ))
            })?
            .collect();

        let connect_timeout = gateway.connect_timeout();
        let mut socket = None;
        for addr in addrs {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(s)) => {
                    socket = Some(s);
                    break;
                }
                Ok(Err(e)) => debug!(id = self.id, %addr, error = %e, "connect failed"),
                Err(_) => debug!(id = self.id, %addr, "connect timed out"),
            }
        }
        let Some(socket) = socket else {
            return Err(GatewayError::UpstreamUnreachable(format!(
                "can't connect to {}:{}",
                pc.proxy_addr, pc.proxy_port
            )));
        };

        if pc.no_tls {
            return Ok(Either::Right(socket));
        }

        let sni = ServerName::try_from(pc.proxy_name.clone()).map_err(|_| {
            GatewayError::UpstreamUnreachable(format!("invalid proxy name {:?}", pc.proxy_name))
        })?;
        let stream = timeout(connect_timeout, tls_connector().connect(sni, socket))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout("performing the TLS handshake"))?
            .map_err(|e| {
                GatewayError::UpstreamUnreachable(format!("TLS handshake failed: {}", e))
            })?;
        Ok(Either::Left(stream))
    }

    /// Read the one-line response header, strict CRLF. Returns whatever body
    /// bytes were already buffered past the header.
    async fn read_header<T: AsyncRead + Unpin>(
        &mut self,
        gateway: &Gateway,
        origin: &mut T,
    ) -> Result<(ResponseHeader, BytesMut)> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if let Some(i) = buf.windows(2).position(|w| w == b"\r\n") {
                let line = buf.split_to(i);
                buf.advance(2);
                let line = std::str::from_utf8(&line).map_err(|_| {
                    GatewayError::UpstreamProtocol("response header is not UTF-8".to_string())
                })?;
                return Ok((gemini::parse_header(line)?, buf));
            }
            if buf.len() >= MAX_HEADER_LINE {
                return Err(GatewayError::UpstreamProtocol(
                    "response header too long".to_string(),
                ));
            }

            let n = timeout(gateway.read_timeout(), origin.read_buf(&mut buf))
                .await
                .map_err(|_| GatewayError::UpstreamTimeout("waiting for the response header"))??;
            if n == 0 {
                return Err(GatewayError::UpstreamProtocol(
                    "origin closed before sending a header".to_string(),
                ));
            }
        }
    }

    /// Gemini status 1x: render the input form; the answer comes back as a
    /// POST which then turns into a query string.
    async fn input_page(&mut self, pc: &ProxyConfig, header: &ResponseHeader) -> Result<()> {
        self.emit_headers(200, "text/html").await?;
        let mut page = Vec::with_capacity(1024);
        self.tmpl.head(&mut page, pc, &self.req.script_name, None);
        self.tmpl.input_page(&mut page, &header.meta);
        self.tmpl.foot(&mut page, pc);
        self.sink.write_all(&page).await?;
        self.sink.end_request(true).await
    }

    /// Gemini status 3x: rewrite the target under the local mount when it
    /// stays on this virtual host; anything else would leak gemini:// URLs
    /// to the browser.
    async fn redirect(&mut self, pc: &ProxyConfig, header: &ResponseHeader) -> Result<()> {
        match url::resolve(
            &header.meta,
            &self.req.server_name,
            &self.req.script_name,
            &pc.proxy_port,
        ) {
            Target::Foreign(target) => {
                warn!(id = self.id, target = %target, "redirect leaves the proxied host");
                self.error_page(Some(pc), 501, 501, &format!("redirect to {}", target))
                    .await?;
                self.sink.end_request(false).await
            }
            Target::Local(path) | Target::Relative(path) => {
                self.emit_redirect(&path).await?;
                self.sink.end_request(true).await
            }
        }
    }

    /// Gemini status 2x: relay the body, translating when it is gemtext.
    async fn relay<T: AsyncRead + Unpin>(
        &mut self,
        gateway: &Gateway,
        pc: &ProxyConfig,
        meta: &str,
        leftover: BytesMut,
        mut origin: T,
    ) -> Result<()> {
        match gemini::parse_mime(meta)? {
            BodyMode::Passthrough { content_type } => {
                self.emit_headers(200, &content_type).await?;
                let mut buf = leftover;
                loop {
                    if !buf.is_empty() {
                        self.sink.write_all(&buf).await?;
                        buf.clear();
                    }
                    let n = timeout(gateway.read_timeout(), origin.read_buf(&mut buf))
                        .await
                        .map_err(|_| GatewayError::UpstreamTimeout("reading the response body"))??;
                    if n == 0 {
                        break;
                    }
                }
                self.sink.flush().await?;
                self.sink.end_request(true).await
            }
            BodyMode::Gemtext { lang } => {
                self.emit_headers(200, "text/html").await?;
                let mut out = Vec::with_capacity(4096);
                self.tmpl
                    .head(&mut out, pc, &self.req.script_name, lang.as_deref());
                let mut translator = Translator::new(
                    pc,
                    &self.req.server_name,
                    &self.req.script_name,
                    self.tmpl,
                );

                let mut buf = leftover;
                let mut failure = None;
                loop {
                    translator.feed(&buf, &mut out);
                    buf.clear();
                    if !out.is_empty() {
                        self.sink.write_all(&out).await?;
                        out.clear();
                    }
                    match timeout(gateway.read_timeout(), origin.read_buf(&mut buf)).await {
                        Ok(Ok(0)) => break,
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            failure = Some(GatewayError::from(e));
                            break;
                        }
                        Err(_) => {
                            failure =
                                Some(GatewayError::UpstreamTimeout("reading the response body"));
                            break;
                        }
                    }
                }

                // Close whatever structure is still open even when the body
                // was cut short, so the document stays well formed.
                translator.finish(&mut out);
                self.tmpl.foot(&mut out, pc);
                self.sink.write_all(&out).await?;
                self.sink.flush().await?;

                match failure {
                    None => self.sink.end_request(true).await,
                    Some(err) => Err(err),
                }
            }
        }
    }

    /// Emit the CGI header block. Exactly one block per request.
    async fn emit_headers(&mut self, status: u16, content_type: &str) -> Result<()> {
        debug_assert!(!self.headers_done);
        let mut h = Vec::with_capacity(160);
        if status != 200 {
            let _ = write!(h, "Status: {}\r\n", status);
        }
        if content_type == "text/html" {
            h.extend_from_slice(b"Content-Type: text/html;charset=utf-8\r\n");
        } else {
            let _ = write!(h, "Content-Type: {}\r\n", content_type);
        }
        h.extend_from_slice(CSP);
        h.extend_from_slice(b"\r\n");
        self.sink.write_all(&h).await?;
        self.headers_done = true;
        Ok(())
    }

    async fn emit_redirect(&mut self, location: &str) -> Result<()> {
        debug_assert!(!self.headers_done);
        let mut h = Vec::with_capacity(160);
        let _ = write!(h, "Status: 302\r\nLocation: {}\r\n", location);
        h.extend_from_slice(CSP);
        h.extend_from_slice(b"\r\n");
        self.sink.write_all(&h).await?;
        self.headers_done = true;
        Ok(())
    }

    /// Render a full error page; `shown_code` is what the page displays (the
    /// Gemini status when the origin failed, the CGI status otherwise).
    async fn error_page(
        &mut self,
        pc: Option<&ProxyConfig>,
        cgi_status: u16,
        shown_code: u16,
        meta: &str,
    ) -> Result<()> {
        self.emit_headers(cgi_status, "text/html").await?;
        let mut page = Vec::with_capacity(512);
        match pc {
            Some(pc) => {
                self.tmpl.head(&mut page, pc, &self.req.script_name, None);
                self.tmpl.error_page(&mut page, shown_code, meta);
                self.tmpl.foot(&mut page, pc);
            }
            None => {
                // routing failed, so there is no host chrome to wrap it in
                page.extend_from_slice(
                    b"<!doctype html><html><head><title>proxy error</title></head><body>",
                );
                self.tmpl.error_page(&mut page, shown_code, meta);
                page.extend_from_slice(b"</body></html>");
            }
        }
        self.sink.write_all(&page).await
    }
}

#[derive(Debug)]
struct NoCertVerification;

/// The origin's certificate chain is deliberately not verified: Gemini
/// servers overwhelmingly use self-signed certificates and the protocol
/// community leans on trust-on-first-use instead of the web PKI. Pinning is
/// future work.
impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

static TLS_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

fn tls_connector() -> TlsConnector {
    let config = TLS_CONFIG.get_or_init(|| {
        Arc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerification))
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("GET"), Method::Get);
        assert_eq!(Method::parse("POST"), Method::Post);
        assert_eq!(Method::parse("get"), Method::Unknown);
        assert_eq!(Method::parse("DELETE"), Method::Unknown);
    }
}
