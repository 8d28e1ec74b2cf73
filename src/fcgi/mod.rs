//! FastCGI responder.
//!
//! The accept loop admits connections against the in-flight cap, and each
//! connection task decodes records until it has a complete request (params
//! stream closed, stdin stream closed), hands it to the proxy, and frames the
//! response back as STDOUT records. Multiplexed requests on one connection
//! are refused with `FCGI_CANT_MPX_CONN`; web servers don't send them.

pub mod record;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::proxy::{self, CgiRequest, Method, ResponseSink};
use crate::state::{Gateway, InflightGuard};
use crate::tmpl::Templates;

use record::{
    BeginRequest, MAX_CONTENT, Record, RecordCodec, RecordType, ROLE_RESPONDER,
    STATUS_CANT_MPX_CONN, STATUS_REQUEST_COMPLETE, STATUS_UNKNOWN_ROLE,
};

/// Accept loop. Runs until the listener errors out or the task is dropped.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    tmpl: Arc<dyn Templates>,
) -> Result<()> {
    loop {
        if !gateway.try_admit() {
            warn!(inflight = gateway.inflight(), "at capacity, pausing accept");
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }
        let guard = InflightGuard::new(gateway.clone());

        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted fastcgi connection");
                let gateway = gateway.clone();
                let tmpl = tmpl.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = serve_connection(stream, gateway, tmpl).await {
                        debug!(error = %err, "fastcgi connection error");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                drop(guard);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

struct PendingRequest {
    id: u16,
    keep_conn: bool,
    params: BytesMut,
    params_done: bool,
    stdin: BytesMut,
}

impl PendingRequest {
    fn new(id: u16, keep_conn: bool) -> Self {
        Self {
            id,
            keep_conn,
            params: BytesMut::new(),
            params_done: false,
            stdin: BytesMut::new(),
        }
    }

    fn into_request(self) -> Result<CgiRequest> {
        let mut server_name = String::new();
        let mut script_name = String::new();
        let mut path_info = String::new();
        let mut query = String::new();
        let mut method = Method::Unknown;
        let mut content_type = String::new();
        let mut content_length = 0usize;

        for (name, value) in record::parse_params(&self.params)? {
            let value = String::from_utf8_lossy(&value).into_owned();
            match name.as_str() {
                "SERVER_NAME" => server_name = value,
                "SCRIPT_NAME" => script_name = value,
                "PATH_INFO" => path_info = value,
                "QUERY_STRING" => query = value,
                "REQUEST_METHOD" => method = Method::parse(&value),
                "CONTENT_TYPE" => content_type = value,
                "CONTENT_LENGTH" => content_length = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        let body = if self.stdin.is_empty() {
            None
        } else {
            Some(self.stdin.freeze())
        };

        Ok(CgiRequest {
            server_name,
            script_name,
            path_info,
            query,
            method,
            content_type,
            content_length,
            body,
        })
    }
}

/// Drive one FastCGI connection: at most one request in flight, looping for
/// the next request when the web server asked to keep the connection.
pub async fn serve_connection<T: AsyncRead + AsyncWrite + Unpin>(
    stream: T,
    gateway: Arc<Gateway>,
    tmpl: Arc<dyn Templates>,
) -> Result<()> {
    let (rd, wr) = tokio::io::split(stream);
    let mut records = FramedRead::new(rd, RecordCodec);
    let mut frames = FramedWrite::new(wr, RecordCodec);

    let mut pending: Option<PendingRequest> = None;

    while let Some(rec) = records.next().await {
        let rec = rec?;
        match rec.rtype {
            RecordType::BeginRequest => {
                let begin = BeginRequest::parse(&rec.payload)?;
                if pending.is_some() {
                    frames
                        .send(Record::end_request(rec.request_id, 0, STATUS_CANT_MPX_CONN))
                        .await?;
                    continue;
                }
                if begin.role != ROLE_RESPONDER {
                    frames
                        .send(Record::end_request(rec.request_id, 0, STATUS_UNKNOWN_ROLE))
                        .await?;
                    continue;
                }
                pending = Some(PendingRequest::new(rec.request_id, begin.keep_conn()));
            }
            RecordType::Params => {
                let Some(p) = pending.as_mut().filter(|p| p.id == rec.request_id) else {
                    continue;
                };
                if rec.payload.is_empty() {
                    p.params_done = true;
                } else {
                    p.params.extend_from_slice(&rec.payload);
                }
            }
            RecordType::Stdin => {
                let Some(p) = pending.as_mut().filter(|p| p.id == rec.request_id) else {
                    continue;
                };
                if !rec.payload.is_empty() {
                    p.stdin.extend_from_slice(&rec.payload);
                    continue;
                }

                // empty STDIN record: the request is complete, dispatch it
                let p = pending.take().expect("pending request");
                if !p.params_done {
                    warn!(request_id = p.id, "stdin closed before the params stream");
                }
                let keep_conn = p.keep_conn;
                let request_id = p.id;
                let req = p.into_request()?;

                let mut sink = FcgiSink::new(&mut frames, request_id);
                proxy::handle_request(&gateway, tmpl.as_ref(), req, &mut sink).await;
                if sink.broken {
                    return Ok(());
                }
                if !keep_conn {
                    return Ok(());
                }
            }
            RecordType::AbortRequest => {
                if let Some(p) = pending.take_if(|p| p.id == rec.request_id) {
                    debug!(request_id = p.id, "request aborted before dispatch");
                    frames
                        .send(Record::end_request(p.id, 1, STATUS_REQUEST_COMPLETE))
                        .await?;
                }
            }
            other => debug!(?other, request_id = rec.request_id, "ignoring record"),
        }
    }

    Ok(())
}

/// [`ResponseSink`] framing response bytes into STDOUT records for one
/// request id.
pub struct FcgiSink<'a, W: AsyncWrite + Unpin> {
    frames: &'a mut FramedWrite<W, RecordCodec>,
    request_id: u16,
    ended: bool,
    broken: bool,
}

impl<'a, W: AsyncWrite + Unpin> FcgiSink<'a, W> {
    pub fn new(frames: &'a mut FramedWrite<W, RecordCodec>, request_id: u16) -> Self {
        Self {
            frames,
            request_id,
            ended: false,
            broken: false,
        }
    }

    async fn send(&mut self, rec: Record) -> Result<()> {
        if self.frames.send(rec).await.is_err() {
            self.broken = true;
            return Err(GatewayError::PeerAbort);
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> ResponseSink for FcgiSink<'_, W> {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(MAX_CONTENT) {
            let rec = Record::new(
                RecordType::Stdout,
                self.request_id,
                Bytes::copy_from_slice(chunk),
            );
            self.send(rec).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.frames.flush().await.is_err() {
            self.broken = true;
            return Err(GatewayError::PeerAbort);
        }
        Ok(())
    }

    async fn end_request(&mut self, success: bool) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        // close the stdout stream, then report completion
        self.send(Record::new(RecordType::Stdout, self.request_id, Bytes::new()))
            .await?;
        let app_status = if success { 0 } else { 1 };
        self.send(Record::end_request(
            self.request_id,
            app_status,
            STATUS_REQUEST_COMPLETE,
        ))
        .await?;
        self.flush().await
    }
}
