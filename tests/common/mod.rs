//! Shared helpers: an in-memory response sink and a scripted Gemini origin.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use galileo::config::Config;
use galileo::proxy::{CgiRequest, Method, ResponseSink};
use galileo::state::Gateway;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Collects everything the proxy writes, plus the end-of-request flag.
#[derive(Default)]
pub struct MemorySink {
    pub out: Vec<u8>,
    pub ended: Option<bool>,
}

impl ResponseSink for MemorySink {
    async fn write_all(&mut self, buf: &[u8]) -> galileo::Result<()> {
        self.out.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> galileo::Result<()> {
        Ok(())
    }

    async fn end_request(&mut self, success: bool) -> galileo::Result<()> {
        if self.ended.is_none() {
            self.ended = Some(success);
        }
        Ok(())
    }
}

impl MemorySink {
    pub fn headers(&self) -> String {
        let split = self
            .out
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no header block");
        String::from_utf8_lossy(&self.out[..split + 2]).into_owned()
    }

    pub fn body(&self) -> &[u8] {
        let split = self
            .out
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no header block");
        &self.out[split + 4..]
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }
}

/// A one-shot origin that reads the request line and answers with a canned
/// response. The request line the proxy sent comes back on the channel.
pub async fn spawn_origin(response: Vec<u8>) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let line = read_request_line(&mut stream).await;
        let _ = tx.send(line);
        stream.write_all(&response).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    (addr, rx)
}

/// An origin that sends `head` and then holds the connection open without
/// ever finishing the body.
pub async fn spawn_stalling_origin(head: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_line(&mut stream).await;
        stream.write_all(&head).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    addr
}

async fn read_request_line<R: AsyncReadExt + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                line.push(byte[0]);
                if line.ends_with(b"\r\n") {
                    break;
                }
            }
        }
    }
    line
}

/// A gateway with a single plaintext proxy entry for `host`, pointed at a
/// local origin, with timeouts short enough for tests.
pub fn gateway_for(host: &str, origin: SocketAddr) -> Gateway {
    let raw = format!(
        r#"
[server]
connect_timeout_secs = 2
read_timeout_secs = 1
write_timeout_secs = 1

[[proxy]]
host = "{host}"
proxy_name = "{host}"
proxy_addr = "127.0.0.1"
proxy_port = "{port}"
no_tls = true
"#,
        port = origin.port()
    );
    Gateway::new(Config::parse(&raw).unwrap())
}

pub fn get_request(host: &str, path_info: &str) -> CgiRequest {
    CgiRequest {
        server_name: host.to_string(),
        script_name: "/script/".to_string(),
        path_info: path_info.to_string(),
        query: String::new(),
        method: Method::Get,
        content_type: String::new(),
        content_length: 0,
        body: None,
    }
}
