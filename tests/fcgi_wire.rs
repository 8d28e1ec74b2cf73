//! Drives a whole FastCGI connection over an in-memory duplex pipe, with a
//! scripted Gemini origin on the far side.

mod common;

use bytes::{Bytes, BytesMut};
use common::{gateway_for, spawn_origin};
use futures::{SinkExt, StreamExt};
use galileo::fcgi::record::{Record, RecordCodec, RecordType};
use galileo::fcgi::serve_connection;
use galileo::tmpl::DefaultTemplates;
use std::sync::Arc;
use tokio_util::codec::Framed;

const HOST: &str = "example.com";

fn params_payload(pairs: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        buf.extend_from_slice(&[name.len() as u8, value.len() as u8]);
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf.freeze()
}

fn begin_payload(keep_conn: bool) -> Bytes {
    let flags = if keep_conn { 1 } else { 0 };
    Bytes::copy_from_slice(&[0, 1, flags, 0, 0, 0, 0, 0])
}

#[tokio::test]
async fn test_full_request_over_fastcgi() {
    let (origin, _) = spawn_origin(b"20 text/gemini\r\n# Hi\r\n".to_vec()).await;
    let gateway = Arc::new(gateway_for(HOST, origin));

    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(
        server_side,
        gateway,
        Arc::new(DefaultTemplates),
    ));

    let mut client = Framed::new(client_side, RecordCodec);
    client
        .send(Record::new(RecordType::BeginRequest, 1, begin_payload(false)))
        .await
        .unwrap();
    client
        .send(Record::new(
            RecordType::Params,
            1,
            params_payload(&[
                ("SERVER_NAME", HOST),
                ("SCRIPT_NAME", "/script/"),
                ("PATH_INFO", "/"),
                ("REQUEST_METHOD", "GET"),
            ]),
        ))
        .await
        .unwrap();
    client
        .send(Record::new(RecordType::Params, 1, Bytes::new()))
        .await
        .unwrap();
    client
        .send(Record::new(RecordType::Stdin, 1, Bytes::new()))
        .await
        .unwrap();

    let mut stdout = Vec::new();
    let mut end_seen = false;
    while let Some(rec) = client.next().await {
        let rec = rec.unwrap();
        match rec.rtype {
            RecordType::Stdout => stdout.extend_from_slice(&rec.payload),
            RecordType::EndRequest => {
                // app status 0, request complete
                assert_eq!(&rec.payload[..5], &[0, 0, 0, 0, 0]);
                end_seen = true;
                break;
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
    assert!(end_seen);

    let response = String::from_utf8_lossy(&stdout);
    assert!(response.contains("Content-Type: text/html;charset=utf-8\r\n"));
    assert!(response.contains("<h1> Hi</h1>"), "{response}");

    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_multiplexing_is_refused() {
    let (origin, _) = spawn_origin(b"20 text/plain\r\nok".to_vec()).await;
    let gateway = Arc::new(gateway_for(HOST, origin));

    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(
        server_side,
        gateway,
        Arc::new(DefaultTemplates),
    ));

    let mut client = Framed::new(client_side, RecordCodec);
    client
        .send(Record::new(RecordType::BeginRequest, 1, begin_payload(false)))
        .await
        .unwrap();
    // a second request before the first finished
    client
        .send(Record::new(RecordType::BeginRequest, 2, begin_payload(false)))
        .await
        .unwrap();

    let rec = client.next().await.unwrap().unwrap();
    assert_eq!(rec.rtype, RecordType::EndRequest);
    assert_eq!(rec.request_id, 2);
    // protocol status byte says can't-multiplex
    assert_eq!(rec.payload[4], 1);

    // the first request still completes normally
    client
        .send(Record::new(
            RecordType::Params,
            1,
            params_payload(&[
                ("SERVER_NAME", HOST),
                ("SCRIPT_NAME", "/script/"),
                ("PATH_INFO", "/"),
                ("REQUEST_METHOD", "GET"),
            ]),
        ))
        .await
        .unwrap();
    client
        .send(Record::new(RecordType::Params, 1, Bytes::new()))
        .await
        .unwrap();
    client
        .send(Record::new(RecordType::Stdin, 1, Bytes::new()))
        .await
        .unwrap();

    let mut saw_body = false;
    while let Some(rec) = client.next().await {
        let rec = rec.unwrap();
        match rec.rtype {
            RecordType::Stdout => {
                if rec.payload.windows(2).any(|w| w == b"ok") {
                    saw_body = true;
                }
            }
            RecordType::EndRequest => {
                assert_eq!(rec.request_id, 1);
                break;
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
    assert!(saw_body);

    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_keep_conn_serves_sequential_requests() {
    let (origin_a, _) = spawn_origin(b"20 text/plain\r\nfirst".to_vec()).await;
    let gateway = Arc::new(gateway_for(HOST, origin_a));

    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(
        server_side,
        gateway.clone(),
        Arc::new(DefaultTemplates),
    ));

    let mut client = Framed::new(client_side, RecordCodec);

    for request_id in [1u16, 2] {
        // the scripted origin serves one connection; re-arm it per request
        if request_id == 2 {
            let (origin_b, _) = spawn_origin(b"20 text/plain\r\nsecond".to_vec()).await;
            gateway.reload(
                galileo::Config::parse(&format!(
                    r#"
[[proxy]]
host = "{HOST}"
proxy_name = "{HOST}"
proxy_addr = "127.0.0.1"
proxy_port = "{}"
no_tls = true
"#,
                    origin_b.port()
                ))
                .unwrap(),
            );
        }

        client
            .send(Record::new(
                RecordType::BeginRequest,
                request_id,
                begin_payload(true),
            ))
            .await
            .unwrap();
        client
            .send(Record::new(
                RecordType::Params,
                request_id,
                params_payload(&[
                    ("SERVER_NAME", HOST),
                    ("SCRIPT_NAME", "/script/"),
                    ("PATH_INFO", "/"),
                    ("REQUEST_METHOD", "GET"),
                ]),
            ))
            .await
            .unwrap();
        client
            .send(Record::new(RecordType::Params, request_id, Bytes::new()))
            .await
            .unwrap();
        client
            .send(Record::new(RecordType::Stdin, request_id, Bytes::new()))
            .await
            .unwrap();

        let mut stdout = Vec::new();
        while let Some(rec) = client.next().await {
            let rec = rec.unwrap();
            match rec.rtype {
                RecordType::Stdout => stdout.extend_from_slice(&rec.payload),
                RecordType::EndRequest => {
                    assert_eq!(rec.request_id, request_id);
                    break;
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
        let expected = if request_id == 1 { "first" } else { "second" };
        assert!(String::from_utf8_lossy(&stdout).contains(expected));
    }

    drop(client);
    server.await.unwrap().unwrap();
}
