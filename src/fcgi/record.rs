//! FastCGI record framing.
//!
//! Just enough of the protocol for a responder: fixed 8-byte headers, the
//! name-value pair encoding used by PARAMS, and the BEGIN/END request
//! bodies. Stream payloads are carried around as [`Bytes`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{GatewayError, Result};

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;

/// Largest payload a single record can carry.
pub const MAX_CONTENT: usize = u16::MAX as usize;

pub const FCGI_KEEP_CONN: u8 = 1;

pub const ROLE_RESPONDER: u16 = 1;

pub const STATUS_REQUEST_COMPLETE: u8 = 0;
pub const STATUS_CANT_MPX_CONN: u8 = 1;
pub const STATUS_UNKNOWN_ROLE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(v: u8) -> Self {
        match v {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            other => RecordType::Unknown(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(t: RecordType) -> u8 {
        match t {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub rtype: RecordType,
    pub request_id: u16,
    pub payload: Bytes,
}

impl Record {
    pub fn new(rtype: RecordType, request_id: u16, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_CONTENT);
        Self {
            rtype,
            request_id,
            payload,
        }
    }

    pub fn end_request(request_id: u16, app_status: u32, protocol_status: u8) -> Self {
        let mut body = BytesMut::with_capacity(8);
        body.put_u32(app_status);
        body.put_u8(protocol_status);
        body.put_bytes(0, 3);
        Self::new(RecordType::EndRequest, request_id, body.freeze())
    }
}

/// Decoded body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(GatewayError::BadRequest(
                "short BEGIN_REQUEST body".to_string(),
            ));
        }
        Ok(Self {
            role: u16::from_be_bytes([payload[0], payload[1]]),
            flags: payload[2],
        })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }
}

/// Parse a complete PARAMS stream into name/value pairs. Names are CGI
/// variable names and always UTF-8 in practice; values may be arbitrary
/// bytes.
pub fn parse_params(mut buf: &[u8]) -> Result<Vec<(String, Bytes)>> {
    let mut pairs = Vec::new();

    while !buf.is_empty() {
        let name_len = read_length(&mut buf)?;
        let value_len = read_length(&mut buf)?;
        if buf.len() < name_len + value_len {
            return Err(GatewayError::BadRequest(
                "truncated FastCGI name-value pair".to_string(),
            ));
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        let value = Bytes::copy_from_slice(&buf[name_len..name_len + value_len]);
        buf = &buf[name_len + value_len..];
        pairs.push((name, value));
    }

    Ok(pairs)
}

fn read_length(buf: &mut &[u8]) -> Result<usize> {
    let Some(&first) = buf.first() else {
        return Err(GatewayError::BadRequest(
            "truncated FastCGI length".to_string(),
        ));
    };
    if first < 0x80 {
        *buf = &buf[1..];
        return Ok(first as usize);
    }
    if buf.len() < 4 {
        return Err(GatewayError::BadRequest(
            "truncated FastCGI length".to_string(),
        ));
    }
    let len = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]) as usize;
    *buf = &buf[4..];
    Ok(len)
}

/// Frames [`Record`]s over a byte stream in both directions.
pub struct RecordCodec;

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let content_len = u16::from_be_bytes([src[4], src[5]]) as usize;
        let padding_len = src[6] as usize;
        let total = HEADER_LEN + content_len + padding_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_LEN);
        if header[0] != FCGI_VERSION_1 {
            return Err(GatewayError::BadRequest(format!(
                "unsupported FastCGI version {}",
                header[0]
            )));
        }
        let rtype = RecordType::from(header[1]);
        let request_id = u16::from_be_bytes([header[2], header[3]]);
        let payload = src.split_to(content_len).freeze();
        src.advance(padding_len);

        Ok(Some(Record {
            rtype,
            request_id,
            payload,
        }))
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = GatewayError;

    fn encode(&mut self, rec: Record, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HEADER_LEN + rec.payload.len());
        dst.put_u8(FCGI_VERSION_1);
        dst.put_u8(rec.rtype.into());
        dst.put_u16(rec.request_id);
        dst.put_u16(rec.payload.len() as u16);
        dst.put_u8(0); // no padding
        dst.put_u8(0); // reserved
        dst.extend_from_slice(&rec.payload);
        Ok(())
    }
}
