//! MSRP framing.
//!
//! One frame is a start line, headers, an optional body after a blank line,
//! and an end line `-------<tx-id><flag>` where the flag is `$` (last
//! chunk), `+` (more chunks follow) or `#` (transfer aborted).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::message::Headers;

pub const MSRP_VERSION: &str = "MSRP";
const END_LINE_DASHES: &str = "-------";

/// Chunk continuation marker carried on the end line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// `+`: more chunks of the same message follow.
    More,
    /// `$`: this chunk completes the message.
    Last,
    /// `#`: the sender aborted the transfer.
    Aborted,
}

impl Continuation {
    pub fn as_char(self) -> char {
        match self {
            Continuation::More => '+',
            Continuation::Last => '$',
            Continuation::Aborted => '#',
        }
    }

    fn from_byte(byte: u8) -> Option<Continuation> {
        match byte {
            b'+' => Some(Continuation::More),
            b'$' => Some(Continuation::Last),
            b'#' => Some(Continuation::Aborted),
            _ => None,
        }
    }
}

/// `Byte-Range` header value: 1-based inclusive `first-last/total`, where
/// `last` and `total` may be `*` while still unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub first: u64,
    pub last: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn new(first: u64, last: u64, total: u64) -> Self {
        ByteRange {
            first,
            last: Some(last),
            total: Some(total),
        }
    }

    pub fn parse(value: &str) -> Option<ByteRange> {
        let (range, total) = value.trim().split_once('/')?;
        let (first, last) = range.split_once('-')?;
        Some(ByteRange {
            first: first.trim().parse().ok()?,
            last: wildcard(last)?,
            total: wildcard(total)?,
        })
    }
}

fn wildcard(part: &str) -> Option<Option<u64>> {
    let part = part.trim();
    if part == "*" {
        Some(None)
    } else {
        part.parse().ok().map(Some)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.first)?;
        match self.last {
            Some(last) => write!(f, "{}", last)?,
            None => f.write_str("*")?,
        }
        f.write_str("/")?;
        match self.total {
            Some(total) => write!(f, "{}", total),
            None => f.write_str("*"),
        }
    }
}

/// A SEND or REPORT request.
#[derive(Debug, Clone)]
pub struct MsrpRequest {
    pub tx_id: String,
    pub method: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub continuation: Continuation,
}

impl MsrpRequest {
    pub fn new(tx_id: impl Into<String>, method: impl Into<String>) -> Self {
        MsrpRequest {
            tx_id: tx_id.into(),
            method: method.into(),
            headers: Headers::new(),
            body: None,
            continuation: Continuation::Last,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get("Message-ID")
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        self.headers.get("Byte-Range").and_then(ByteRange::parse)
    }
}

/// A transaction response (`MSRP <tx-id> <code> <reason>`).
#[derive(Debug, Clone)]
pub struct MsrpResponse {
    pub tx_id: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
}

impl MsrpResponse {
    pub fn new(tx_id: impl Into<String>, status_code: u16, reason: impl Into<String>) -> Self {
        MsrpResponse {
            tx_id: tx_id.into(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MsrpMessage {
    Request(MsrpRequest),
    Response(MsrpResponse),
}

impl From<MsrpRequest> for MsrpMessage {
    fn from(r: MsrpRequest) -> Self {
        MsrpMessage::Request(r)
    }
}

impl From<MsrpResponse> for MsrpMessage {
    fn from(r: MsrpResponse) -> Self {
        MsrpMessage::Response(r)
    }
}

/// Random transaction identifier for one request/response exchange.
pub fn generate_transaction_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Debug, Default)]
pub struct MsrpCodec;

impl Encoder<MsrpMessage> for MsrpCodec {
    type Error = Error;

    fn encode(&mut self, item: MsrpMessage, dst: &mut BytesMut) -> Result<()> {
        match item {
            MsrpMessage::Request(req) => {
                dst.put_slice(
                    format!("{} {} {}\r\n", MSRP_VERSION, req.tx_id, req.method).as_bytes(),
                );
                put_headers(dst, &req.headers);
                if let Some(body) = &req.body {
                    dst.put_slice(b"\r\n");
                    dst.put_slice(body);
                    dst.put_slice(b"\r\n");
                }
                put_end_line(dst, &req.tx_id, req.continuation);
            }
            MsrpMessage::Response(resp) => {
                dst.put_slice(
                    format!(
                        "{} {} {} {}\r\n",
                        MSRP_VERSION, resp.tx_id, resp.status_code, resp.reason
                    )
                    .as_bytes(),
                );
                put_headers(dst, &resp.headers);
                put_end_line(dst, &resp.tx_id, Continuation::Last);
            }
        }
        Ok(())
    }
}

fn put_headers(dst: &mut BytesMut, headers: &Headers) {
    for (name, value) in headers.iter() {
        dst.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
}

fn put_end_line(dst: &mut BytesMut, tx_id: &str, continuation: Continuation) {
    dst.put_slice(
        format!("{}{}{}\r\n", END_LINE_DASHES, tx_id, continuation.as_char()).as_bytes(),
    );
}

impl Decoder for MsrpCodec {
    type Item = MsrpMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MsrpMessage>> {
        let Some(line_end) = find(src, b"\r\n") else {
            return Ok(None);
        };
        let start_line = std::str::from_utf8(&src[..line_end])
            .map_err(|_| Error::MsrpParse("start line is not UTF-8".into()))?;

        let rest = start_line
            .strip_prefix("MSRP ")
            .ok_or_else(|| Error::MsrpParse(format!("bad start line: {}", start_line)))?;
        let (tx_id, tail) = rest
            .split_once(' ')
            .ok_or_else(|| Error::MsrpParse(format!("bad start line: {}", start_line)))?;
        let tx_id = tx_id.to_string();
        let tail = tail.to_string();

        // The frame ends at `-------<tx-id><flag>\r\n`.
        let end_marker = format!("{}{}", END_LINE_DASHES, tx_id).into_bytes();
        let Some(end_pos) = find(&src[line_end..], &end_marker).map(|p| p + line_end) else {
            return Ok(None);
        };
        let tail_start = end_pos + end_marker.len();
        if src.len() < tail_start + 3 {
            return Ok(None);
        }
        let continuation = Continuation::from_byte(src[tail_start])
            .ok_or_else(|| Error::MsrpParse("bad continuation flag".into()))?;
        if &src[tail_start + 1..tail_start + 3] != b"\r\n" {
            return Err(Error::MsrpParse("end line not CRLF-terminated".into()));
        }

        let frame = src.split_to(tail_start + 3).freeze();
        let head_start = line_end + 2;

        // A blank line before the end line separates headers from body.
        let (headers, body) = match find(&frame[head_start..end_pos], b"\r\n\r\n") {
            Some(blank) => {
                let blank = blank + head_start;
                let body_start = blank + 4;
                // The body is always followed by CRLF before the end line.
                if end_pos < body_start + 2 {
                    return Err(Error::MsrpParse("truncated body".into()));
                }
                (
                    parse_headers(&frame[head_start..blank])?,
                    Some(frame.slice(body_start..end_pos - 2)),
                )
            }
            None => (parse_headers(&frame[head_start..end_pos])?, None),
        };

        let mut tokens = tail.splitn(2, ' ');
        let first = tokens.next().unwrap_or_default();
        if let Ok(status_code) = first.parse::<u16>() {
            let reason = tokens.next().unwrap_or_default().to_string();
            return Ok(Some(
                MsrpResponse {
                    tx_id,
                    status_code,
                    reason,
                    headers,
                }
                .into(),
            ));
        }

        Ok(Some(
            MsrpRequest {
                tx_id,
                method: first.to_string(),
                headers,
                body,
                continuation,
            }
            .into(),
        ))
    }
}

fn parse_headers(raw: &[u8]) -> Result<Headers> {
    let raw =
        std::str::from_utf8(raw).map_err(|_| Error::MsrpParse("headers are not UTF-8".into()))?;
    let mut headers = Headers::new();
    for line in raw.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MsrpParse(format!("bad header line: {}", line)))?;
        headers.push(name.trim(), value.trim().to_string());
    }
    Ok(headers)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
