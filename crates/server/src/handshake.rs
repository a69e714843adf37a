//! HTTP/1.1 upgrade handshake codec
//!
//! Parses the request head an upgrading client sends, derives the
//! `Sec-WebSocket-Accept` value (RFC 6455 section 4.2.2) and formats the
//! success and reject responses.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::BufferPool;

/// Concatenated with the client key before hashing (RFC 6455 section 4.2.2)
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("malformed upgrade request")]
    MalformedUpgrade,

    #[error("i/o error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Case-insensitive header map; duplicate names keep the last value
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    /// Look up a header by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: &str, value: String) {
        self.entries.insert(name.to_ascii_lowercase(), value);
    }
}

/// The parsed request head of an upgrade attempt
#[derive(Debug, Clone)]
pub struct RequestHead {
    raw: String,
    headers: Headers,
}

impl RequestHead {
    /// Split the raw head on CRLF, then each header line on its first `:`,
    /// stripping one leading space from the value.
    pub fn parse(raw: String) -> Self {
        let mut headers = Headers::default();

        for line in raw.split("\r\n").skip(1) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.strip_prefix(' ').unwrap_or(value);
            headers.insert(name, value.to_owned());
        }

        RequestHead { raw, headers }
    }

    /// The raw head text as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The request line (`GET /path HTTP/1.1`)
    pub fn request_line(&self) -> &str {
        self.raw.split("\r\n").next().unwrap_or("")
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Derive the `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.trim().as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Read the request head from `stream`.
///
/// Reads until at least 3 bytes with a case-insensitive `GET` prefix and
/// the `\r\n\r\n` terminator have arrived. A disconnect first is
/// [`HandshakeError::ClosedDuringHandshake`]; a non-GET prefix is
/// [`HandshakeError::MalformedUpgrade`]. Bytes a pipelining client sent
/// past the terminator are returned alongside the head.
pub(crate) async fn read_request_head<S>(
    stream: &mut S,
    pool: &Arc<BufferPool>,
) -> Result<(RequestHead, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = pool.rent(0);
    let mut used = 0;

    let end = loop {
        if used == buf.capacity() {
            buf = pool.grow(buf, used);
        }

        let n = stream.read(&mut buf[used..]).await?;
        if n == 0 {
            return Err(HandshakeError::ClosedDuringHandshake);
        }
        used += n;

        if used >= 3 && !buf[..3].eq_ignore_ascii_case(b"GET") {
            return Err(HandshakeError::MalformedUpgrade);
        }

        if let Some(at) = head_end(&buf[..used]) {
            break at;
        }
    };

    let raw = String::from_utf8_lossy(&buf[..end]).into_owned();
    let leftover = buf[end..used].to_vec();
    Ok((RequestHead::parse(raw), leftover))
}

/// Index one past the `\r\n\r\n` terminator, if present
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|at| at + 4)
}

/// Write the `101 Switching Protocols` response
pub(crate) async fn write_accept_response<S>(
    stream: &mut S,
    pool: &Arc<BufferPool>,
    key: &str,
    extra_headers: &[(String, String)],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = pool.rent_text(256);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(&accept_key(key));
    response.push_str("\r\n");
    for (name, value) in extra_headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Write a reject response with the given status
pub(crate) async fn write_reject_response<S>(
    stream: &mut S,
    pool: &Arc<BufferPool>,
    status: u16,
    extra_headers: &[(String, String)],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = pool.rent_text(256);
    response.push_str("HTTP/1.1 ");
    response.push_str(&status.to_string());
    response.push_str(" ");
    response.push_str(reason_phrase(status));
    response.push_str("\r\n");
    for (name, value) in extra_headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// IANA reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
