//! RFC6455 opening handshake
//!
//! Reads the HTTP upgrade request, computes the Sec-WebSocket-Accept
//! value and answers with `101 Switching Protocols`.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::HandshakeError;

/// GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default bound on the request header block
pub const DEFAULT_MAX_REQUEST: usize = 2048;

const KEY_HEADER: &str = "sec-websocket-key";

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Handshake progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the HTTP upgrade request
    AwaitingRequest,
    /// 101 sent, framed I/O only from here on
    Upgraded,
}

/// Parsed upgrade request
///
/// Header names are stored lowercased; the request line is kept
/// separately from the `key: value` lines.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub request_line: String,
    pub headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Parse a request header block
    pub fn parse(data: &str) -> Self {
        let mut lines = data.lines();
        let request_line = lines.next().unwrap_or_default().to_string();

        let headers = lines
            .filter_map(|line| line.split_once(": "))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Self {
            request_line,
            headers,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The client's Sec-WebSocket-Key
    pub fn key(&self) -> Result<&str, HandshakeError> {
        self.header(KEY_HEADER)
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)
    }
}

/// Compute `base64(SHA-1(key ++ GUID))`
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response
pub fn build_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
}

/// Run the server side of the opening handshake
///
/// Reads until the blank line that ends the header block, bounded by
/// `max_request` bytes and `timeout`. Returns any bytes that arrived
/// after the header block; they belong to the first frame.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    max_request: usize,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let read = read_request(reader, max_request);
    let (head, rest) = match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| HandshakeError::Timeout)??,
        None => read.await?,
    };

    let text = std::str::from_utf8(&head).map_err(|_| HandshakeError::Malformed("non UTF-8 request"))?;
    let request = HandshakeRequest::parse(text);
    debug!("Upgrade request: {}", request.request_line);

    let key = match request.key() {
        Ok(key) => key,
        Err(e) => {
            let _ = writer.write_all(BAD_REQUEST).await;
            return Err(e);
        }
    };

    let response = build_response(&accept_key(key));
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;

    Ok(rest)
}

/// Read the header block, split off anything after it
async fn read_request<R>(reader: &mut R, max_request: usize) -> Result<(Vec<u8>, Vec<u8>), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(max_request.min(DEFAULT_MAX_REQUEST));
    let mut chunk = [0u8; 512];

    loop {
        if let Some(end) = find_header_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() >= max_request {
            return Err(HandshakeError::RequestTooLarge(max_request));
        }

        let want = chunk.len().min(max_request - buf.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Offset just past the `\r\n\r\n` terminator
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
