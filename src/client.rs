//! Client connection types
//!
//! `ClientConnection` owns one accepted socket and is driven by its
//! worker task. `ClientHandle` is the shareable write side that the
//! registry keeps for broadcast fan-out.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::{HandshakeError, ServerError};
use crate::handshake::{self, HandshakeState};

/// Bytes requested from the socket per read
const READ_CHUNK: usize = 512;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4; used as the registry key and in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a connection
///
/// Cheap to clone. Writes are serialized by a mutex so a broadcast and
/// the owning worker never interleave frame bytes. With a write timeout
/// set, a peer that stops reading cannot hold the mutex past the
/// deadline; the handle is then marked closed for every clone.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    peer_addr: SocketAddr,
    writer: Arc<Mutex<BoxedWriter>>,
    closed: Arc<AtomicBool>,
    write_timeout: Option<Duration>,
}

impl ClientHandle {
    /// Wrap any async writer as a client handle
    pub fn new<W>(id: ClientId, peer_addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer_addr,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            closed: Arc::new(AtomicBool::new(false)),
            write_timeout: None,
        }
    }

    /// Bound each frame write, lock wait included
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True once closed locally or after a timed out write
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one text frame
    pub async fn write(&self, text: &str) -> Result<(), ServerError> {
        let frame = codec::encode_text(text)?;
        self.write_frame(&frame).await?;
        Ok(())
    }

    /// Send pre-encoded frame bytes
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "client closed"));
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };
        let Some(limit) = self.write_timeout else {
            return write.await;
        };

        match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => {
                // Part of the frame may already be on the wire
                warn!("Write to client {} timed out after {:?}", self.id, limit);
                self.closed.store(true, Ordering::Release);
                let shutdown = async { self.writer.lock().await.shutdown().await };
                if !matches!(tokio::time::timeout(limit, shutdown).await, Ok(Ok(()))) {
                    debug!("Shutting down stalled client {} did not complete", self.id);
                }
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
            }
        }
    }

    /// Send a close frame with the given status code
    pub async fn send_close(&self, code: u16) -> io::Result<()> {
        self.write_frame(&codec::encode_close(code)).await
    }

    /// Shut down the write side of the socket
    pub async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.writer.lock().await.shutdown().await
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One accepted client socket
///
/// Created blocking with no timeout. The handshake runs exactly once;
/// after it the worker usually switches to non-blocking reads.
pub struct ClientConnection {
    reader: OwnedReadHalf,
    handle: ClientHandle,
    /// Received bytes not yet decoded into a frame
    pending: Vec<u8>,
    blocking: bool,
    timeout: Option<Duration>,
    state: HandshakeState,
    max_request: usize,
}

impl ClientConnection {
    /// Wrap an accepted socket
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            handle: ClientHandle::new(ClientId::new(), peer_addr, writer),
            pending: Vec::new(),
            blocking: true,
            timeout: None,
            state: HandshakeState::AwaitingRequest,
            max_request: handshake::DEFAULT_MAX_REQUEST,
        }
    }

    /// Bound the size of the upgrade request
    pub fn with_max_request(mut self, max_request: usize) -> Self {
        self.max_request = max_request;
        self
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr
    }

    /// Bound every frame write on this connection
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handle.write_timeout = timeout;
        self
    }

    /// Shareable write side, as stored in the registry
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn is_upgraded(&self) -> bool {
        self.state == HandshakeState::Upgraded
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Bound blocking reads; `None` waits indefinitely
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// In non-blocking mode `read` returns immediately when no data is ready
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Perform the opening handshake
    pub async fn handshake(&mut self) -> Result<(), HandshakeError> {
        if self.is_upgraded() {
            return Err(HandshakeError::AlreadyUpgraded);
        }

        let rest = {
            let mut writer = self.handle.writer.lock().await;
            handshake::negotiate(&mut self.reader, &mut *writer, self.max_request, self.timeout)
                .await?
        };

        self.pending.extend_from_slice(&rest);
        self.state = HandshakeState::Upgraded;
        debug!("Client {} upgraded", self.handle.id);
        Ok(())
    }

    /// Next text message, or `None` when nothing complete is ready
    ///
    /// A blocking read that hits the timeout also yields `None`.
    /// Partial frames stay buffered for the next call.
    pub async fn read(&mut self) -> Result<Option<String>, ServerError> {
        if !self.is_upgraded() {
            return Err(ServerError::NotUpgraded);
        }
        if self.handle.is_closed() {
            return Err(ServerError::ConnectionClosed);
        }

        loop {
            if let Some(size) = codec::frame_len(&self.pending)? {
                if self.pending.len() >= size {
                    let decoded = codec::decode(&self.pending[..size])?;
                    self.pending.drain(..decoded.consumed);
                    trace!("Client {} sent {} bytes", self.handle.id, decoded.text.len());
                    return Ok(Some(decoded.text));
                }
            }

            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Send one text frame; transport errors propagate
    pub async fn write(&self, text: &str) -> Result<(), ServerError> {
        if !self.is_upgraded() {
            return Err(ServerError::NotUpgraded);
        }
        self.handle.write(text).await
    }

    /// Send a close frame with the given status code
    pub async fn send_close(&self, code: u16) -> io::Result<()> {
        self.handle.send_close(code).await
    }

    /// Shut the socket down
    pub async fn close(self) -> io::Result<()> {
        self.handle.close().await
    }

    /// Pull more bytes into `pending`; false when none were available
    async fn fill(&mut self) -> Result<bool, ServerError> {
        let mut chunk = [0u8; READ_CHUNK];

        let n = if self.blocking {
            let read = self.reader.read(&mut chunk);
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result?,
                    Err(_) => return Ok(false),
                },
                None => read.await?,
            }
        } else {
            match self.reader.try_read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        };

        if n == 0 {
            return Err(ServerError::ConnectionClosed);
        }
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(true)
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.handle.id)
            .field("peer_addr", &self.handle.peer_addr)
            .field("blocking", &self.blocking)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
