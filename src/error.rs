//! Error types for the WebSocket server
//!
//! Frame faults, handshake faults and server-level errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::codec::close_code;

/// Frame-level protocol violations
///
/// Returned from decode as a value so the caller decides between
/// closing the connection and propagating further.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the header or declared payload require
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Fragmented frames are not supported
    #[error("FIN bit not set")]
    FinNotSet,

    /// Anything but a text frame, including close
    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),

    /// Client frames must be masked
    #[error("client frame is not masked")]
    Unmasked,

    /// 64-bit extended payload length marker
    #[error("extended payload length is not supported")]
    ExtendedLength,

    /// Outbound text longer than a 7-bit length can carry
    #[error("payload of {0} bytes exceeds the 126 byte limit")]
    PayloadTooLarge(usize),

    /// Text payload is not UTF-8
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Close status sent to the peer before tearing the connection down
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::UnsupportedOpcode(op) if *op == crate::codec::Opcode::Close as u8 => {
                close_code::NORMAL
            }
            ProtocolError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            ProtocolError::ExtendedLength | ProtocolError::PayloadTooLarge(_) => {
                close_code::TOO_BIG
            }
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Opening handshake failures (fatal to that connection only)
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Request carried no Sec-WebSocket-Key header
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Header block did not fit in the buffer
    #[error("upgrade request exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// Request could not be parsed
    #[error("malformed upgrade request: {0}")]
    Malformed(&'static str),

    /// Peer closed before finishing the request
    #[error("connection closed during handshake")]
    ConnectionClosed,

    /// No complete request within the configured timeout
    #[error("handshake timed out")]
    Timeout,

    /// Handshake runs once per connection
    #[error("connection already upgraded")]
    AlreadyUpgraded,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-level errors
///
/// Covers per-connection faults (caught at the worker boundary)
/// and faults that escape the accept loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed or unsupported frame
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Opening handshake failed
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// IO error (transport fault)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the socket
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Framed I/O attempted before the handshake
    #[error("connection not upgraded")]
    NotUpgraded,

    /// Registry coordinator is gone
    #[error("connection registry closed")]
    RegistryClosed,

    /// Config file could not be parsed
    #[error("JSON config error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("invalid config: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(ProtocolError::UnsupportedOpcode(0x8).close_code(), 1000);
        assert_eq!(ProtocolError::UnsupportedOpcode(0x2).close_code(), 1002);
        assert_eq!(ProtocolError::Unmasked.close_code(), 1002);
        assert_eq!(ProtocolError::InvalidUtf8.close_code(), 1007);
        assert_eq!(ProtocolError::ExtendedLength.close_code(), 1009);
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: ServerError = ProtocolError::FinNotSet.into();
        assert!(matches!(err, ServerError::Protocol(ProtocolError::FinNotSet)));
    }
}
