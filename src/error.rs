//! Error types
//!
//! Every failure is local to one connection: the connection task returns one
//! of these and its cleanup runs, nothing else is affected.

use thiserror::Error;

use crate::registry::RegistryError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for a connection or server operation
#[derive(Debug, Error)]
pub enum Error {
    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake failure, fatal to the connection
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Malformed chunk or message framing, fatal to the connection
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed AMF payload
    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    /// Registry refused an operation
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The authorization handler declined the application
    #[error("connect rejected for app '{0}'")]
    ConnectRejected(String),

    /// The authorization handler declined the publish key
    #[error("publish rejected for '{0}'")]
    PublishRejected(String),

    /// The authorization handler declined the play key
    #[error("play rejected for '{0}'")]
    PlayRejected(String),

    /// No traffic within the idle window
    #[error("operation timed out")]
    Timeout,

    /// Peer closed the transport
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl Error {
    /// Whether this error ended the connection during the handshake
    pub fn is_handshake(&self) -> bool {
        matches!(self, Error::Handshake(_))
    }
}

/// Handshake failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// C0 carried a version other than 3
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),

    /// C2 did not echo our S1
    #[error("C2 does not echo S1 (first mismatch at byte {0})")]
    EchoMismatch(usize),

    /// The handshake did not complete before its deadline
    #[error("handshake timed out")]
    Timeout,

    /// Peer sent bytes out of sequence
    #[error("unexpected handshake data in state {0}")]
    UnexpectedData(&'static str),
}

/// Chunk and message framing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A compressed chunk header referenced a chunk stream with no prior header
    #[error("chunk stream {0} has no previous header to inherit")]
    MissingChunkHeader(u32),

    /// Declared message length exceeds the sanity bound
    #[error("message length {0} exceeds limit {1}")]
    MessageTooLarge(u32, u32),

    /// Set Chunk Size carried an out-of-range value
    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    /// A control message body was too short
    #[error("truncated {0} message")]
    Truncated(&'static str),

    /// Command arrived in a session phase that does not accept it
    #[error("'{command}' not allowed in phase {phase}")]
    InvalidState {
        command: String,
        phase: &'static str,
    },

    /// Media or command referenced a message stream never created
    #[error("unknown message stream {0}")]
    StreamNotFound(u32),

    /// A message that should not come from this peer
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// AMF decoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmfError {
    /// Buffer ended mid-value
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    /// Type marker not part of AMF0
    #[error("unknown AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    /// String bytes were not UTF-8
    #[error("invalid UTF-8 in AMF string")]
    InvalidUtf8,

    /// Reference index pointed past the reference table
    #[error("invalid AMF reference {0}")]
    InvalidReference(u16),

    /// Objects nested beyond the depth limit
    #[error("AMF nesting too deep")]
    NestingTooDeep,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: Error = HandshakeError::InvalidVersion(6).into();
        assert!(err.is_handshake());
        assert_eq!(err.to_string(), "handshake failed: unsupported RTMP version 6");

        let err: Error = ProtocolError::MissingChunkHeader(5).into();
        assert!(!err.is_handshake());
        assert!(matches!(err, Error::Protocol(ProtocolError::MissingChunkHeader(5))));

        assert!(Error::from(HandshakeError::Timeout).is_handshake());
        assert!(!Error::Timeout.is_handshake());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
