//! Transport error types.

use std::sync::Arc;

use thiserror::Error;

/// Errors raised by sockets, listeners and the connection pool.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Nothing is listening at the dialled address.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Dialled address.
        addr: String,
    },

    /// Dialling did not complete within the dial timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Dialled address.
        addr: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The peer closed the connection, or the socket was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The listener was closed while accepting.
    #[error("listener closed")]
    ListenerClosed,

    /// Another listener already owns the address.
    #[error("address already in use: {addr}")]
    AddressInUse {
        /// Requested listen address.
        addr: String,
    },

    /// A frame violated the wire layout.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The frame did not start with the protocol magic.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Magic this build speaks.
        expected: u32,
        /// Magic found on the wire.
        got: u32,
    },

    /// The peer speaks a different framing version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this build speaks.
        expected: u8,
        /// Version found on the wire.
        got: u8,
    },

    /// The frame payload exceeds the configured maximum.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u32,
        /// Largest accepted payload.
        max_size: u32,
    },

    /// A transport message could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    IoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted => TransportError::ConnectionClosed,
            _ => TransportError::IoError(Arc::new(err)),
        }
    }
}

impl TransportError {
    /// Returns true when the error marks an orderly or abrupt end of the connection.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed | TransportError::ListenerClosed
        )
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
