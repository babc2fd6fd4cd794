//! Codec error types.

use thiserror::Error;

/// Errors raised while encoding or decoding envelopes and payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input bytes could not be decoded into the requested shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Envelope framing was malformed.
    #[error("framing error: {0}")]
    Framing(String),

    /// The read buffer ran out before the envelope was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// No codec is registered for the content type.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
