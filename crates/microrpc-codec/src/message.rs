//! The codec-neutral RPC envelope.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Error-field sentinel marking the end of a stream.
pub const END_OF_STREAM: &str = "EOS";

/// Header keys shared by every codec and the RPC layer.
pub mod headers {
    /// Body encoding of the envelope.
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Encodings the caller accepts in the reply.
    pub const ACCEPT: &str = "Accept";
    /// Request timeout in nanoseconds.
    pub const TIMEOUT: &str = "Timeout";
    /// Request id echoed by the response.
    pub const ID: &str = "Micro-Id";
    /// Target service name.
    pub const SERVICE: &str = "Micro-Service";
    /// Dot-qualified `Type.Method`.
    pub const ENDPOINT: &str = "Micro-Endpoint";
    /// Serialized error status, or `EOS`.
    pub const ERROR: &str = "Micro-Error";
    /// Present on every envelope that belongs to a stream.
    pub const STREAM: &str = "Micro-Stream";
    /// Publication topic.
    pub const TOPIC: &str = "Micro-Topic";
    /// Local address, injected into server-side request metadata.
    pub const LOCAL: &str = "Local";
    /// Remote address, injected into server-side request metadata.
    pub const REMOTE: &str = "Remote";
}

/// What an envelope carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Client to server call or stream message.
    #[default]
    Request,
    /// Server reply carrying a body.
    Response,
    /// Server reply carrying only an error (or the end-of-stream marker).
    Error,
    /// Broker publication.
    Event,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::Event => "event",
        };
        f.write_str(name)
    }
}

/// An RPC envelope, before body encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Request id, echoed by every response envelope.
    pub id: String,
    /// Envelope kind.
    pub message_type: MessageType,
    /// Target service.
    pub target: String,
    /// Dot-qualified `Type.Method`.
    pub endpoint: String,
    /// Serialized error status; `EOS` marks a clean end of stream.
    pub error: String,
    /// Envelope headers.
    pub header: HashMap<String, String>,
    /// Raw encoded body, filled by codecs that keep one.
    pub body: Bytes,
}

impl Message {
    /// Creates an envelope of the given kind.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Self::default()
        }
    }

    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// True when the error field carries the end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        self.error == END_OF_STREAM
    }
}
