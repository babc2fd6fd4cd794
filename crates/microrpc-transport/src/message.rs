//! The unit exchanged by sockets.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A header map plus an opaque body, delivered whole by a [`crate::Socket`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// String headers; the RPC layer stores `Content-Type` and `Micro-*` routing keys here.
    pub header: HashMap<String, String>,
    /// Codec-encoded body.
    pub body: Bytes,
}

impl TransportMessage {
    /// Creates a message with no headers.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// Sets a header value, replacing any previous one.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.insert(key.into(), value.into());
    }

    /// Builder-style [`Self::set_header`].
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }
}
