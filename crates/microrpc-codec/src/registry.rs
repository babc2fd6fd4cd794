//! Content-type to codec lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::{CodecError, Result};
use crate::format::BodyFormat;
use crate::framed::FramedCodec;
use crate::grpc::GrpcCodec;
use crate::jsonrpc::JsonRpcCodec;
use crate::plain::PlainCodec;

/// Content type used when a request names none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/bincode";

/// Builds a codec for the given content type.
pub type NewCodec = Arc<dyn Fn(&str) -> Box<dyn Codec> + Send + Sync>;

/// A table of codec constructors keyed by content type.
///
/// Lookups consult this table first and then the built-in codecs, so an
/// empty registry still knows every default content type.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, NewCodec>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.codecs.keys().collect();
        keys.sort();
        f.debug_struct("CodecRegistry").field("custom", &keys).finish()
    }
}

fn builtin(content_type: &str) -> Option<Box<dyn Codec>> {
    let codec: Box<dyn Codec> = match content_type {
        "application/bincode" => Box::new(PlainCodec::new(BodyFormat::Bincode)),
        "application/json" => Box::new(PlainCodec::new(BodyFormat::Json)),
        "application/octet-stream" => Box::new(PlainCodec::new(BodyFormat::Raw)),
        "application/bincode-rpc" => Box::new(FramedCodec::new()),
        "application/json-rpc" => Box::new(JsonRpcCodec::new()),
        "application/grpc" | "application/grpc+bincode" | "application/grpc+json" => {
            Box::new(GrpcCodec::new(content_type))
        }
        _ => return None,
    };
    Some(codec)
}

/// Content types served by the built-in codecs.
pub const BUILTIN_CONTENT_TYPES: &[&str] = &[
    "application/bincode",
    "application/json",
    "application/octet-stream",
    "application/bincode-rpc",
    "application/json-rpc",
    "application/grpc",
    "application/grpc+bincode",
    "application/grpc+json",
];

impl CodecRegistry {
    /// Creates a registry with no custom codecs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overrides) a codec constructor.
    pub fn register(&mut self, content_type: impl Into<String>, factory: NewCodec) {
        self.codecs.insert(content_type.into(), factory);
    }

    /// Builds a codec for `content_type`.
    pub fn new_codec(&self, content_type: &str) -> Result<Box<dyn Codec>> {
        if let Some(factory) = self.codecs.get(content_type) {
            return Ok(factory(content_type));
        }
        builtin(content_type)
            .ok_or_else(|| CodecError::UnsupportedContentType(content_type.to_string()))
    }

    /// True when `content_type` resolves to a codec.
    pub fn supports(&self, content_type: &str) -> bool {
        self.codecs.contains_key(content_type) || BUILTIN_CONTENT_TYPES.contains(&content_type)
    }

    /// Every resolvable content type, sorted.
    pub fn content_types(&self) -> Vec<String> {
        let mut all: Vec<String> = BUILTIN_CONTENT_TYPES
            .iter()
            .map(|s| s.to_string())
            .chain(self.codecs.keys().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }
}
