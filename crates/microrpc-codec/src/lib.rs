#![warn(missing_docs)]

//! microrpc codecs: turn RPC envelopes into transport bodies and back.
//!
//! A [`Codec`] owns a [`Buffer`]. The RPC layer feeds each received transport
//! body into the read side, asks the codec for the header and then the body,
//! and collects whatever the codec wrote from the write side.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod format;
pub mod framed;
pub mod grpc;
pub mod jsonrpc;
pub mod message;
pub mod plain;
pub mod registry;

pub use buffer::Buffer;
pub use codec::{Codec, CodecExt};
pub use error::{CodecError, Result};
pub use format::BodyFormat;
pub use message::{headers, Message, MessageType, END_OF_STREAM};
pub use registry::{CodecRegistry, NewCodec, DEFAULT_CONTENT_TYPE};
