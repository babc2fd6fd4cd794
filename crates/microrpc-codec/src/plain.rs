//! Plain codec: the transport body is the payload.
//!
//! Routing data travels only in transport headers, which the RPC layer
//! fills in, so headers parse as a no-op.

use bytes::Bytes;

use crate::buffer::Buffer;
use crate::codec::Codec;
use crate::error::Result;
use crate::format::BodyFormat;
use crate::message::{Message, MessageType};

/// Codec for `application/bincode`, `application/json` and `application/octet-stream`.
#[derive(Debug)]
pub struct PlainCodec {
    format: BodyFormat,
    buf: Buffer,
}

impl PlainCodec {
    /// Creates a plain codec for the given body format.
    pub fn new(format: BodyFormat) -> Self {
        Self {
            format,
            buf: Buffer::new(),
        }
    }
}

impl Codec for PlainCodec {
    fn read_header(&mut self, _msg: &mut Message, _message_type: MessageType) -> Result<()> {
        Ok(())
    }

    fn read_body(&mut self) -> Result<Bytes> {
        Ok(self.buf.read_all())
    }

    fn write(&mut self, _msg: &mut Message, body: Option<&[u8]>) -> Result<()> {
        if let Some(body) = body {
            self.buf.write(body);
        }
        Ok(())
    }

    fn buffer(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    fn format(&self) -> BodyFormat {
        self.format
    }

    fn name(&self) -> &'static str {
        match self.format {
            BodyFormat::Bincode => "bincode",
            BodyFormat::Json => "json",
            BodyFormat::Raw => "bytes",
        }
    }
}
