//! Framed codec: a bincode envelope header and the payload, each
//! length-prefixed, so the body is self-describing without transport headers.
//!
//! ```text
//! | len u32 | bincode(FrameHeader) | len u32 | payload |
//! ```
//!
//! Events skip the header frame and carry only the payload frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::codec::Codec;
use crate::error::{CodecError, Result};
use crate::format::BodyFormat;
use crate::message::{Message, MessageType};

#[derive(Debug, Default, Serialize, Deserialize)]
struct FrameHeader {
    service_method: String,
    seq: u64,
    error: String,
}

/// Codec for `application/bincode-rpc`.
#[derive(Debug, Default)]
pub struct FramedCodec {
    buf: Buffer,
}

impl FramedCodec {
    /// Creates a framed codec.
    pub fn new() -> Self {
        Self::default()
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| CodecError::Encode(format!("frame of {} bytes too large", data.len())))?;
        self.buf.write_u32(len);
        self.buf.write(data);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Bytes> {
        let len = self.buf.read_u32()? as usize;
        self.buf.read_exact(len).map_err(|_| {
            CodecError::Framing(format!("frame declares {} bytes, input is shorter", len))
        })
    }
}

impl Codec for FramedCodec {
    fn read_header(&mut self, msg: &mut Message, message_type: MessageType) -> Result<()> {
        if message_type == MessageType::Event {
            return Ok(());
        }
        let raw = self.read_frame()?;
        let header: FrameHeader =
            bincode::deserialize(&raw).map_err(|e| CodecError::Decode(e.to_string()))?;
        msg.endpoint = header.service_method;
        if header.seq != 0 {
            msg.id = header.seq.to_string();
        }
        msg.error = header.error;
        Ok(())
    }

    fn read_body(&mut self) -> Result<Bytes> {
        if self.buf.remaining() == 0 {
            return Ok(Bytes::new());
        }
        self.read_frame()
    }

    fn write(&mut self, msg: &mut Message, body: Option<&[u8]>) -> Result<()> {
        if msg.message_type != MessageType::Event {
            let header = FrameHeader {
                service_method: msg.endpoint.clone(),
                // Non-numeric ids ride in the Micro-Id transport header instead.
                seq: msg.id.parse().unwrap_or(0),
                error: match msg.message_type {
                    MessageType::Request => String::new(),
                    _ => msg.error.clone(),
                },
            };
            let raw = bincode::serialize(&header).map_err(|e| CodecError::Encode(e.to_string()))?;
            self.write_frame(&raw)?;
        }
        self.write_frame(body.unwrap_or_default())
    }

    fn buffer(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    fn format(&self) -> BodyFormat {
        BodyFormat::Bincode
    }

    fn name(&self) -> &'static str {
        "bincode-rpc"
    }
}
