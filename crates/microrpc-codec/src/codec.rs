//! The codec contract.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::format::BodyFormat;
use crate::message::{Message, MessageType};

/// Encodes and decodes envelopes for one content type.
///
/// A codec instance serves a single connection. Callers feed one received
/// transport body into [`Codec::buffer`], then call [`Codec::read_header`]
/// followed by [`Codec::read_body`]. For writing, [`Codec::write`] appends the
/// complete envelope to the buffer's write area.
pub trait Codec: Send {
    /// Parses the envelope header, filling whichever of `msg.id`,
    /// `msg.endpoint`, `msg.target` and `msg.error` the format carries.
    fn read_header(&mut self, msg: &mut Message, message_type: MessageType) -> Result<()>;

    /// Returns the encoded payload of the envelope whose header was just read.
    /// Empty when the envelope carried none.
    fn read_body(&mut self) -> Result<Bytes>;

    /// Writes one envelope. `body` is an already-encoded payload; `None`
    /// must always succeed and produce an envelope without a payload.
    fn write(&mut self, msg: &mut Message, body: Option<&[u8]>) -> Result<()>;

    /// Releases codec state.
    fn close(&mut self) -> Result<()> {
        self.buffer().clear();
        Ok(())
    }

    /// I/O buffer.
    fn buffer(&mut self) -> &mut Buffer;

    /// Payload serialization format.
    fn format(&self) -> BodyFormat;

    /// Short codec name.
    fn name(&self) -> &'static str;
}

/// Typed helpers over any [`Codec`].
pub trait CodecExt: Codec {
    /// Reads the body and decodes it as `T`.
    fn read_body_into<T: DeserializeOwned + 'static>(&mut self) -> Result<T> {
        let body = self.read_body()?;
        self.format().decode(&body)
    }

    /// Encodes `value` (if any) and writes the envelope.
    fn write_value<T: Serialize + 'static>(
        &mut self,
        msg: &mut Message,
        value: Option<&T>,
    ) -> Result<()> {
        match value {
            Some(v) => {
                let body = self.format().encode(v)?;
                self.write(msg, Some(&body))
            }
            None => self.write(msg, None),
        }
    }
}

impl<C: Codec + ?Sized> CodecExt for C {}
