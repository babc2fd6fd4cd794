//! Stream framing used by the TCP transport.
//!
//! Each [`TransportMessage`] travels as a 12-byte header followed by its
//! bincode encoding:
//!
//! ```text
//! | magic u32 | version u8 | flags u8 | reserved u16 | payload length u32 |
//! ```
//!
//! All integers are big-endian.

use crate::error::{Result, TransportError};
use crate::message::TransportMessage;

/// Frame magic, ASCII "MRPC".
pub const MAGIC: u32 = 0x4D52_5043;

/// Framing version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of [`FrameHeader`] on the wire.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Largest payload accepted from a peer (64 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Frame header preceding each message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Must equal [`MAGIC`].
    pub magic: u32,
    /// Must equal [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Reserved for future use, always zero today.
    pub flags: u8,
    /// Length of the payload that follows.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Creates a header for a payload of `payload_length` bytes.
    pub fn new(payload_length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags: 0,
            payload_length,
        }
    }

    /// Serializes the header.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[8..12].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Parses and validates a header.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let payload_length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            magic,
            version,
            flags: buf[5],
            payload_length,
        })
    }
}

/// Encodes a message into a complete frame (header plus payload).
pub fn encode_frame(msg: &TransportMessage) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(TransportError::PayloadTooLarge {
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            max_size: MAX_PAYLOAD_SIZE,
        });
    }
    let header = FrameHeader::new(payload.len() as u32);
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes the payload that followed `header`.
pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<TransportMessage> {
    if payload.len() != header.payload_length as usize {
        return Err(TransportError::InvalidFrame {
            reason: format!(
                "payload length {} does not match header length {}",
                payload.len(),
                header.payload_length
            ),
        });
    }
    bincode::deserialize(payload).map_err(|e| TransportError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn split(frame: &[u8]) -> ([u8; FRAME_HEADER_SIZE], &[u8]) {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        (header, &frame[FRAME_HEADER_SIZE..])
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = TransportMessage::new(&b"hello"[..]).with_header("Micro-Id", "7");
        let frame = encode_frame(&msg).unwrap();
        let (raw, payload) = split(&frame);
        let header = FrameHeader::decode(&raw).unwrap();
        assert_eq!(header.payload_length as usize, payload.len());
        assert_eq!(decode_payload(&header, payload).unwrap(), msg);
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = FrameHeader::new(0).encode();
        raw[0] = 0xFF;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut raw = FrameHeader::new(0).encode();
        raw[4] = 9;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::VersionMismatch { expected: 1, got: 9 })
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let raw = FrameHeader::new(MAX_PAYLOAD_SIZE + 1).encode();
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let msg = TransportMessage::new(&b"hello"[..]);
        let frame = encode_frame(&msg).unwrap();
        let (raw, payload) = split(&frame);
        let header = FrameHeader::decode(&raw).unwrap();
        assert!(decode_payload(&header, &payload[..payload.len() - 1]).is_err());
    }

    proptest! {
        #[test]
        fn test_header_roundtrip_any_valid_length(len in 0..=MAX_PAYLOAD_SIZE, flags in any::<u8>()) {
            let mut header = FrameHeader::new(len);
            header.flags = flags;
            let decoded = FrameHeader::decode(&header.encode()).unwrap();
            prop_assert_eq!(decoded, header);
        }

        #[test]
        fn test_header_rejects_any_oversized_length(len in (MAX_PAYLOAD_SIZE + 1)..=u32::MAX) {
            let raw = FrameHeader::new(len).encode();
            let rejected = matches!(FrameHeader::decode(&raw), Err(TransportError::PayloadTooLarge { size, .. }) if size == len);
            prop_assert!(rejected);
        }

        #[test]
        fn test_frame_carries_any_message(
            header in proptest::collection::hash_map("[A-Za-z-]{1,16}", ".{0,32}", 0..8),
            body in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let msg = TransportMessage { header, body: body.into() };
            let frame = encode_frame(&msg).unwrap();
            let (raw, payload) = split(&frame);
            let decoded = FrameHeader::decode(&raw).unwrap();
            prop_assert_eq!(decoded.payload_length as usize, payload.len());
            prop_assert_eq!(decode_payload(&decoded, payload).unwrap(), msg);
        }
    }
}
