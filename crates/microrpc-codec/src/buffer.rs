//! Read/write byte buffer owned by each codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};

/// Byte buffer with an independent read cursor and write area.
#[derive(Debug, Default)]
pub struct Buffer {
    read: BytesMut,
    write: BytesMut,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards unread input and replaces it with `data`.
    pub fn reset_read(&mut self, data: &[u8]) {
        self.read.clear();
        self.read.extend_from_slice(data);
    }

    /// Appends to the unread input.
    pub fn feed(&mut self, data: &[u8]) {
        self.read.extend_from_slice(data);
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.read.len()
    }

    /// Consumes exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        if self.read.len() < n {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(self.read.split_to(n).freeze())
    }

    /// Consumes a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        if self.read.len() < 4 {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(self.read.get_u32())
    }

    /// Consumes one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        if self.read.is_empty() {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(self.read.get_u8())
    }

    /// Consumes through the next `\n`, returning the line without it.
    pub fn read_line(&mut self) -> Result<Bytes> {
        let pos = self
            .read
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(CodecError::UnexpectedEof)?;
        let mut line = self.read.split_to(pos + 1);
        line.truncate(pos);
        Ok(line.freeze())
    }

    /// Consumes everything left.
    pub fn read_all(&mut self) -> Bytes {
        self.read.split().freeze()
    }

    /// Appends raw bytes to the write area.
    pub fn write(&mut self, data: &[u8]) {
        self.write.extend_from_slice(data);
    }

    /// Appends a big-endian `u32` to the write area.
    pub fn write_u32(&mut self, v: u32) {
        self.write.put_u32(v);
    }

    /// Appends one byte to the write area.
    pub fn write_u8(&mut self, v: u8) {
        self.write.put_u8(v);
    }

    /// Takes everything written so far.
    pub fn take_written(&mut self) -> Bytes {
        self.write.split().freeze()
    }

    /// Discards both sides.
    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }
}
