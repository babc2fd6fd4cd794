//! gRPC-style codec.
//!
//! Payloads are wrapped in the 5-byte gRPC length prefix (compression flag
//! plus big-endian length). Routing travels in headers: `:path` on requests,
//! `grpc-status`/`grpc-message` on replies.

use bytes::Bytes;
use tracing::trace;

use crate::buffer::Buffer;
use crate::codec::Codec;
use crate::error::{CodecError, Result};
use crate::format::BodyFormat;
use crate::message::{headers, Message, MessageType, END_OF_STREAM};

/// Request path header.
pub const PATH: &str = ":path";
/// Reply status header; `0` is success.
pub const STATUS: &str = "grpc-status";
/// Reply error message header.
pub const MESSAGE: &str = "grpc-message";

const STATUS_OK: &str = "0";
const STATUS_INTERNAL: &str = "13";

/// Codec for `application/grpc`, `application/grpc+bincode` and `application/grpc+json`.
#[derive(Debug)]
pub struct GrpcCodec {
    content_type: String,
    buf: Buffer,
}

impl GrpcCodec {
    /// Creates a gRPC codec for the given content type.
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            buf: Buffer::new(),
        }
    }
}

/// Maps `Type.Method` to `/Type/Method`.
pub fn endpoint_to_path(endpoint: &str) -> String {
    match endpoint.split_once('.') {
        Some((service, method)) => format!("/{}/{}", service, method),
        None => format!("/{}", endpoint),
    }
}

/// Splits `/package.Service/Method` into (`package`, `Service.Method`).
pub fn path_to_endpoint(path: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 3 || !parts[0].is_empty() || parts[1].is_empty() || parts[2].is_empty() {
        return Err(CodecError::Framing(format!("unknown request path {}", path)));
    }
    let (package, service) = match parts[1].rsplit_once('.') {
        Some((package, service)) => (package.to_string(), service),
        None => (String::new(), parts[1]),
    };
    Ok((package, format!("{}.{}", service, parts[2])))
}

impl Codec for GrpcCodec {
    fn read_header(&mut self, msg: &mut Message, message_type: MessageType) -> Result<()> {
        if let Some(ct) = msg.header(headers::CONTENT_TYPE) {
            if ct != self.content_type {
                trace!(from = self.content_type.as_str(), to = ct, "grpc content type switched");
                self.content_type = ct.to_string();
            }
        }
        match message_type {
            MessageType::Request => {
                if let Some(path) = msg.header(PATH).map(str::to_string) {
                    let (package, endpoint) = path_to_endpoint(&path)?;
                    msg.endpoint = endpoint;
                    if msg.target.is_empty() && !package.is_empty() {
                        msg.target = package;
                    }
                }
            }
            MessageType::Response | MessageType::Error => {
                let status = msg.header(STATUS).unwrap_or(STATUS_OK);
                if status != STATUS_OK {
                    msg.error = msg.header(MESSAGE).unwrap_or("unknown error").to_string();
                }
            }
            MessageType::Event => {}
        }
        Ok(())
    }

    fn read_body(&mut self) -> Result<Bytes> {
        if self.buf.remaining() == 0 {
            return Ok(Bytes::new());
        }
        let compressed = self.buf.read_u8()?;
        if compressed != 0 {
            return Err(CodecError::Decode("compressed grpc frames are not supported".into()));
        }
        let len = self.buf.read_u32()? as usize;
        self.buf.read_exact(len)
    }

    fn write(&mut self, msg: &mut Message, body: Option<&[u8]>) -> Result<()> {
        match msg.message_type {
            MessageType::Request => {
                msg.header
                    .insert(PATH.to_string(), endpoint_to_path(&msg.endpoint));
            }
            MessageType::Response => {
                msg.header.insert(STATUS.to_string(), STATUS_OK.to_string());
            }
            MessageType::Error => {
                if msg.error == END_OF_STREAM || msg.error.is_empty() {
                    msg.header.insert(STATUS.to_string(), STATUS_OK.to_string());
                } else {
                    msg.header
                        .insert(STATUS.to_string(), STATUS_INTERNAL.to_string());
                    msg.header.insert(MESSAGE.to_string(), msg.error.clone());
                }
                return Ok(());
            }
            MessageType::Event => {}
        }
        msg.header
            .insert(headers::CONTENT_TYPE.to_string(), self.content_type.clone());

        let body = match body {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(()),
        };
        let len = u32::try_from(body.len())
            .map_err(|_| CodecError::Encode(format!("grpc frame of {} bytes too large", body.len())))?;
        self.buf.write_u8(0);
        self.buf.write_u32(len);
        self.buf.write(body);
        Ok(())
    }

    fn buffer(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    fn format(&self) -> BodyFormat {
        if self.content_type.ends_with("+json") {
            BodyFormat::Json
        } else {
            BodyFormat::Bincode
        }
    }

    fn name(&self) -> &'static str {
        "grpc"
    }
}
