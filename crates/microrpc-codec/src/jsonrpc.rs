//! JSON-RPC 1.0 style codec, one JSON object per line.
//!
//! Requests are `{"method", "params": [payload], "id"}`; replies are
//! `{"id", "result", "error"}`. Events carry the bare payload.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::buffer::Buffer;
use crate::codec::Codec;
use crate::error::{CodecError, Result};
use crate::format::BodyFormat;
use crate::message::{Message, MessageType};

/// Codec for `application/json-rpc`.
#[derive(Debug, Default)]
pub struct JsonRpcCodec {
    buf: Buffer,
    pending: Option<Bytes>,
}

impl JsonRpcCodec {
    /// Creates a JSON-RPC codec.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_object(&mut self) -> Result<serde_json::Map<String, Value>> {
        if self.buf.remaining() == 0 {
            return Err(CodecError::UnexpectedEof);
        }
        let line = match self.buf.read_line() {
            Ok(line) => line,
            Err(_) => self.buf.read_all(),
        };
        match serde_json::from_slice(&line).map_err(|e| CodecError::Decode(e.to_string()))? {
            Value::Object(map) => Ok(map),
            other => Err(CodecError::Decode(format!(
                "expected json-rpc object, got {}",
                other
            ))),
        }
    }

    fn write_line(&mut self, value: &Value) -> Result<()> {
        let data = serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.buf.write(&data);
        self.buf.write(b"\n");
        Ok(())
    }
}

fn id_to_string(id: Option<&Value>) -> String {
    match id {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn id_to_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(id),
    }
}

fn error_to_string(error: Option<&Value>) -> String {
    match error {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn payload_value(body: Option<&[u8]>) -> Result<Option<Value>> {
    match body {
        None => Ok(None),
        Some(b) if b.is_empty() => Ok(None),
        Some(b) => serde_json::from_slice(b)
            .map(Some)
            .map_err(|e| CodecError::Encode(format!("payload is not json: {}", e))),
    }
}

fn to_bytes(value: &Value) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

impl Codec for JsonRpcCodec {
    fn read_header(&mut self, msg: &mut Message, message_type: MessageType) -> Result<()> {
        self.pending = None;
        match message_type {
            MessageType::Event => Ok(()),
            MessageType::Request => {
                let mut obj = self.read_object()?;
                if let Some(Value::String(method)) = obj.get("method") {
                    msg.endpoint = method.clone();
                }
                msg.id = id_to_string(obj.get("id"));
                // A closing stream sends a reply-shaped object with only an error.
                msg.error = error_to_string(obj.get("error"));
                self.pending = match obj.remove("params") {
                    Some(Value::Array(mut params)) if !params.is_empty() => {
                        Some(to_bytes(&params.swap_remove(0))?)
                    }
                    Some(Value::Array(_)) | Some(Value::Null) | None => Some(Bytes::new()),
                    Some(other) => Some(to_bytes(&other)?),
                };
                Ok(())
            }
            MessageType::Response | MessageType::Error => {
                let mut obj = self.read_object()?;
                msg.id = id_to_string(obj.get("id"));
                msg.error = error_to_string(obj.get("error"));
                self.pending = match obj.remove("result") {
                    _ if !msg.error.is_empty() => Some(Bytes::new()),
                    None => Some(Bytes::new()),
                    Some(result) => Some(to_bytes(&result)?),
                };
                Ok(())
            }
        }
    }

    fn read_body(&mut self) -> Result<Bytes> {
        match self.pending.take() {
            Some(body) => Ok(body),
            None => Ok(self.buf.read_all()),
        }
    }

    fn write(&mut self, msg: &mut Message, body: Option<&[u8]>) -> Result<()> {
        match msg.message_type {
            MessageType::Request => {
                let params = match payload_value(body)? {
                    Some(v) => vec![v],
                    None => Vec::new(),
                };
                let obj = json!({
                    "method": msg.endpoint,
                    "params": params,
                    "id": id_to_value(&msg.id),
                });
                self.write_line(&obj)
            }
            MessageType::Response | MessageType::Error => {
                let error = if msg.error.is_empty() {
                    Value::Null
                } else {
                    Value::from(msg.error.clone())
                };
                let obj = json!({
                    "id": id_to_value(&msg.id),
                    "result": payload_value(body)?.unwrap_or(Value::Null),
                    "error": error,
                });
                self.write_line(&obj)
            }
            MessageType::Event => {
                if let Some(body) = body {
                    self.buf.write(body);
                }
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.buf.clear();
        Ok(())
    }

    fn buffer(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    fn format(&self) -> BodyFormat {
        BodyFormat::Json
    }

    fn name(&self) -> &'static str {
        "json-rpc"
    }
}
