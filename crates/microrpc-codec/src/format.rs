//! Body serialization formats.

use std::any::{type_name, Any, TypeId};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, Result};

/// How payload values are turned into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyFormat {
    /// bincode 1.x.
    Bincode,
    /// JSON.
    Json,
    /// Bytes passed through untouched; payloads must be `Vec<u8>`, `Bytes` or `()`.
    Raw,
}

impl BodyFormat {
    /// Encodes a payload value.
    pub fn encode<T: Serialize + 'static>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            BodyFormat::Bincode => {
                bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
            BodyFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
            BodyFormat::Raw => raw_encode(value),
        }
    }

    /// Decodes a payload value.
    pub fn decode<T: DeserializeOwned + 'static>(&self, data: &[u8]) -> Result<T> {
        match self {
            BodyFormat::Bincode => {
                bincode::deserialize(data).map_err(|e| CodecError::Decode(e.to_string()))
            }
            BodyFormat::Json => {
                serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
            }
            BodyFormat::Raw => raw_decode(data),
        }
    }
}

fn raw_encode<T: 'static>(value: &T) -> Result<Vec<u8>> {
    let any = value as &dyn Any;
    if let Some(v) = any.downcast_ref::<Vec<u8>>() {
        return Ok(v.clone());
    }
    if let Some(b) = any.downcast_ref::<Bytes>() {
        return Ok(b.to_vec());
    }
    if any.is::<()>() {
        return Ok(Vec::new());
    }
    Err(CodecError::Encode(format!(
        "raw body cannot carry {}",
        type_name::<T>()
    )))
}

fn raw_decode<T: 'static>(data: &[u8]) -> Result<T> {
    let target = TypeId::of::<T>();
    let boxed: Box<dyn Any> = if target == TypeId::of::<Vec<u8>>() {
        Box::new(data.to_vec())
    } else if target == TypeId::of::<Bytes>() {
        Box::new(Bytes::copy_from_slice(data))
    } else if target == TypeId::of::<()>() {
        Box::new(())
    } else {
        return Err(CodecError::Decode(format!(
            "raw body cannot decode into {}",
            type_name::<T>()
        )));
    };
    boxed
        .downcast::<T>()
        .map(|v| *v)
        .map_err(|_| CodecError::Decode(format!("raw body type mismatch for {}", type_name::<T>())))
}
