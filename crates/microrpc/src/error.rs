//! RPC error types.
//!
//! [`Status`] is the structured error that crosses the wire, serialized as
//! JSON into the envelope's error field. [`RpcError`] is what callers see.

use std::fmt;

use microrpc_codec::CodecError;
use microrpc_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error carried in response envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Service or component that raised the error.
    #[serde(default)]
    pub id: String,
    /// Numeric code, HTTP-like by convention.
    #[serde(default)]
    pub code: i32,
    /// Human-readable detail.
    #[serde(default)]
    pub detail: String,
    /// Reason phrase for `code`.
    #[serde(default)]
    pub status: String,
}

/// Reason phrase for common codes; empty for application-defined ones.
pub fn reason_phrase(code: i32) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

impl Status {
    /// Creates a status with the reason phrase derived from `code`.
    pub fn new(id: impl Into<String>, detail: impl Into<String>, code: i32) -> Self {
        Self {
            id: id.into(),
            code,
            detail: detail.into(),
            status: reason_phrase(code).to_string(),
        }
    }

    /// 400
    pub fn bad_request(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 400)
    }

    /// 401
    pub fn unauthorized(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 401)
    }

    /// 403
    pub fn forbidden(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 403)
    }

    /// 404
    pub fn not_found(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 404)
    }

    /// 405
    pub fn method_not_allowed(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 405)
    }

    /// 408
    pub fn timeout(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 408)
    }

    /// 409
    pub fn conflict(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 409)
    }

    /// 500
    pub fn internal(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 500)
    }

    /// 503
    pub fn unavailable(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 503)
    }

    /// Wire form.
    pub fn to_json(&self) -> String {
        // A struct of strings and an integer always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| self.detail.clone())
    }

    /// Parses the wire form. Text that is not a JSON status becomes a 500
    /// whose detail is the raw text.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Status>(raw) {
            Ok(status) if status.code != 0 || !status.detail.is_empty() || !status.id.is_empty() => {
                status
            }
            _ => Self::new("", raw, 500),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}", self.detail, self.code)?;
        if !self.id.is_empty() {
            write!(f, ", from {}", self.id)?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for Status {}

/// Errors returned by calls, streams, publications and the server.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// No node could be selected for the service.
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable {
        /// Requested service.
        service: String,
        /// Why selection failed.
        reason: String,
    },

    /// Dial, send or receive failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The call context expired or was cancelled.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// The remote handler (or the remote server) returned a structured error.
    #[error("{0}")]
    Application(Status),

    /// Local failure: misconfiguration, recovered panic, closed stream.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Application(status)
    }
}

impl RpcError {
    /// HTTP-like code for the error.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::ServiceUnavailable { .. } => 503,
            RpcError::Transport(_) => 500,
            RpcError::Codec(_) => 500,
            RpcError::Timeout(_) => 408,
            RpcError::Application(status) => status.code,
            RpcError::Internal(_) => 500,
        }
    }

    /// Structured form, attributed to `id` unless the error already carries one.
    pub fn to_status(&self, id: &str) -> Status {
        match self {
            RpcError::Application(status) => status.clone(),
            other => Status::new(id, other.to_string(), other.code()),
        }
    }

    /// Default retry policy: transport failures and remote 408/5xx-class errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Application(status) => {
                status.code == 408 || (500..600).contains(&status.code)
            }
            _ => false,
        }
    }

    /// True for payload or envelope encoding failures, which are never retried.
    pub fn is_codec(&self) -> bool {
        matches!(self, RpcError::Codec(_))
    }

    /// Application error code, if this is one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            RpcError::Application(status) => Some(status),
            _ => None,
        }
    }
}

/// Result alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
