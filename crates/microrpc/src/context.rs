//! Call context: deadline, cancellation and metadata propagated along a call.
//!
//! Contexts are cheap to clone. Derived contexts share the parent's
//! cancellation (cancelling the parent cancels every child) and never extend
//! the parent's deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// Cancelled explicitly.
    #[error("context canceled")]
    Cancelled,
    /// The deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Deadline, cancellation and string metadata for one call.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
    metadata: Arc<HashMap<String, String>>,
}

impl Context {
    /// A context that is never done unless cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that expires after `timeout` (or sooner, if the parent does).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context that expires at `deadline` (or sooner, if the parent does).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
            metadata: Arc::clone(&self.metadata),
        }
    }

    /// Derives a cancellable context. Cancelling the returned token ends the
    /// child (and its descendants) but not `self`.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.token.child_token();
        let ctx = Self {
            deadline: self.deadline,
            token: token.clone(),
            metadata: Arc::clone(&self.metadata),
        };
        (ctx, token)
    }

    /// Derives a context with one metadata entry added or replaced.
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut metadata = (*self.metadata).clone();
        metadata.insert(key.into(), value.into());
        Self {
            deadline: self.deadline,
            token: self.token.clone(),
            metadata: Arc::new(metadata),
        }
    }

    /// Derives a context whose metadata is replaced wholesale.
    pub fn with_metadata_map(&self, metadata: HashMap<String, String>) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.clone(),
            metadata: Arc::new(metadata),
        }
    }

    /// Metadata carried by the context.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` while it is live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// True once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// Encodes a timeout for the `Timeout` header (nanoseconds).
pub fn encode_timeout(timeout: Duration) -> String {
    timeout.as_nanos().to_string()
}

/// Parses a `Timeout` header value; zero and garbage mean "no timeout".
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let nanos: u64 = value.trim().parse().ok()?;
    if nanos == 0 {
        return None;
    }
    Some(Duration::from_nanos(nanos))
}
