//! Retry predicates.

use std::sync::Arc;

use crate::client::RpcRequest;
use crate::context::Context;
use crate::error::{Result, RpcError};

/// Decides whether a failed attempt is retried. An `Err` aborts the call with that error.
pub type RetryFn =
    Arc<dyn Fn(&Context, &RpcRequest, u32, &RpcError) -> Result<bool> + Send + Sync>;

/// Default predicate: retry transport failures and remote 408/5xx errors.
pub fn retry_on_error(_ctx: &Context, _req: &RpcRequest, _attempt: u32, err: &RpcError) -> Result<bool> {
    Ok(err.is_retryable())
}

/// Retries every error.
pub fn retry_always() -> RetryFn {
    Arc::new(|_ctx: &Context, _req: &RpcRequest, _attempt: u32, _err: &RpcError| Ok(true))
}

/// Never retries.
pub fn retry_never() -> RetryFn {
    Arc::new(|_ctx: &Context, _req: &RpcRequest, _attempt: u32, _err: &RpcError| Ok(false))
}
