//! Delay before each call attempt.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::client::RpcRequest;
use crate::context::Context;
use crate::error::Result;

/// Computes the delay before attempt `attempt` (0-based). An error aborts the call.
pub type BackoffFn = Arc<dyn Fn(&Context, &RpcRequest, u32) -> Result<Duration> + Send + Sync>;

/// Backoff tuning, shaped like the retry configuration it replaces.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that may be randomly subtracted.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

/// Delay for `attempt` without jitter: zero for the first attempt, then
/// `initial * multiplier^(attempt-1)` capped at `max`.
pub fn compute_backoff(config: &BackoffConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = config.multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
    let millis = config.initial.as_millis() as f64 * factor;
    let capped = millis.min(config.max.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

fn jittered(config: &BackoffConfig, delay: Duration) -> Duration {
    if config.jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let cut = rand::thread_rng().gen_range(0.0..config.jitter.min(1.0));
    delay.mul_f64(1.0 - cut)
}

/// The default [`BackoffFn`].
pub fn exponential_backoff(_ctx: &Context, _req: &RpcRequest, attempt: u32) -> Result<Duration> {
    let config = BackoffConfig::default();
    Ok(jittered(&config, compute_backoff(&config, attempt)))
}

/// A [`BackoffFn`] with custom tuning.
pub fn backoff_with(config: BackoffConfig) -> BackoffFn {
    Arc::new(move |_ctx: &Context, _req: &RpcRequest, attempt: u32| {
        Ok(jittered(&config, compute_backoff(&config, attempt)))
    })
}

/// A [`BackoffFn`] that never waits.
pub fn no_backoff() -> BackoffFn {
    Arc::new(|_ctx: &Context, _req: &RpcRequest, _attempt: u32| Ok(Duration::ZERO))
}
