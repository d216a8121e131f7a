// src/worker/backoff.rs
//! Retry delay functions. A backoff maps the number of failed attempts so far
//! to the delay before the next attempt.

use std::sync::Arc;
use std::time::Duration;

pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Caps the exponent so the multiplier stays representable.
const MAX_SHIFT: u32 = 20;

/// `base * 2^(attempt + 1)`, saturating.
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_add(1).min(MAX_SHIFT);
    base.saturating_mul(1u32 << shift)
}

pub fn exponential(base: Duration) -> BackoffFn {
    Arc::new(move |attempt| exponential_delay(base, attempt))
}

pub fn constant(delay: Duration) -> BackoffFn {
    Arc::new(move |_| delay)
}

pub fn default_backoff() -> BackoffFn {
    exponential(DEFAULT_BASE_DELAY)
}
