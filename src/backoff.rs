//! Exponential backoff with jitter for the publisher's downstream retries.

use std::time::Duration;

/// `delay = min(max_delay, base_delay * 2^attempt)`, jittered by up to 25%
/// `attempt` is zero-based (the delay before the *first* retry).
pub fn delay_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .unwrap_or(max)
        .min(max);
    let jitter_frac = fastrand::f64() * 0.25;
    let jittered = exp.mul_f64(1.0 - jitter_frac);
    jittered.min(max)
}
