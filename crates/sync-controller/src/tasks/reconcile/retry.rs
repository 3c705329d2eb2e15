//! Exponential backoff between attempts of a failed `SyncRequest`.

use crate::clock::{parse_duration, InvalidDuration};
use crate::crds::RetryPolicy;
use std::time::Duration;

/// Upper bound for any single backoff step
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Delay before retry number `attempt` (1-based):
/// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at one hour.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Result<Duration, InvalidDuration> {
    let initial = parse_duration(&policy.initial_delay)?;
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let factor = policy.backoff_multiplier.max(1.0).powi(exponent);

    if !factor.is_finite() || initial.as_secs_f64() * factor >= MAX_RETRY_DELAY.as_secs_f64() {
        return Ok(MAX_RETRY_DELAY);
    }
    Ok(initial.mul_f64(factor))
}

/// Whether another attempt is allowed after `failures` consecutive failures
#[must_use]
pub fn retries_remaining(policy: &RetryPolicy, failures: u32) -> bool {
    failures <= policy.max_retries
}
