//! Time source injected into the scheduler, identifier service and control loop,
//! plus the duration notation used in resources and configuration.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

lazy_static! {
    static ref DURATION_RE: Regex = Regex::new(r"^(\d+)(ms|s|m|h)$").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid duration '{0}' (expected a number followed by ms, s, m or h)")]
pub struct InvalidDuration(pub String);

/// Parse `"100ms"`, `"30s"`, `"30m"` or `"1h"`
pub fn parse_duration(value: &str) -> Result<Duration, InvalidDuration> {
    let trimmed = value.trim();
    let caps = DURATION_RE
        .captures(trimmed)
        .ok_or_else(|| InvalidDuration(value.to_string()))?;
    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| InvalidDuration(value.to_string()))?;
    let duration = match &caps[2] {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        _ => Duration::from_secs(amount.saturating_mul(3600)),
    };
    Ok(duration)
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to drive backoff schedules in tests
/// and dry runs without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
