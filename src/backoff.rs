//! Exponential backoff for retry delays.
//!
//! The delay before retry `n` (0-based: `n = 0` is the wait between the first attempt and the
//! first retry) is `base * multiplier^n`, optionally capped. A multiplier of `1.0` gives a
//! constant delay.
//!
//! ```rust
//! use std::time::Duration;
//! use ninelives_gather::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_multiplier(3.0)
//!     .unwrap()
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(1), Duration::from_millis(300));
//! assert_eq!(backoff.delay(2), Duration::from_millis(900));
//! assert_eq!(backoff.delay(3), Duration::from_secs(1)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Exponential backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Option<Duration>,
}

impl Backoff {
    /// Doubling backoff starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, multiplier: 2.0, max: None }
    }

    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { base: delay, multiplier: 1.0, max: None }
    }

    /// Growth factor applied per retry; must be finite and >= 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        self.multiplier = multiplier;
        Ok(self)
    }

    /// Cap every delay at `max`. Errors if `max` is zero or below `base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let raw = if !nanos.is_finite() || nanos >= MAX_BACKOFF.as_nanos() as f64 {
            MAX_BACKOFF
        } else {
            Duration::from_nanos(nanos.round() as u64)
        };
        let capped = self.max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}
