//! Jitter strategies to keep retries of concurrent aggregations from synchronizing.
//!
//! - `None`: deterministic delays, the default.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while adding randomness.

use rand::{rng, Rng};
use serde::Deserialize;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
}

impl Jitter {
    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            _ if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        assert_eq!(Jitter::None.apply(Duration::from_millis(123)), Duration::from_millis(123));
    }

    #[test]
    fn full_stays_within_delay() {
        for _ in 0..200 {
            assert!(Jitter::Full.apply(Duration::from_millis(100)) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn equal_keeps_half_as_floor() {
        for _ in 0..200 {
            let d = Jitter::Equal.apply(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }
}
