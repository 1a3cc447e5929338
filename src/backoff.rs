//! Backoff schedules for retry loops.
//!
//! Retry semantics: `delay(0)` is the initial call (no delay) and `delay(n)` is the wait
//! before the n-th retry, i.e. before attempt `n + 1`. For an exponential schedule:
//!
//! ```text
//! delay before attempt k (k >= 2) = min(base * multiplier^(k - 2), max)
//! ```
//!
//! ```rust
//! use std::time::Duration;
//! use breakwater::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2));
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("multiplier must be a finite value >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Geometric backoff: `base * multiplier^(retry - 1)`, optionally capped.
///
/// A multiplier of `1.0` gives a constant schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Option<Duration>,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { base: delay, multiplier: 1.0, max: None }
    }

    /// Doubling delay starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, multiplier: 2.0, max: None }
    }

    /// Replace the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        self.multiplier = multiplier;
        Ok(self)
    }

    /// Cap every delay at `max`.
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

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Delay before the `retry`-th retry (0 = initial call, no delay).
    pub fn delay(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let limit = MAX_BACKOFF.as_nanos() as f64;
        let raw = if nanos.is_finite() && nanos < limit {
            Duration::from_nanos(nanos as u64)
        } else {
            MAX_BACKOFF
        };
        let capped = self.max.map_or(raw, |m| raw.min(m));
        capped.min(MAX_BACKOFF)
    }

    /// Delay before 1-based attempt `attempt` (attempt 1 is the initial call).
    pub fn delay_before_attempt(&self, attempt: usize) -> Duration {
        self.delay(attempt.saturating_sub(1))
    }
}

impl Default for Backoff {
    /// 1s doubling, capped at 30s.
    fn default() -> Self {
        Self { base: Duration::from_secs(1), multiplier: 2.0, max: Some(Duration::from_secs(30)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn attempt_indexing_matches_formula() {
        let base = Duration::from_millis(250);
        let backoff = Backoff::exponential(base).with_multiplier(3.0).unwrap();
        assert_eq!(backoff.delay_before_attempt(1), Duration::ZERO);
        for attempt in 2..8usize {
            let expected = base * 3u32.pow(attempt as u32 - 2);
            assert_eq!(backoff.delay_before_attempt(attempt), expected, "attempt {attempt}");
        }
    }

    #[test]
    fn fractional_multiplier() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100)).with_multiplier(1.5).unwrap();
        assert_eq!(backoff.delay(2), Duration::from_millis(150));
        assert_eq!(backoff.delay(3), Duration::from_millis(225));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .unwrap();
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(1)).with_multiplier(0.5),
            Err(BackoffError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(1)).with_multiplier(f64::NAN),
            Err(BackoffError::InvalidMultiplier(_))
        ));
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(10)).with_max(Duration::from_secs(5)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }

    #[test]
    fn zero_base_stays_zero() {
        let exp = Backoff::exponential(Duration::ZERO);
        assert_eq!(exp.delay(3), Duration::ZERO);
    }
}
