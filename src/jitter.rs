//! Jitter keeps concurrent callers that failed together from retrying in lockstep.
//!
//! - `None`: exact backoff delay (deterministic tests, the batch processor's item loop).
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`, keeping a floor under the wait.

use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-provided RNG (seeded in tests).
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
