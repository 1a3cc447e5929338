//! Retry manager.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible for retry. `CircuitOpen` and
//!   `Timeout` return immediately, so an open breaker never costs a backoff delay.
//! - The `should_retry` predicate decides whether an `Inner` error is retryable; with
//!   [`RetryPolicyBuilder::classified`] it defers to [`Classify::is_retryable`], which
//!   refuses `Validation` failures.
//! - The delay before attempt `k` (k >= 2) is `backoff.delay(k - 1)`, then jittered.
//!
//! ```rust
//! use std::time::Duration;
//! use breakwater::{Backoff, FetchError, Jitter, RetryPolicy, ResilienceError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<FetchError>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(1)))
//!     .with_jitter(Jitter::Equal)
//!     .classified()
//!     .build()
//!     .unwrap();
//! let result = policy.execute("warmup", || async { Ok::<_, ResilienceError<FetchError>>(7) }).await;
//! assert_eq!(result.unwrap(), 7);
//! # });
//! ```

use crate::classify::Classify;
use crate::config::RetryConfig;
use crate::error::MAX_RETRY_FAILURES;
use crate::{Backoff, BackoffError, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy combining backoff, jitter, predicate, and sleeper.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `label` only feeds the log records.
    pub async fn execute<T, Fut, Op>(
        &self,
        label: &str,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) => e,
                Err(other) => return Err(other),
            };

            if !(self.should_retry)(&err) {
                debug!(target: "breakwater::retry", label, attempt, error = %err, "not retryable");
                return Err(ResilienceError::Inner(err));
            }

            if attempt >= self.max_attempts {
                warn!(
                    target: "breakwater::retry",
                    label,
                    attempts = attempt,
                    error = %err,
                    "retry attempts exhausted"
                );
                failures.push_back(err);
                while failures.len() > MAX_RETRY_FAILURES {
                    failures.pop_front();
                }
                return Err(ResilienceError::retry_exhausted(
                    self.max_attempts,
                    failures.into_iter().collect(),
                ));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            debug!(
                target: "breakwater::retry",
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            failures.push_back(err);
            while failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }

            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// 3 attempts, default exponential backoff, full jitter, every error retryable.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::Full,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Classify + Send + Sync + 'static,
{
    /// Retry exactly the errors whose kind is retryable (everything but `Validation`).
    pub fn classified(self) -> Self {
        self.should_retry(|e: &E| e.is_retryable())
    }

    /// Seed a classified builder from a [`RetryConfig`].
    pub fn from_config(config: &RetryConfig) -> Result<Self, BuildError> {
        let mut backoff = Backoff::exponential(config.base_delay)
            .with_multiplier(config.multiplier)?;
        if !config.max_delay.is_zero() {
            backoff = backoff.with_max(config.max_delay)?;
        }
        let jitter = if config.jitter { Jitter::Equal } else { Jitter::None };
        Ok(Self::new()
            .max_attempts(config.max_attempts)
            .backoff(backoff)
            .with_jitter(jitter)
            .classified())
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
