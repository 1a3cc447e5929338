//! Circuit breaker with lock-free atomics.
//!
//! One breaker guards one named resource (typically an upstream host). State machine:
//!
//! - `Closed` → `Open` once `failure_threshold` consecutive failures are recorded (within
//!   `failure_window`, when one is configured).
//! - `Open` rejects with [`ResilienceError::CircuitOpen`] without running the operation
//!   until `recovery_timeout` has elapsed, then moves to `HalfOpen`.
//! - `HalfOpen` admits at most `half_open_max_calls` trial calls. A success closes the
//!   circuit and clears the failure tally; a failure reopens it and restarts the cool-down.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{duration_ms, option_duration_ms};
use crate::ResilienceError;
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast until the cool-down elapses.
    Open,
    /// Admitting a limited number of trial calls.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Breaker tuning. Every field has a default, so partial JSON is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. Default 5.
    pub failure_threshold: usize,
    /// Cool-down before a trial call is admitted. Default 60s.
    #[serde(rename = "recovery_timeout_ms", with = "duration_ms")]
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open. Default 1.
    pub half_open_max_calls: usize,
    /// Failures further apart than this restart the tally. Default: no window.
    #[serde(rename = "failure_window_ms", with = "option_duration_ms")]
    pub failure_window: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            failure_window: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("recovery_timeout must be > 0 (got {0:?})")]
    InvalidRecoveryTimeout(Duration),
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: usize },
    #[error("failure_window must be > 0 when set")]
    InvalidFailureWindow,
}

impl CircuitBreakerConfig {
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        let cfg = Self { failure_threshold, recovery_timeout, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::MAX,
            half_open_max_calls: usize::MAX,
            failure_window: None,
        }
    }

    pub fn with_half_open_limit(mut self, limit: usize) -> Result<Self, CircuitBreakerError> {
        self.half_open_max_calls = limit;
        self.validate()?;
        Ok(self)
    }

    pub fn with_failure_window(mut self, window: Duration) -> Result<Self, CircuitBreakerError> {
        self.failure_window = Some(window);
        self.validate()?;
        Ok(self)
    }

    pub fn is_disabled(&self) -> bool {
        self.failure_threshold == usize::MAX
    }

    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if self.half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        if self.recovery_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidRecoveryTimeout(self.recovery_timeout));
        }
        if self.failure_window.is_some_and(|w| w.is_zero()) {
            return Err(CircuitBreakerError::InvalidFailureWindow);
        }
        Ok(())
    }

    fn recovery_millis(&self) -> u64 {
        u64::try_from(self.recovery_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    last_failure_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            last_failure_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Circuit breaker for one named resource.
///
/// Clones share state through `Arc`, so every handle observes the same lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// ```
    /// use breakwater::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::new(5, Duration::from_secs(30)).unwrap();
    /// let breaker = CircuitBreaker::new("api.github.com", config).unwrap();
    /// ```
    pub fn new(
        name: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitBreakerError> {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        name: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CircuitBreakerError> {
        if !config.is_disabled() {
            config.validate()?;
        }
        Ok(Self::from_parts(name, config, clock))
    }

    pub(crate) fn from_parts(
        name: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { name: name.into(), state: Arc::new(CircuitBreakerState::new()), config, clock }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.current()
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Force the circuit closed and clear the failure tally.
    pub fn reset(&self) {
        self.state.reset();
        tracing::info!(target: "breakwater::circuit_breaker", resource = %self.name, "circuit reset");
    }

    /// Run `operation` under breaker protection; every error counts as a failure.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        self.execute_filtered(operation, |_| true).await
    }

    /// Run `operation`, counting only errors for which `is_failure` returns true.
    ///
    /// Errors that do not count are treated like successes for state purposes: the
    /// remote answered, it just answered something the caller could not use.
    pub async fn execute_filtered<T, E, Fut, Op, P>(
        &self,
        operation: Op,
        is_failure: P,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
        P: FnOnce(&ResilienceError<E>) -> bool,
    {
        struct HalfOpenGuard<'a> {
            state: &'a CircuitBreakerState,
        }
        impl Drop for HalfOpenGuard<'_> {
            fn drop(&mut self) {
                // saturating: a concurrent transition may already have zeroed the counter
                let _ = self.state.half_open_calls.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |n| Some(n.saturating_sub(1)),
                );
            }
        }

        let mut guard: Option<HalfOpenGuard<'_>> = None;

        loop {
            match self.state.current() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);

                    if elapsed < self.config.recovery_millis() {
                        return Err(self.open_error(elapsed));
                    }
                    if self.state.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        tracing::info!(
                            target: "breakwater::circuit_breaker",
                            resource = %self.name,
                            "circuit half-open"
                        );
                    }
                    // trial slots are claimed through the HalfOpen counter, winner included
                    continue;
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                        return Err(self.open_error(self.now_millis().saturating_sub(opened_at)));
                    }
                    guard = Some(HalfOpenGuard { state: &self.state });
                    tracing::debug!(
                        target: "breakwater::circuit_breaker",
                        resource = %self.name,
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "half-open trial call"
                    );
                    break;
                }
            }
        }

        let result = operation().await;

        let failed = match &result {
            Ok(_) => false,
            Err(err) => is_failure(err),
        };
        if failed {
            self.on_failure();
        } else {
            self.on_success();
        }
        // the trial slot stays claimed until the state reflects its outcome
        drop(guard);
        result
    }

    fn open_error<E>(&self, elapsed_millis: u64) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            resource: self.name.to_string(),
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            open_duration: Duration::from_millis(elapsed_millis),
        }
    }

    /// Any success resets the consecutive-failure tally, so only an unbroken streak opens
    /// the circuit.
    fn on_success(&self) {
        match self.state.current() {
            CircuitState::HalfOpen => {
                if self.state.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(
                        target: "breakwater::circuit_breaker",
                        resource = %self.name,
                        "circuit closed"
                    );
                }
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.now_millis();
        let previous_failure = self.state.last_failure_millis.swap(now, Ordering::AcqRel);
        let window_expired = self.config.failure_window.is_some_and(|window| {
            let window = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
            now.saturating_sub(previous_failure) > window
        });
        let failures = if window_expired {
            self.state.failure_count.store(1, Ordering::Release);
            1
        } else {
            self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1
        };

        match self.state.current() {
            CircuitState::HalfOpen => {
                // published before the state so Open is never observed with a stale timestamp
                self.state.opened_at_millis.store(now, Ordering::Release);
                if self.state.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    tracing::warn!(
                        target: "breakwater::circuit_breaker",
                        resource = %self.name,
                        failures,
                        "trial call failed, circuit reopened"
                    );
                }
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.state.opened_at_millis.store(now, Ordering::Release);
                if self.state.transition(CircuitState::Closed, CircuitState::Open) {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    tracing::error!(
                        target: "breakwater::circuit_breaker",
                        resource = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
