//! Named circuit breakers, one per upstream resource.
//!
//! The registry is an ordinary value: construct one per process (or per test) and pass it
//! to whatever needs it. Breakers are created lazily on first use with the registry's
//! default config, unless one was registered explicitly for that name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("circuit breaker '{id}' not found")]
    NotFound { id: String },
}

#[derive(Debug)]
struct RegistryInner {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

/// Thread-safe map from resource name to breaker. Clones share the same map.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::from_parts(CircuitBreakerConfig::default(), Arc::new(MonotonicClock::default()))
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        Self::with_clock(defaults, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        defaults: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CircuitBreakerError> {
        if !defaults.is_disabled() {
            defaults.validate()?;
        }
        Ok(Self::from_parts(defaults, clock))
    }

    fn from_parts(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                defaults,
                clock,
                breakers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Install a breaker with its own config, replacing any existing one for `name`.
    ///
    /// Replacement discards the old breaker's state; last registration wins.
    pub fn register(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<CircuitBreaker, CircuitBreakerError> {
        let breaker = CircuitBreaker::with_clock(name, config, self.inner.clock.clone())?;
        let mut map = self.inner.breakers.write().expect("circuit breaker registry poisoned");
        if map.contains_key(name) {
            warn!(
                target: "breakwater::circuit_breaker_registry",
                resource = %name,
                "circuit breaker replaced; last registration wins"
            );
        }
        map.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Breaker for `name`, created with the default config on first use.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        if let Some(existing) =
            self.inner.breakers.read().expect("circuit breaker registry poisoned").get(name)
        {
            return existing.clone();
        }
        let mut map = self.inner.breakers.write().expect("circuit breaker registry poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| {
                CircuitBreaker::from_parts(
                    name,
                    self.inner.defaults.clone(),
                    self.inner.clock.clone(),
                )
            })
            .clone()
    }

    /// Run `operation` through the breaker for `name`.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        name: &str,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        self.breaker(name).execute(operation).await
    }

    /// Like [`execute`](Self::execute), counting only errors accepted by `is_failure`.
    pub async fn execute_filtered<T, E, Fut, Op, P>(
        &self,
        name: &str,
        operation: Op,
        is_failure: P,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
        P: FnOnce(&ResilienceError<E>) -> bool,
    {
        self.breaker(name).execute_filtered(operation, is_failure).await
    }

    /// Current state, `None` if the resource has never been used.
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        let map = self.inner.breakers.read().expect("circuit breaker registry poisoned");
        map.get(name).map(CircuitBreaker::state)
    }

    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        let map = self.inner.breakers.read().expect("circuit breaker registry poisoned");
        match map.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { id: name.to_string() }),
        }
    }

    pub fn reset_all(&self) {
        let map = self.inner.breakers.read().expect("circuit breaker registry poisoned");
        map.values().for_each(CircuitBreaker::reset);
    }

    /// Breaker states sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.breakers.read().expect("circuit breaker registry poisoned");
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.breakers.read().expect("circuit breaker registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
