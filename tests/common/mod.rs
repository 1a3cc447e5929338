#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use breakwater::{
    Backoff, CachedClient, CircuitBreakerConfig, CircuitBreakerRegistry, ClientConfig,
    FetchError, InstantSleeper, Jitter, ManualClock, RetryPolicy,
};

/// Retry policy that never waits.
pub fn fast_retry(max_attempts: usize) -> RetryPolicy<FetchError> {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .backoff(Backoff::constant(Duration::from_millis(10)))
        .with_jitter(Jitter::None)
        .classified()
        .with_sleeper(InstantSleeper)
        .build()
        .expect("valid retry policy")
}

/// Breaker registry on a hand-driven clock.
pub fn registry(threshold: usize) -> (CircuitBreakerRegistry, ManualClock) {
    let clock = ManualClock::new();
    let config = CircuitBreakerConfig::new(threshold, Duration::from_secs(30))
        .expect("valid breaker config");
    let registry = CircuitBreakerRegistry::with_clock(config, Arc::new(clock.clone()))
        .expect("valid registry");
    (registry, clock)
}

pub fn client(max_attempts: usize) -> CachedClient {
    client_with(max_attempts, registry(5).0)
}

pub fn client_with(max_attempts: usize, breakers: CircuitBreakerRegistry) -> CachedClient {
    CachedClient::builder()
        .config(ClientConfig { request_timeout: Duration::from_secs(5), ..ClientConfig::default() })
        .breakers(breakers)
        .retry(fast_retry(max_attempts))
        .build()
        .expect("client builds")
}
