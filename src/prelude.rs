//! Convenient re-exports for common breakwater types.
pub use crate::{
    backoff::{Backoff, BackoffError},
    batch::{BatchProcessor, BatchReport, ErrorAction, ProcessOptions},
    cache::ResponseCache,
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    classify::{Classify, ErrorKind, FetchError},
    client::{CachedClient, FetchResult, RequestOptions, Response},
    config::AcquisitionConfig,
    jitter::Jitter,
    retry::{RetryPolicy, RetryPolicyBuilder},
    timeout::TimeoutPolicy,
    ResilienceError,
};
