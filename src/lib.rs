#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # breakwater
//!
//! Resilient, concurrent content acquisition: the layer collectors use to reach the
//! network safely at scale.
//!
//! ## Components
//!
//! - **Batch processor**: bounded concurrency, sequential batches, per-item retry with an
//!   error policy ([`BatchProcessor`])
//! - **Circuit breakers** keyed by resource name, lock-free state machine
//!   ([`CircuitBreakerRegistry`])
//! - **Retry manager** with exponential backoff, jitter and error classification
//!   ([`RetryPolicy`])
//! - **Response cache** with conditional revalidation, LRU bounds and request coalescing
//!   ([`ResponseCache`], [`SingleFlight`])
//! - **Cached client** tying the above together over `reqwest` ([`CachedClient`])
//!
//! Nothing is global: every shared component is an explicit value, cloned or wrapped in
//! `Arc` by whoever needs it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use breakwater::{AcquisitionConfig, BatchProcessor, CachedClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcquisitionConfig::from_env()?;
//! let client = CachedClient::from_config(&config)?;
//! let processor = BatchProcessor::new(config.batch.clone())?;
//!
//! let feeds = vec![
//!     "https://blog.rust-lang.org/feed.xml".to_string(),
//!     "https://this-week-in-rust.org/rss.xml".to_string(),
//! ];
//! let report = processor
//!     .process_items(
//!         feeds,
//!         |url| {
//!             let client = client.clone();
//!             let url = url.clone();
//!             async move { client.get_text(&url).await }
//!         },
//!         "feeds",
//!     )
//!     .await;
//! println!("{}/{} feeds fetched", report.successful, report.total);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod classify;
pub mod client;
pub mod clock;
pub mod compression;
pub mod config;
pub mod error;
pub mod jitter;
pub mod limiter;
pub mod prelude;
pub mod retry;
pub mod single_flight;
pub mod sleeper;
pub mod timeout;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use batch::{
    BatchProcessor, BatchReport, ErrorAction, FailureDisposition, ItemFailure, ProcessOptions,
    ProcessingOutcome,
};
pub use cache::{CacheEntry, CacheKey, CacheLookup, CacheStats, HitInfo, ResponseCache, Validators};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, RegistryError};
pub use classify::{Classify, ErrorKind, FetchError, RequestContext};
pub use client::{
    CachedClient, CachedClientBuilder, ClientError, ClientStats, FetchResult, RequestOptions,
    Response,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use compression::Encoding;
pub use config::{
    AcquisitionConfig, BatchConfig, CacheConfig, ClientConfig, ConfigError, RetryConfig,
};
pub use error::ResilienceError;
pub use jitter::Jitter;
pub use limiter::{ConcurrencyLimiter, LimiterError, LimiterPermit};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use single_flight::SingleFlight;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy};
