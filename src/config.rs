//! Tuning knobs for every component, with documented defaults.
//!
//! All structs deserialize from partial JSON (missing fields take their defaults) and
//! express durations in milliseconds (`*_ms` keys). [`AcquisitionConfig::from_env`]
//! overlays the numeric knobs operators usually tweak from `BREAKWATER_*` variables.
//!
//! | variable                          | field                              |
//! |-----------------------------------|------------------------------------|
//! | `BREAKWATER_MAX_CONCURRENCY`      | `batch.max_concurrency`            |
//! | `BREAKWATER_BATCH_SIZE`           | `batch.batch_size`                 |
//! | `BREAKWATER_RETRY_ATTEMPTS`       | `batch.retry_attempts`, `retry.max_attempts` |
//! | `BREAKWATER_CACHE_TTL_MS`         | `cache.default_ttl`                |
//! | `BREAKWATER_CACHE_MAX_ENTRIES`    | `cache.max_entries`                |
//! | `BREAKWATER_CACHE_MAX_BYTES`      | `cache.max_bytes`                  |
//! | `BREAKWATER_COMPRESSION_LEVEL`    | `client.compression_level`         |
//! | `BREAKWATER_REQUEST_TIMEOUT_MS`   | `client.request_timeout`           |

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("compression_level must be 0..=9 (got {0})")]
    CompressionLevel(u32),
    #[error("retry multiplier must be a finite value >= 1.0 (got {0})")]
    Multiplier(f64),
    #[error("retry max_delay ({max:?}) must be >= base_delay ({base:?})")]
    MaxDelay { base: Duration, max: Duration },
    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("circuit breaker: {0}")]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error("invalid config document: {0}")]
    Parse(String),
}

/// Retry manager settings (the backoff policy).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first. Default 3.
    pub max_attempts: usize,
    /// Delay before the second attempt. Default 1s.
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Growth factor between consecutive delays. Default 2.0.
    pub multiplier: f64,
    /// Upper bound on any single delay. Default 30s.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Randomize each delay within `[delay/2, delay]`. Default true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Batch processor settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Handler invocations in flight at once. Default 5.
    pub max_concurrency: usize,
    /// Items per sequential batch. Default 10.
    pub batch_size: usize,
    /// Attempts per item including the first. Default 3.
    pub retry_attempts: usize,
    /// Base delay of the per-item retry loop, doubled each retry. Default 1s.
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Pause between batches. Default 100ms.
    #[serde(rename = "inter_batch_pause_ms", with = "duration_ms")]
    pub inter_batch_pause: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            batch_size: 10,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            inter_batch_pause: Duration::from_millis(100),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window when the response carries no caching directive. Default 5 min.
    #[serde(rename = "default_ttl_ms", with = "duration_ms")]
    pub default_ttl: Duration,
    /// Entry count ceiling. Default 1000.
    pub max_entries: usize,
    /// Total stored body bytes ceiling. Default 50 MiB.
    pub max_bytes: usize,
    /// Entries older than this are dropped even if they could be revalidated. Default 24h.
    #[serde(rename = "max_entry_age_ms", with = "duration_ms")]
    pub max_entry_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_entries: 1000,
            max_bytes: 50 * 1024 * 1024,
            max_entry_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Network client settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a single transport attempt. Default 30s.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Deadline for a whole request including retries. Default 2 min.
    #[serde(rename = "operation_timeout_ms", with = "option_duration_ms")]
    pub operation_timeout: Option<Duration>,
    /// Redirects followed before failing. Default 10.
    pub max_redirects: usize,
    pub user_agent: String,
    /// Consult and populate the response cache for GET/HEAD. Default true.
    pub enable_cache: bool,
    /// Advertise and decode gzip/deflate. Default true.
    pub enable_compression: bool,
    /// Gzip level for request bodies sent with `RequestOptions::compress_body`. Default 6.
    pub compression_level: u32,
    /// Bodies shorter than this are flagged suspicious. Default 10 bytes.
    pub min_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            operation_timeout: Some(Duration::from_secs(120)),
            max_redirects: 10,
            user_agent: concat!("breakwater/", env!("CARGO_PKG_VERSION")).to_string(),
            enable_cache: true,
            enable_compression: true,
            compression_level: 6,
            min_body_bytes: 10,
        }
    }
}

/// Everything the acquisition engine can be tuned with.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub client: ClientConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl AcquisitionConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `BREAKWATER_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env(|var| std::env::var(var).ok())
    }

    /// Overlay values produced by `lookup` (an environment, or a map in tests).
    pub fn overlay_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidEnv { var: var.to_string(), value })
        }
        let read = |var: &str| -> Result<Option<u64>, ConfigError> {
            lookup(var).map(|value| parse::<u64>(var, value)).transpose()
        };

        if let Some(v) = read("BREAKWATER_MAX_CONCURRENCY")? {
            self.batch.max_concurrency = v as usize;
        }
        if let Some(v) = read("BREAKWATER_BATCH_SIZE")? {
            self.batch.batch_size = v as usize;
        }
        if let Some(v) = read("BREAKWATER_RETRY_ATTEMPTS")? {
            self.batch.retry_attempts = v as usize;
            self.retry.max_attempts = v as usize;
        }
        if let Some(v) = read("BREAKWATER_CACHE_TTL_MS")? {
            self.cache.default_ttl = Duration::from_millis(v);
        }
        if let Some(v) = read("BREAKWATER_CACHE_MAX_ENTRIES")? {
            self.cache.max_entries = v as usize;
        }
        if let Some(v) = read("BREAKWATER_CACHE_MAX_BYTES")? {
            self.cache.max_bytes = v as usize;
        }
        if let Some(v) = read("BREAKWATER_COMPRESSION_LEVEL")? {
            self.client.compression_level = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = read("BREAKWATER_REQUEST_TIMEOUT_MS")? {
            self.client.request_timeout = Duration::from_millis(v);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.cache.validate()?;
        self.batch.validate()?;
        self.retry.validate()?;
        if !self.circuit_breaker.is_disabled() {
            self.circuit_breaker.validate()?;
        }
        Ok(())
    }
}

fn non_zero(value: usize, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.max_attempts, "retry.max_attempts")?;
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Multiplier(self.multiplier));
        }
        if !self.max_delay.is_zero() && self.max_delay < self.base_delay {
            return Err(ConfigError::MaxDelay { base: self.base_delay, max: self.max_delay });
        }
        Ok(())
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.max_concurrency, "batch.max_concurrency")?;
        non_zero(self.batch_size, "batch.batch_size")?;
        non_zero(self.retry_attempts, "batch.retry_attempts")
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.max_entries, "cache.max_entries")?;
        non_zero(self.max_bytes, "cache.max_bytes")?;
        if self.max_entry_age.is_zero() {
            return Err(ConfigError::Zero { field: "cache.max_entry_age" });
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "client.request_timeout" });
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Zero { field: "client.operation_timeout" });
        }
        if self.compression_level > 9 {
            return Err(ConfigError::CompressionLevel(self.compression_level));
        }
        Ok(())
    }
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serde helper: `Option<Duration>` as integer milliseconds or null.
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        AcquisitionConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AcquisitionConfig::from_json(
            r#"{
                "batch": { "max_concurrency": 16, "retry_delay_ms": 250 },
                "cache": { "default_ttl_ms": 60000 },
                "client": { "operation_timeout_ms": null }
            }"#,
        )
        .expect("valid document");
        assert_eq!(config.batch.max_concurrency, 16);
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.retry_delay, Duration::from_millis(250));
        assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
        assert_eq!(config.client.operation_timeout, None);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = AcquisitionConfig::from_json(r#"{"batch": {"batch_size": 0}}"#).unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "batch.batch_size" });

        let err =
            AcquisitionConfig::from_json(r#"{"client": {"compression_level": 12}}"#).unwrap_err();
        assert_eq!(err, ConfigError::CompressionLevel(12));

        let err = AcquisitionConfig::from_json(r#"{"retry": {"multiplier": 0.5}}"#).unwrap_err();
        assert_eq!(err, ConfigError::Multiplier(0.5));

        let err =
            AcquisitionConfig::from_json(r#"{"circuit_breaker": {"failure_threshold": 0}}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::CircuitBreaker(_)));

        assert!(matches!(AcquisitionConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("BREAKWATER_MAX_CONCURRENCY", "2"),
            ("BREAKWATER_RETRY_ATTEMPTS", "5"),
            ("BREAKWATER_CACHE_TTL_MS", "1500"),
        ]
        .into_iter()
        .collect();
        let config = AcquisitionConfig::default()
            .overlay_env(|k| vars.get(k).map(|v| v.to_string()))
            .expect("valid overlay");
        assert_eq!(config.batch.max_concurrency, 2);
        assert_eq!(config.batch.retry_attempts, 5);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cache.default_ttl, Duration::from_millis(1500));
    }

    #[test]
    fn env_overlay_rejects_garbage() {
        let err = AcquisitionConfig::default()
            .overlay_env(|k| (k == "BREAKWATER_BATCH_SIZE").then(|| "ten".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv { var: "BREAKWATER_BATCH_SIZE".into(), value: "ten".into() }
        );
    }
}
