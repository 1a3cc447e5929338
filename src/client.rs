//! Cached, resilient HTTP client.
//!
//! Every request flows through the same layers, outermost first:
//!
//! 1. response cache (GET/HEAD only): a fresh hit returns without touching the network
//! 2. single-flight: concurrent misses for the same `(method, url)` share one origin call
//! 3. operation deadline ([`TimeoutPolicy`]) around the whole retry sequence
//! 4. retry manager ([`RetryPolicy`]), classifying each failure
//! 5. per-host circuit breaker; `Validation` failures are not counted against the host
//! 6. the transport (`reqwest`), with a per-attempt timeout
//!
//! Successful bodies are decompressed (gzip/deflate) before they are cached or returned.
//! Corrupt compressed payloads and suspicious bodies degrade to a warning, never to an error.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cache::{is_cacheable_method, CacheEntry, CacheKey, ResponseCache};
use crate::circuit_breaker::CircuitBreakerError;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::classify::{ErrorKind, FetchError, RequestContext};
use crate::compression::{compress, decompress, Encoding};
use crate::config::{AcquisitionConfig, CacheConfig, ClientConfig, ConfigError, RetryConfig};
use crate::retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
use crate::single_flight::SingleFlight;
use crate::timeout::{TimeoutError, TimeoutPolicy};
use crate::ResilienceError;

/// Result of a client operation.
pub type FetchResult<T> = Result<T, ResilienceError<FetchError>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("retry policy: {0}")]
    Retry(#[from] BuildError),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("building HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Overrides the configured per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Set to false to bypass the cache for this request.
    pub use_cache: bool,
    /// Gzip the request body at the configured `compression_level`.
    pub compress_body: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            use_cache: true,
            compress_body: false,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self { method, ..Self::default() }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn compress_body(mut self) -> Self {
        self.compress_body = true;
        self
    }
}

/// A response handed back to callers, from the network or the cache.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    /// Decoded body.
    pub body: Bytes,
    pub from_cache: bool,
    /// Served from a cache entry confirmed by a 304.
    pub revalidated: bool,
    pub response_time: Duration,
    /// Encoded size divided by decoded size, when the body arrived compressed.
    pub compression_ratio: Option<f64>,
    /// Body is shorter than the configured minimum or carries NUL bytes in a textual type.
    pub suspicious: bool,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    fn from_entry(entry: &CacheEntry, revalidated: bool, min_body_bytes: usize) -> Self {
        Self {
            url: entry.key.url.clone(),
            status: entry.status,
            suspicious: looks_suspicious(
                &entry.key.method,
                entry.status,
                &entry.headers,
                &entry.body,
                min_body_bytes,
            ),
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            from_cache: true,
            revalidated,
            response_time: entry.response_time,
            compression_ratio: None,
        }
    }
}

/// Running client counters with derived rates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClientStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub revalidations: u64,
    /// Requests that joined another caller's in-flight fetch.
    pub coalesced: u64,
    pub errors: u64,
    /// Decoded bytes minus encoded bytes over all compressed responses.
    pub bytes_saved: u64,
    pub total_response_time: Duration,
}

impl ClientStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }

    /// Mean over successful requests.
    pub fn average_response_time(&self) -> Duration {
        let completed = self.requests.saturating_sub(self.errors);
        if completed == 0 {
            Duration::ZERO
        } else {
            self.total_response_time / u32::try_from(completed).unwrap_or(u32::MAX)
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    revalidations: AtomicU64,
    coalesced: AtomicU64,
    errors: AtomicU64,
    bytes_saved: AtomicU64,
    response_time_micros: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    elapsed: Duration,
}

struct ClientInner {
    http: reqwest::Client,
    config: ClientConfig,
    cache: Option<Arc<ResponseCache>>,
    breakers: CircuitBreakerRegistry,
    retry: RetryPolicy<FetchError>,
    operation_timeout: Option<TimeoutPolicy>,
    flights: SingleFlight<CacheKey, FetchResult<Response>>,
    counters: Counters,
}

/// The acquisition client. Cheap to clone; clones share cache, breakers and statistics.
#[derive(Clone)]
pub struct CachedClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for CachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedClient")
            .field("config", &self.inner.config)
            .field("retry", &self.inner.retry)
            .field("cache", &self.inner.cache.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builder for [`CachedClient`]. Components not supplied are built from defaults.
#[derive(Default)]
pub struct CachedClientBuilder {
    config: ClientConfig,
    cache: Option<Arc<ResponseCache>>,
    breakers: Option<CircuitBreakerRegistry>,
    retry: Option<RetryPolicy<FetchError>>,
}

impl CachedClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing cache (for example between several clients).
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn breakers(mut self, registry: CircuitBreakerRegistry) -> Self {
        self.breakers = Some(registry);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<FetchError>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> Result<CachedClient, ClientError> {
        let config = self.config;
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .build()?;

        let cache = match (config.enable_cache, self.cache) {
            (false, _) => None,
            (true, Some(cache)) => Some(cache),
            (true, None) => Some(Arc::new(ResponseCache::new(CacheConfig::default())?)),
        };
        let retry = match self.retry {
            Some(policy) => policy,
            None => RetryPolicyBuilder::from_config(&RetryConfig::default())?.build()?,
        };
        let operation_timeout = config.operation_timeout.map(TimeoutPolicy::new).transpose()?;

        Ok(CachedClient {
            inner: Arc::new(ClientInner {
                http,
                cache,
                breakers: self.breakers.unwrap_or_default(),
                retry,
                operation_timeout,
                flights: SingleFlight::new(),
                counters: Counters::default(),
                config,
            }),
        })
    }
}

impl CachedClient {
    pub fn builder() -> CachedClientBuilder {
        CachedClientBuilder::default()
    }

    /// Build every component from one validated configuration.
    pub fn from_config(config: &AcquisitionConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let retry = RetryPolicyBuilder::from_config(&config.retry)?.build()?;
        Self::builder()
            .config(config.client.clone())
            .cache(Arc::new(ResponseCache::new(config.cache.clone())?))
            .breakers(CircuitBreakerRegistry::new(config.circuit_breaker.clone())?)
            .retry(retry)
            .build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.inner.cache.as_ref()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.inner.counters;
        ClientStats {
            requests: c.requests.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            revalidations: c.revalidations.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            bytes_saved: c.bytes_saved.load(Ordering::Relaxed),
            total_response_time: Duration::from_micros(
                c.response_time_micros.load(Ordering::Relaxed),
            ),
        }
    }

    pub async fn get(&self, url: &str) -> FetchResult<Response> {
        self.request(url, RequestOptions::default()).await
    }

    pub async fn head(&self, url: &str) -> FetchResult<Response> {
        self.request(url, RequestOptions::new(Method::HEAD)).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        content_type: &'static str,
    ) -> FetchResult<Response> {
        let options = RequestOptions::new(Method::POST)
            .header(CONTENT_TYPE, HeaderValue::from_static(content_type))
            .body(body);
        self.request(url, options).await
    }

    pub async fn get_text(&self, url: &str) -> FetchResult<String> {
        Ok(self.get(url).await?.text())
    }

    /// GET and decode a JSON body. Malformed JSON is a `Validation` failure.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> FetchResult<T> {
        let response = self.get(url).await?;
        response.json().map_err(|e| {
            ResilienceError::Inner(FetchError::validation(
                RequestContext::new(Method::GET, url).with_status(response.status),
                format!("invalid JSON body: {}", e),
            ))
        })
    }

    /// Issue a request through every resilience layer.
    pub async fn request(&self, url: &str, options: RequestOptions) -> FetchResult<Response> {
        let started = Instant::now();
        let counters = &self.inner.counters;
        bump(&counters.requests);
        let method = options.method.clone();

        let result = self.dispatch(url, options).await;
        let elapsed = started.elapsed();
        match result {
            Ok(mut response) => {
                response.response_time = elapsed;
                let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
                counters.response_time_micros.fetch_add(micros, Ordering::Relaxed);
                Ok(response)
            }
            Err(err) => {
                bump(&counters.errors);
                warn!(
                    target: "breakwater::client",
                    method = %method,
                    url,
                    kind = err.kind().map(ErrorKind::as_str).unwrap_or("circuit-open"),
                    error = %err,
                    "request failed"
                );
                Err(err)
            }
        }
    }

    async fn dispatch(&self, url: &str, options: RequestOptions) -> FetchResult<Response> {
        let inner = &self.inner;
        let cache = match &inner.cache {
            Some(cache) if options.use_cache && is_cacheable_method(&options.method) => {
                cache.clone()
            }
            _ => return inner.fetch_uncached(url, &options).await,
        };

        let stale = match cache.get(url, &options.method) {
            Some(lookup) if !lookup.hit.stale => {
                bump(&inner.counters.cache_hits);
                debug!(target: "breakwater::client", url, age_ms = lookup.hit.age.as_millis() as u64, "cache hit");
                return Ok(Response::from_entry(
                    &lookup.entry,
                    lookup.hit.revalidated,
                    inner.config.min_body_bytes,
                ));
            }
            Some(lookup) => Some(lookup.entry),
            None => None,
        };
        bump(&inner.counters.cache_misses);

        let key = CacheKey::new(options.method.clone(), url);
        let owner = inner.clone();
        let target = url.to_string();
        let (result, leader) = inner
            .flights
            .run(key, move || async move {
                owner.fetch_and_cache(&target, &options, &cache, stale).await
            })
            .await;
        if !leader {
            bump(&inner.counters.coalesced);
            debug!(target: "breakwater::client", url, "joined in-flight fetch");
        }
        result
    }

    /// Stream a GET body to `path`, creating or truncating it. Returns bytes written.
    ///
    /// Bypasses the cache and compression; each retry restarts the file.
    pub async fn download_to_file(&self, url: &str, path: impl AsRef<Path>) -> FetchResult<u64> {
        let inner = &self.inner;
        let path = path.as_ref();
        let started = Instant::now();
        bump(&inner.counters.requests);

        let resource = match resource_name(url, &Method::GET) {
            Ok(resource) => resource,
            Err(err) => {
                bump(&inner.counters.errors);
                return Err(err);
            }
        };
        let label = format!("download {}", url);
        let attempt = || {
            inner.breakers.execute_filtered(
                &resource,
                move || inner.stream_to_file(url, path),
                counts_against_breaker,
            )
        };
        let retried = || inner.retry.execute(&label, attempt);
        let result = match &inner.operation_timeout {
            Some(timeout) => timeout.execute(retried).await,
            None => retried().await,
        };

        match &result {
            Ok(written) => {
                let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                inner.counters.response_time_micros.fetch_add(micros, Ordering::Relaxed);
                debug!(target: "breakwater::client", url, path = %path.display(), bytes = written, "download complete");
            }
            Err(err) => {
                bump(&inner.counters.errors);
                warn!(target: "breakwater::client", url, error = %err, "download failed");
            }
        }
        result
    }
}

/// Only failures that say something about the remote open its breaker.
fn counts_against_breaker(err: &ResilienceError<FetchError>) -> bool {
    err.kind() != Some(ErrorKind::Validation)
}

fn resource_name(url: &str, method: &Method) -> FetchResult<String> {
    let context = || RequestContext::new(method.clone(), url);
    let parsed = url::Url::parse(url).map_err(|e| {
        ResilienceError::Inner(FetchError::validation(context(), format!("invalid URL: {}", e)))
    })?;
    match parsed.host_str() {
        Some(host) => Ok(host.to_ascii_lowercase()),
        None => Err(ResilienceError::Inner(FetchError::validation(context(), "URL has no host"))),
    }
}

fn is_textual(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let content_type = content_type.to_ascii_lowercase();
    content_type.starts_with("text/")
        || ["json", "xml", "javascript", "yaml"].iter().any(|t| content_type.contains(t))
}

fn looks_suspicious(
    method: &Method,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
    min_body_bytes: usize,
) -> bool {
    if *method == Method::HEAD || status == 204 || status == 304 {
        return false;
    }
    body.len() < min_body_bytes || (is_textual(headers) && body.contains(&0))
}

impl ClientInner {
    async fn fetch_uncached(&self, url: &str, options: &RequestOptions) -> FetchResult<Response> {
        let raw = self.fetch_network(url, options, &HeaderMap::new()).await?;
        let response = self.finish(url, &options.method, raw);
        if !is_cacheable_method(&options.method) && response.is_success() {
            if let Some(cache) = &self.cache {
                if cache.invalidate(Some(url)) > 0 {
                    debug!(target: "breakwater::client", url, method = %options.method, "cache invalidated by unsafe method");
                }
            }
        }
        Ok(response)
    }

    async fn fetch_and_cache(
        &self,
        url: &str,
        options: &RequestOptions,
        cache: &ResponseCache,
        stale: Option<Arc<CacheEntry>>,
    ) -> FetchResult<Response> {
        let conditional = match stale {
            Some(_) => cache.conditional_headers(url, &options.method),
            None => HeaderMap::new(),
        };
        let raw = self.fetch_network(url, options, &conditional).await?;

        if raw.status == 304 {
            // The held entry answers the 304 even if the cache dropped it meanwhile.
            let refreshed = cache
                .handle_not_modified(url, &options.method, raw.elapsed, &raw.headers)
                .or_else(|| {
                    stale
                        .as_deref()
                        .map(|entry| cache.restore_not_modified(entry, raw.elapsed, &raw.headers))
                });
            if let Some(entry) = refreshed {
                bump(&self.counters.revalidations);
                debug!(target: "breakwater::client", url, "not modified; serving revalidated entry");
                return Ok(Response::from_entry(&entry, true, self.config.min_body_bytes));
            }
        }

        let response = self.finish(url, &options.method, raw);
        if response.is_success() {
            cache.set(
                url,
                &options.method,
                response.status,
                &response.headers,
                response.body.clone(),
                response.response_time,
            );
        }
        Ok(response)
    }

    async fn fetch_network(
        &self,
        url: &str,
        options: &RequestOptions,
        conditional: &HeaderMap,
    ) -> FetchResult<RawResponse> {
        let resource = resource_name(url, &options.method)?;
        let body = self.encode_body(url, options)?;
        let body = body.as_ref();
        let label = format!("{} {}", options.method, url);
        let attempt = || {
            self.breakers.execute_filtered(
                &resource,
                move || self.send_once(url, options, conditional, body),
                counts_against_breaker,
            )
        };
        let retried = || self.retry.execute(&label, attempt);
        match &self.operation_timeout {
            Some(timeout) => timeout.execute(retried).await,
            None => retried().await,
        }
    }

    /// The request body as it goes on the wire, compressed once for every attempt.
    fn encode_body(&self, url: &str, options: &RequestOptions) -> FetchResult<Option<Bytes>> {
        let Some(body) = &options.body else { return Ok(None) };
        if !options.compress_body {
            return Ok(Some(body.clone()));
        }
        let packed = compress(body, Encoding::Gzip, self.config.compression_level).map_err(|e| {
            let context = RequestContext::new(options.method.clone(), url);
            ResilienceError::Inner(FetchError::validation(
                context,
                format!("request body compression failed: {}", e),
            ))
        })?;
        debug!(
            target: "breakwater::client",
            url,
            raw = body.len(),
            encoded = packed.len(),
            level = self.config.compression_level,
            "request body compressed"
        );
        Ok(Some(Bytes::from(packed)))
    }

    async fn send_once(
        &self,
        url: &str,
        options: &RequestOptions,
        conditional: &HeaderMap,
        body: Option<&Bytes>,
    ) -> FetchResult<RawResponse> {
        let context = RequestContext::new(options.method.clone(), url);
        let mut headers = options.headers.clone();
        headers.extend(conditional.clone());
        if self.config.enable_compression && !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        }
        if options.compress_body && body.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(Encoding::Gzip.as_str()));
        }

        let mut request = self.http.request(options.method.clone(), url).headers(headers);
        if let Some(body) = body {
            request = request.body(body.clone());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            let context = match options.timeout {
                Some(timeout) => context.clone().with_timeout(timeout),
                None => context.clone().with_timeout(self.config.request_timeout),
            };
            ResilienceError::Inner(FetchError::from_reqwest(context, &e))
        })?;
        let status = response.status().as_u16();
        if let Some(err) = FetchError::from_status(context.clone(), status) {
            return Err(ResilienceError::Inner(err));
        }
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ResilienceError::Inner(FetchError::from_reqwest(context, &e)))?;

        Ok(RawResponse { status, headers, body, elapsed: started.elapsed() })
    }

    /// Decode the body and inspect it.
    fn finish(&self, url: &str, method: &Method, raw: RawResponse) -> Response {
        let RawResponse { status, mut headers, body, elapsed } = raw;
        let mut compression_ratio = None;
        let mut body = body;

        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| (v.to_string(), Encoding::from_header(v)));
        match encoding {
            Some((_, Some(Encoding::Identity))) | None => {}
            Some((name, None)) => {
                warn!(target: "breakwater::client", url, encoding = %name, "unsupported content-encoding; body left as received");
            }
            // HEAD and 204/304 carry the header with nothing to decode
            Some((_, Some(encoding))) if self.config.enable_compression && !body.is_empty() => {
                match decompress(&body, encoding) {
                    Ok(plain) => {
                        let saved = plain.len().saturating_sub(body.len()) as u64;
                        self.counters.bytes_saved.fetch_add(saved, Ordering::Relaxed);
                        if !plain.is_empty() {
                            compression_ratio = Some(body.len() as f64 / plain.len() as f64);
                        }
                        headers.remove(CONTENT_ENCODING);
                        headers.remove(CONTENT_LENGTH);
                        body = Bytes::from(plain);
                    }
                    Err(e) => {
                        warn!(
                            target: "breakwater::client",
                            url,
                            encoding = encoding.as_str(),
                            error = %e,
                            "decompression failed; returning raw bytes"
                        );
                    }
                }
            }
            Some(_) => {}
        }

        let suspicious =
            looks_suspicious(method, status, &headers, &body, self.config.min_body_bytes);
        if suspicious {
            warn!(
                target: "breakwater::client",
                url,
                status,
                bytes = body.len(),
                "suspicious response body"
            );
        }

        Response {
            url: url.to_string(),
            status,
            headers,
            body,
            from_cache: false,
            revalidated: false,
            response_time: elapsed,
            compression_ratio,
            suspicious,
        }
    }

    async fn stream_to_file(&self, url: &str, path: &Path) -> FetchResult<u64> {
        let context = RequestContext::new(Method::GET, url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ResilienceError::Inner(FetchError::from_reqwest(context.clone(), &e)))?;
        if let Some(err) = FetchError::from_status(context.clone(), response.status().as_u16()) {
            return Err(ResilienceError::Inner(err));
        }

        let write_failed = |e: std::io::Error| {
            ResilienceError::Inner(FetchError::validation(
                context.clone(),
                format!("writing {}: {}", path.display(), e),
            ))
        };
        let mut file = tokio::fs::File::create(path).await.map_err(&write_failed)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ResilienceError::Inner(FetchError::from_reqwest(context.clone(), &e)))?;
            file.write_all(&chunk).await.map_err(&write_failed)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(&write_failed)?;
        Ok(written)
    }
}
