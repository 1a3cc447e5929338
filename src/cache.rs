//! In-memory HTTP response cache with conditional revalidation.
//!
//! Entries are keyed by `(method, url)` and only GET/HEAD successes are stored. Freshness
//! comes from `Cache-Control` (`s-maxage`, `max-age`, `no-cache`) or the configured default
//! TTL. A stale entry is kept and revalidated with `If-None-Match` / `If-Modified-Since`;
//! it leaves the cache only through invalidation, LRU eviction, or the retention limit
//! (`max_entry_age`).
//!
//! Entries are immutable and handed out as `Arc<CacheEntry>`: a 304 replaces the entry with
//! a refreshed copy, and eviction never pulls data out from under a reader.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::Method;
use tracing::{debug, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CacheConfig, ConfigError};

/// Identity of a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into() }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Only safe, idempotent reads are cached.
pub fn is_cacheable_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
        };
        Self { etag: text(ETAG), last_modified: text(LAST_MODIFIED) }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Directives {
    no_store: bool,
    no_cache: bool,
    max_age: Option<u64>,
    s_maxage: Option<u64>,
}

impl Directives {
    fn parse(headers: &HeaderMap) -> Self {
        let mut out = Self::default();
        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let (name, arg) = match directive.split_once('=') {
                    Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                    None => (directive.trim(), None),
                };
                match name.to_ascii_lowercase().as_str() {
                    "no-store" => out.no_store = true,
                    "no-cache" => out.no_cache = true,
                    "max-age" => out.max_age = arg.and_then(|a| a.parse().ok()),
                    "s-maxage" => out.s_maxage = arg.and_then(|a| a.parse().ok()),
                    _ => {}
                }
            }
        }
        out
    }

    fn freshness(&self, default_ttl: Duration) -> Duration {
        if self.no_cache {
            return Duration::ZERO;
        }
        self.s_maxage.or(self.max_age).map(Duration::from_secs).unwrap_or(default_ttl)
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// How long the origin took to produce this response (or its last 304).
    pub response_time: Duration,
    pub validators: Validators,
    /// Freshness lifetime measured from `stored_at_ms`.
    pub freshness: Duration,
    /// Clock reading when stored or last revalidated.
    pub stored_at_ms: u64,
    /// Whether the entry has been confirmed by at least one 304.
    pub revalidated: bool,
}

impl CacheEntry {
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.stored_at_ms))
    }

    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.age(now_ms) >= self.freshness
    }

    /// `If-None-Match` / `If-Modified-Since` built from this entry's validators.
    pub fn conditional_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut add = |name: HeaderName, value: &Option<String>| {
            if let Some(v) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, v);
            }
        };
        add(IF_NONE_MATCH, &self.validators.etag);
        add(IF_MODIFIED_SINCE, &self.validators.last_modified);
        headers
    }

    fn weight(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitInfo {
    pub age: Duration,
    pub stale: bool,
    pub revalidated: bool,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: Arc<CacheEntry>,
    pub hit: HitInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fresh hits.
    pub hits: u64,
    /// Lookups that found an entry needing revalidation.
    pub stale_hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub evictions: u64,
    /// Entries dropped for exceeding `max_entry_age`.
    pub expirations: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct Store {
    lru: LruCache<CacheKey, Arc<CacheEntry>>,
    bytes: usize,
}

impl Store {
    fn remove(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let removed = self.lru.pop(key)?;
        self.bytes -= removed.weight();
        Some(removed)
    }
}

/// Bounded response cache shared by reference (`Arc<ResponseCache>`).
pub struct ResponseCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: Mutex<Store>,
    counters: Counters,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            store: Mutex::new(Store { lru: LruCache::unbounded(), bytes: 0 }),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn retention_ms(&self) -> u64 {
        u64::try_from(self.config.max_entry_age.as_millis()).unwrap_or(u64::MAX)
    }

    fn expired(&self, entry: &CacheEntry, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.stored_at_ms) > self.retention_ms()
    }

    /// Look up `(method, url)`, promoting the entry in LRU order.
    pub fn get(&self, url: &str, method: &Method) -> Option<CacheLookup> {
        if !is_cacheable_method(method) {
            return None;
        }
        let key = CacheKey::new(method.clone(), url);
        let now = self.clock.now_millis();
        let found = {
            let mut store = self.store.lock().expect("response cache poisoned");
            let cached = store.lru.get(&key).cloned();
            match cached {
                Some(entry) if self.expired(&entry, now) => {
                    store.remove(&key);
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    None
                }
                other => other,
            }
        };

        let Some(entry) = found else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let hit = HitInfo {
            age: entry.age(now),
            stale: entry.is_stale(now),
            revalidated: entry.revalidated,
        };
        let counter = if hit.stale { &self.counters.stale_hits } else { &self.counters.hits };
        counter.fetch_add(1, Ordering::Relaxed);
        Some(CacheLookup { entry, hit })
    }

    /// Store a response. Returns `None` when the response is not cacheable.
    pub fn set(
        &self,
        url: &str,
        method: &Method,
        status: u16,
        headers: &HeaderMap,
        body: Bytes,
        response_time: Duration,
    ) -> Option<Arc<CacheEntry>> {
        if !is_cacheable_method(method) || !(200..300).contains(&status) {
            return None;
        }
        let directives = Directives::parse(headers);
        if directives.no_store {
            debug!(target: "breakwater::cache", url, "no-store response not cached");
            return None;
        }
        if body.len() > self.config.max_bytes {
            debug!(target: "breakwater::cache", url, bytes = body.len(), "response larger than cache");
            return None;
        }
        let entry = Arc::new(CacheEntry {
            key: CacheKey::new(method.clone(), url),
            status,
            headers: headers.clone(),
            body,
            response_time,
            validators: Validators::from_headers(headers),
            freshness: directives.freshness(self.config.default_ttl),
            stored_at_ms: self.clock.now_millis(),
            revalidated: false,
        });
        self.insert(entry.clone());
        Some(entry)
    }

    fn insert(&self, entry: Arc<CacheEntry>) {
        let mut store = self.store.lock().expect("response cache poisoned");
        store.bytes += entry.weight();
        if let Some(previous) = store.lru.put(entry.key.clone(), entry) {
            store.bytes -= previous.weight();
        }
        while store.lru.len() > self.config.max_entries || store.bytes > self.config.max_bytes {
            let Some((key, evicted)) = store.lru.pop_lru() else { break };
            store.bytes -= evicted.weight();
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(target: "breakwater::cache", key = %key, "evicted least recently used entry");
        }
    }

    /// Headers that turn the next request for `(method, url)` into a conditional one.
    ///
    /// Empty when nothing is cached or the entry carries no validators.
    pub fn conditional_headers(&self, url: &str, method: &Method) -> HeaderMap {
        let key = CacheKey::new(method.clone(), url);
        let entry = {
            let store = self.store.lock().expect("response cache poisoned");
            store.lru.peek(&key).cloned()
        };
        let Some(entry) = entry else { return HeaderMap::new() };
        let headers = entry.conditional_headers();

        if headers.is_empty() && entry.is_stale(self.clock.now_millis()) {
            warn!(
                target: "breakwater::cache",
                key = %key,
                "stale entry has no validators; full refetch required"
            );
        }
        headers
    }

    /// Record a `304 Not Modified` for `(method, url)`.
    ///
    /// Freshness restarts from now; validators and caching headers sent with the 304
    /// replace the stored ones. The body is untouched. Returns the refreshed entry, or
    /// `None` if it was evicted in the meantime.
    pub fn handle_not_modified(
        &self,
        url: &str,
        method: &Method,
        response_time: Duration,
        headers: &HeaderMap,
    ) -> Option<Arc<CacheEntry>> {
        let key = CacheKey::new(method.clone(), url);
        let mut store = self.store.lock().expect("response cache poisoned");
        let current = store.lru.get(&key)?.clone();
        let refreshed = Arc::new(self.refresh(&current, response_time, headers));
        store.lru.put(key, refreshed.clone());
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        debug!(target: "breakwater::cache", url, "entry revalidated");
        Some(refreshed)
    }

    /// Record a `304 Not Modified` for an entry the caller still holds but the cache
    /// may have dropped since the conditional request went out.
    ///
    /// The refreshed entry is stored again, subject to the usual bounds.
    pub fn restore_not_modified(
        &self,
        entry: &CacheEntry,
        response_time: Duration,
        headers: &HeaderMap,
    ) -> Arc<CacheEntry> {
        let refreshed = Arc::new(self.refresh(entry, response_time, headers));
        self.insert(refreshed.clone());
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        debug!(target: "breakwater::cache", key = %entry.key, "evicted entry restored by revalidation");
        refreshed
    }

    fn refresh(
        &self,
        current: &CacheEntry,
        response_time: Duration,
        headers: &HeaderMap,
    ) -> CacheEntry {
        let mut merged = current.headers.clone();
        for name in [CACHE_CONTROL, EXPIRES, DATE, ETAG, LAST_MODIFIED] {
            if let Some(value) = headers.get(&name) {
                merged.insert(name, value.clone());
            }
        }
        let mut validators = Validators::from_headers(&merged);
        if validators.is_empty() {
            validators = current.validators.clone();
        }
        CacheEntry {
            key: current.key.clone(),
            status: current.status,
            freshness: Directives::parse(&merged).freshness(self.config.default_ttl),
            headers: merged,
            body: current.body.clone(),
            response_time,
            validators,
            stored_at_ms: self.clock.now_millis(),
            revalidated: true,
        }
    }

    /// Drop entries for `url` (both GET and HEAD), or everything when `url` is `None`.
    /// Returns how many entries were removed.
    pub fn invalidate(&self, url: Option<&str>) -> usize {
        let mut store = self.store.lock().expect("response cache poisoned");
        match url {
            None => {
                let removed = store.lru.len();
                store.lru.clear();
                store.bytes = 0;
                removed
            }
            Some(url) => [Method::GET, Method::HEAD]
                .into_iter()
                .filter_map(|m| store.remove(&CacheKey::new(m, url)))
                .count(),
        }
    }

    /// Remove entries older than `max_entry_age`. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut store = self.store.lock().expect("response cache poisoned");
        let expired: Vec<CacheKey> = store
            .lru
            .iter()
            .filter(|(_, entry)| self.expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            store.remove(key);
        }
        self.counters.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.store.lock().expect("response cache poisoned").lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let store = self.store.lock().expect("response cache poisoned");
            (store.lru.len(), store.bytes)
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries,
            bytes,
        }
    }
}
