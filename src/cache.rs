//! Response cache
//!
//! Process-local, byte-bounded, keyed by hostname + path + normalized query +
//! the request headers responses commonly vary on. Entries are never served
//! past their expiry; the periodic sweep reclaims the ones nobody asks for.

use bytes::Bytes;
use dashmap::DashMap;
use hyper::header::{HeaderMap, AUTHORIZATION, CACHE_CONTROL, SET_COOKIE, VARY};
use hyper::{Method, StatusCode};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::CacheConfig;

/// Request headers that select a different cached variant
const VARY_HEADERS: &[&str] = &["accept-encoding"];

/// Structured cache key; `as_string` is the map key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hostname: String,
    pub path: String,
    pub query: String,
    pub variant: String,
}

impl CacheKey {
    pub fn new(hostname: &str, path: &str, query: Option<&str>, headers: &HeaderMap) -> Self {
        let query = query
            .map(|q| {
                let mut pairs: Vec<&str> = q.split('&').filter(|p| !p.is_empty()).collect();
                pairs.sort_unstable();
                pairs.join("&")
            })
            .unwrap_or_default();

        let variant = VARY_HEADERS
            .iter()
            .map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.replace(' ', "").to_lowercase())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(";");

        Self {
            hostname: hostname.to_string(),
            path: path.to_string(),
            query,
            variant,
        }
    }

    pub fn as_string(&self) -> String {
        format!("{}|{}?{}|{}", self.hostname, self.path, self.query, self.variant)
    }
}

/// Stored response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Bytes this response occupies in the cache: body plus header names and values
    pub fn stored_size(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        (self.body.len() + headers) as u64
    }
}

#[derive(Debug)]
struct CacheEntry {
    hostname: String,
    path: String,
    response: CachedResponse,
    size: u64,
    stored_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// What a purge call should clear
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    Prefix { hostname: String, path: String },
    /// A path without a hostname; purges nothing
    Unscoped,
}

impl PurgeScope {
    /// Interpret `/cdn-purge?path=&domain=` parameters. A missing path means "all".
    pub fn from_params(path: Option<&str>, domain: Option<&str>) -> Self {
        let path = path.map(str::trim).filter(|p| !p.is_empty()).unwrap_or("all");
        let domain = domain.map(str::trim).filter(|d| !d.is_empty());

        match (path, domain) {
            ("all", None) => PurgeScope::All,
            ("all", Some(hostname)) => PurgeScope::Prefix {
                hostname: hostname.to_lowercase(),
                path: "/".to_string(),
            },
            (path, Some(hostname)) => PurgeScope::Prefix {
                hostname: hostname.to_lowercase(),
                path: path.to_string(),
            },
            (_, None) => PurgeScope::Unscoped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeResult {
    pub purged: bool,
    pub removed: usize,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    total_bytes: AtomicU64,
    max_bytes: u64,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        info!(
            max_bytes = config.max_bytes,
            default_ttl_secs = config.default_ttl.as_secs(),
            "Response cache initialized"
        );
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            max_bytes: config.max_bytes,
            default_ttl: config.default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh entry for `key`. Expired entries are dropped on the way.
    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let key = key.as_string();
        let now = Instant::now();

        if let Some(entry) = self.entries.get(&key) {
            if !entry.is_expired(now) {
                return Some(entry.response.clone());
            }
        } else {
            return None;
        }

        // Re-checked under the shard lock: a concurrent put may have refreshed it
        if let Some((_, expired)) = self.entries.remove_if(&key, |_, entry| entry.is_expired(now)) {
            self.release(expired.size);
        }
        None
    }

    pub fn put(&self, key: &CacheKey, response: CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let size = response.stored_size();
        if size > self.max_bytes {
            debug!(key = %key.as_string(), size, "Response larger than cache, not stored");
            return;
        }

        let now = Instant::now();
        let entry = CacheEntry {
            hostname: key.hostname.clone(),
            path: key.path.clone(),
            response,
            size,
            stored_at: now,
            expires_at: now + ttl,
        };

        self.total_bytes.fetch_add(size, Ordering::SeqCst);
        if let Some(previous) = self.entries.insert(key.as_string(), entry) {
            self.release(previous.size);
        }

        self.evict_to_fit();
    }

    /// Drop oldest entries until the byte budget holds
    fn evict_to_fit(&self) {
        if self.total_bytes.load(Ordering::SeqCst) <= self.max_bytes {
            return;
        }

        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|e| (e.stored_at, e.key().clone()))
            .collect();
        by_age.sort_by_key(|(stored_at, _)| *stored_at);

        let mut evicted = 0;
        for (_, key) in by_age {
            if self.total_bytes.load(Ordering::SeqCst) <= self.max_bytes {
                break;
            }
            if self.remove_key(&key) {
                evicted += 1;
            }
        }
        debug!(evicted, "Evicted cache entries over size budget");
    }

    fn remove_key(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.release(entry.size);
                true
            }
            None => false,
        }
    }

    /// Subtract from the byte count, never below zero
    fn release(&self, bytes: u64) {
        let _ = self
            .total_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                Some(total.saturating_sub(bytes))
            });
    }

    pub fn purge(&self, scope: &PurgeScope) -> PurgeResult {
        match scope {
            PurgeScope::All => {
                let removed = self.remove_where(|_| true);
                info!(removed, "Cache purged");
                PurgeResult {
                    purged: true,
                    removed,
                }
            }
            PurgeScope::Prefix { hostname, path } => {
                let removed = self.remove_where(|entry| {
                    entry.hostname == *hostname && entry.path.starts_with(path.as_str())
                });
                info!(hostname = %hostname, path = %path, removed, "Cache purged for path");
                PurgeResult {
                    purged: removed > 0,
                    removed,
                }
            }
            PurgeScope::Unscoped => PurgeResult {
                purged: false,
                removed: 0,
            },
        }
    }

    /// Remove every expired entry, returning how many went
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.remove_where(|entry| entry.is_expired(now));
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut removed = 0;
        let mut freed = 0u64;
        self.entries.retain(|_, entry| {
            if predicate(entry) {
                removed += 1;
                freed += entry.size;
                false
            } else {
                true
            }
        });
        self.release(freed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }
}

/// TTL to store a response for, or `None` when it must not be cached.
/// Origin `s-maxage`/`max-age` override `default_ttl`. Only GET responses are
/// stored: a HEAD response has no body but shares the GET key.
pub fn cache_ttl(
    method: &Method,
    request_headers: &HeaderMap,
    status: StatusCode,
    response_headers: &HeaderMap,
    default_ttl: Duration,
) -> Option<Duration> {
    if method != Method::GET {
        return None;
    }
    if request_headers.contains_key(AUTHORIZATION) {
        return None;
    }
    if !matches!(status.as_u16(), 200 | 203 | 300 | 301 | 308 | 404 | 410) {
        return None;
    }
    if response_headers.contains_key(SET_COOKIE) {
        return None;
    }
    if response_headers
        .get(VARY)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "*")
        .unwrap_or(false)
    {
        return None;
    }

    let mut ttl = default_ttl;
    if let Some(cache_control) = response_headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        let mut max_age = None;
        let mut s_maxage = None;
        for directive in cache_control.split(',') {
            let directive = directive.trim().to_lowercase();
            match directive.as_str() {
                "no-store" | "no-cache" | "private" => return None,
                _ => {}
            }
            if let Some(value) = directive.strip_prefix("s-maxage=") {
                s_maxage = value.trim_matches('"').parse::<u64>().ok();
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                max_age = value.trim_matches('"').parse::<u64>().ok();
            }
        }
        if let Some(seconds) = s_maxage.or(max_age) {
            ttl = Duration::from_secs(seconds);
        }
    }

    if ttl.is_zero() {
        None
    } else {
        Some(ttl)
    }
}
