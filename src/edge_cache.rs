//! Edge Cache Module
//!
//! Gateway-local response cache over a [`CacheStore`] backend, distinct from
//! any cluster-side caches. Two operating modes share the policy:
//!
//! - **Internal mode** (`cache_method = "inner"`): the object handlers
//!   consult the cache inline on GET and populate it on small-object
//!   GET/PUT. Hits are revalidated against the cluster with a conditional
//!   get on every request.
//! - **Interceptor mode** (anything else): `on_request` / `on_response`
//!   hooks wrap the normal handler, serving fresh entries with `Age` and
//!   `Cache-Control` headers and honoring `If-Modified-Since`, without the
//!   handlers knowing the cache exists.
//!
//! Every cache operation is best-effort: a failing backend degrades to
//! pass-through, never to a user-visible error.

use crate::cache_store::{unix_now, CacheStore, CachedEntry};
use crate::chunk_key::contains_separator;
use crate::config::CacheConfig;
use crate::digest::md5_u128;
use crate::storage_rpc::{GetOrMatch, ObjectMetadata, StorageRpc};
use crate::Result;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use regex::bytes::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of an internal-mode cache lookup on GET.
pub enum CachedLookup {
    /// No usable cache entry; proceed with a normal cluster read
    Miss,
    /// Cluster confirmed the cached copy; body lives on disk at `file_path`
    FreshDisk(CachedEntry),
    /// Cluster confirmed the cached copy; body is inline
    FreshMemory(CachedEntry),
    /// Cluster holds a newer leaf object; the fresh entry was re-cached
    Refreshed(ObjectMetadata, Bytes),
    /// Cluster holds a newer chunked object; stream it, do not cache
    Chunked(ObjectMetadata),
}

/// Inline cache policy for the object handlers (internal mode).
pub struct EdgeCache {
    cache: Arc<dyn CacheStore>,
    max_content_len: u64,
}

impl EdgeCache {
    pub fn new(cache: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            cache,
            max_content_len: config.cache_max_content_len,
        }
    }

    /// Consult the cache for `key` and revalidate a hit against the cluster.
    pub async fn lookup(&self, key: &[u8], storage: &dyn StorageRpc) -> Result<CachedLookup> {
        let cached = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(CachedLookup::Miss),
            Err(e) => {
                warn!("Cache get failed for {}: {}", String::from_utf8_lossy(key), e);
                return Ok(CachedLookup::Miss);
            }
        };

        match storage.get_if_match(key, cached.etag).await? {
            GetOrMatch::Match => {
                if cached.is_on_disk() {
                    Ok(CachedLookup::FreshDisk(cached))
                } else {
                    Ok(CachedLookup::FreshMemory(cached))
                }
            }
            GetOrMatch::Modified(meta, body) => {
                if meta.is_chunked() {
                    // Large objects are never stored inline in the top-level
                    // cache; the stale entry is dropped instead.
                    if let Err(e) = self.cache.delete(key).await {
                        warn!(
                            "Cache delete failed for {}: {}",
                            String::from_utf8_lossy(key),
                            e
                        );
                    }
                    Ok(CachedLookup::Chunked(meta))
                } else {
                    self.store_small(key, &body, meta.checksum, "application/octet-stream")
                        .await;
                    Ok(CachedLookup::Refreshed(meta, body))
                }
            }
        }
    }

    /// Cache a small-object body, best-effort.
    ///
    /// Keys containing the chunk separator byte are never cached; they would
    /// collide with the chunk key namespace. Bodies above the configured
    /// bound are skipped.
    pub async fn store_small(&self, key: &[u8], body: &[u8], etag: u128, content_type: &str) {
        if contains_separator(key) {
            debug!(
                "Not caching key with separator byte: {:?}",
                String::from_utf8_lossy(key)
            );
            return;
        }
        if body.len() as u64 > self.max_content_len {
            return;
        }
        let entry = CachedEntry::inline(body.to_vec(), etag, content_type);
        if let Err(e) = self.cache.put(key, entry).await {
            warn!("Cache put failed for {}: {}", String::from_utf8_lossy(key), e);
        }
    }

    /// Drop any cached entry for `key`, best-effort.
    pub async fn invalidate(&self, key: &[u8]) {
        if let Err(e) = self.cache.delete(key).await {
            warn!(
                "Cache delete failed for {}: {}",
                String::from_utf8_lossy(key),
                e
            );
        }
    }
}

/// A short-circuit response produced by the request interceptor.
pub struct InterceptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Reverse-proxy style cache applied around the handlers (interceptor mode).
pub struct CacheInterceptor {
    cache: Arc<dyn CacheStore>,
    expire: u64,
    max_content_len: u64,
    path_patterns: Vec<Regex>,
    content_types: Vec<String>,
}

impl CacheInterceptor {
    pub fn new(cache: Arc<dyn CacheStore>, config: &CacheConfig) -> Result<Self> {
        let path_patterns = config
            .cachable_path_pattern
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    crate::GatewayError::ConfigError(format!(
                        "Invalid cachable_path_pattern '{}': {}",
                        p, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            cache,
            expire: config.cache_expire.as_secs(),
            max_content_len: config.cache_max_content_len,
            path_patterns,
            content_types: config.cachable_content_type.clone(),
        })
    }

    /// Cache headers sent with every intercepted response.
    fn cache_headers(&self, entry: &CachedEntry, now: u64) -> Vec<(String, String)> {
        vec![
            ("Last-Modified".to_string(), format_http_date(entry.mtime)),
            ("Content-Type".to_string(), entry.content_type.clone()),
            ("Age".to_string(), entry.age(now).to_string()),
            ("ETag".to_string(), crate::digest::format_etag(entry.etag)),
            (
                "Cache-Control".to_string(),
                format!("max-age={}", self.expire),
            ),
        ]
    }

    /// Request hook: serve a fresh cached entry, expire a stale one.
    ///
    /// Returns `None` to pass the request through to the handler. GET only;
    /// the caller routes other methods past the interceptor.
    pub async fn on_request(
        &self,
        key: &[u8],
        request_headers: &HashMap<String, String>,
    ) -> Option<InterceptedResponse> {
        let entry = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache get failed for {}: {}", String::from_utf8_lossy(key), e);
                return None;
            }
        };
        if entry.is_on_disk() {
            // Disk handoff entries belong to the inline mode; pass through.
            return None;
        }

        let now = unix_now();
        if entry.age(now) > self.expire {
            debug!(
                "Cache entry expired (age {}s > {}s): {}",
                entry.age(now),
                self.expire,
                String::from_utf8_lossy(key)
            );
            if let Err(e) = self.cache.delete(key).await {
                warn!(
                    "Cache delete failed for {}: {}",
                    String::from_utf8_lossy(key),
                    e
                );
            }
            return None;
        }

        let headers = self.cache_headers(&entry, now);

        if let Some(since) = request_headers
            .get("if-modified-since")
            .and_then(|v| parse_http_date(v))
        {
            if since == entry.mtime {
                return Some(InterceptedResponse {
                    status: 304,
                    headers,
                    body: Bytes::new(),
                });
            }
        }

        Some(InterceptedResponse {
            status: 200,
            headers,
            body: Bytes::from(entry.body),
        })
    }

    /// Response hook: cache a qualifying 200 GET response and rewrite its
    /// headers. Returns true when the response was cached.
    ///
    /// Cachability is the conjunction of: no `Cache-Control` on the exchange,
    /// a non-empty body under the size bound, a path-pattern match (empty
    /// list allows any), and an allowed content type (empty list allows any).
    pub async fn on_response(
        &self,
        key: &[u8],
        status: u16,
        request_headers: &HashMap<String, String>,
        response_headers: &mut Vec<(String, String)>,
        body: &Bytes,
    ) -> bool {
        if status != 200 {
            return false;
        }

        let has_cache_control = request_headers.contains_key("cache-control")
            || response_headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("cache-control"));
        if has_cache_control || body.is_empty() || body.len() as u64 >= self.max_content_len {
            return false;
        }

        if !self.path_patterns.is_empty() && !self.path_patterns.iter().any(|re| re.is_match(key)) {
            return false;
        }

        let content_type = response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        if !self.content_types.is_empty() && !self.content_types.contains(&content_type) {
            return false;
        }

        let entry = CachedEntry::inline(body.to_vec(), md5_u128(body), content_type);
        let mtime = entry.mtime;
        if let Err(e) = self.cache.put(key, entry).await {
            warn!("Cache put failed for {}: {}", String::from_utf8_lossy(key), e);
            return false;
        }

        response_headers.retain(|(k, _)| !k.eq_ignore_ascii_case("last-modified"));
        response_headers.push((
            "Cache-Control".to_string(),
            format!("max-age={}", self.expire),
        ));
        response_headers.push(("Last-Modified".to_string(), format_http_date(mtime)));
        true
    }
}

/// Render seconds since epoch as an RFC 1123 HTTP date.
pub fn format_http_date(secs: u64) -> String {
    match Utc.timestamp_opt(secs as i64, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        _ => Utc.timestamp_opt(0, 0).unwrap().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
    }
}

/// Parse an RFC 1123 HTTP date into seconds since epoch.
pub fn parse_http_date(value: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.timestamp().max(0) as u64)
}
