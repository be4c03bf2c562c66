//! Cache Store Module
//!
//! The raw edge-cache backend: get/put/delete of serialized entries over
//! opaque byte keys. The store enforces no TTL of its own; freshness is
//! judged by the edge cache layer using the entry's `mtime`. Every caller
//! treats store errors as best-effort and never fails the user request on
//! them.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, the clock all cache freshness math uses.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A cached response record.
///
/// When `file_path` is non-empty the body lives on disk and responses are
/// served from that file using `size`; otherwise the body is inline and
/// `size == body.len()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEntry {
    /// Seconds since epoch at which the entry was written
    pub mtime: u64,
    /// Content digest of the stored object
    pub etag: u128,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Body length in bytes; authoritative when the body is on disk
    pub size: u64,
    /// Non-empty means the body lives on disk at this path
    pub file_path: String,
}

impl CachedEntry {
    /// Create an inline entry stamped with the current time.
    pub fn inline(body: Vec<u8>, etag: u128, content_type: impl Into<String>) -> Self {
        let size = body.len() as u64;
        Self {
            mtime: unix_now(),
            etag,
            content_type: content_type.into(),
            body,
            size,
            file_path: String::new(),
        }
    }

    /// True when the body is held on disk rather than inline.
    pub fn is_on_disk(&self) -> bool {
        !self.file_path.is_empty()
    }

    /// Age of the entry in seconds relative to `now`.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.mtime)
    }

    /// True when the entry is within `expire` seconds of its write time.
    pub fn is_fresh(&self, now: u64, expire: u64) -> bool {
        self.age(now) <= expire
    }
}

/// Edge cache backend contract.
///
/// No ordering guarantees between operations; the backend provides its own
/// internal synchronization.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<CachedEntry>>;

    async fn put(&self, key: &[u8], entry: CachedEntry) -> Result<()>;

    async fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Process-wide in-memory cache store.
pub struct MemoryCacheStore {
    entries: DashMap<Vec<u8>, CachedEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &[u8]) -> Result<Option<CachedEntry>> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn put(&self, key: &[u8], entry: CachedEntry) -> Result<()> {
        self.entries.insert(key.to_vec(), entry);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
