//! Storage RPC Module
//!
//! The request/response interface to the storage cluster. Every object
//! operation the gateway performs goes through the `StorageRpc` trait; the
//! cluster client proper is an external collaborator, and this module ships
//! an in-memory implementation used by tests and by the standalone wiring.
//!
//! All calls are bounded by a timeout (default 30 s) via `TimeoutStorageRpc`;
//! on expiry the operation surfaces `GatewayError::Timeout`, which the
//! dispatcher maps to 504.

use crate::digest::md5_u128;
use crate::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;

/// Metadata record for an object stored on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    /// Content digest of the assembled object
    pub checksum: u128,
    /// Seconds since epoch of the last write
    pub timestamp: u64,
    /// Logical byte size of the assembled object
    pub dsize: u64,
    /// Number of direct children; 0 means leaf
    pub cnumber: u64,
    /// Tombstone flag; false means live
    pub del: bool,
}

impl ObjectMetadata {
    /// True when the object is a manifest over child chunks.
    pub fn is_chunked(&self) -> bool {
        self.cnumber > 0
    }
}

/// Outcome of a conditional get against a cached checksum.
#[derive(Debug, Clone)]
pub enum GetOrMatch {
    /// The caller's cached copy is still valid
    Match,
    /// Storage holds a newer version
    Modified(ObjectMetadata, Bytes),
}

/// Remote object store contract.
#[async_trait]
pub trait StorageRpc: Send + Sync {
    /// Fetch an object and its metadata.
    async fn get(&self, key: &[u8]) -> Result<(ObjectMetadata, Bytes)>;

    /// Fetch only if the object differs from the caller's cached checksum.
    async fn get_if_match(&self, key: &[u8], etag_hint: u128) -> Result<GetOrMatch>;

    /// Fetch an inclusive byte range of a leaf object. May return an empty
    /// body when the range lies outside the object.
    async fn get_range(&self, key: &[u8], start: u64, end: u64) -> Result<(ObjectMetadata, Bytes)>;

    /// Fetch metadata only.
    async fn head(&self, key: &[u8]) -> Result<ObjectMetadata>;

    /// Store a leaf object; `chunk_index` 0 means small object. Returns the
    /// stored object's checksum.
    async fn put(&self, key: &[u8], body: Bytes, size: u64, chunk_index: u32) -> Result<u128>;

    /// Store the header record of a chunked object: an empty body whose
    /// metadata references `total_chunks` children and carries the assembled
    /// digest. The chunk size travels in the slot the leaf contract uses for
    /// the chunk index.
    async fn put_manifest(
        &self,
        key: &[u8],
        total_size: u64,
        chunk_size: u64,
        total_chunks: u64,
        digest: u128,
    ) -> Result<u128>;

    /// Delete an object. Missing keys surface `GatewayError::NotFound`.
    async fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Decorator bounding every RPC with a timeout.
pub struct TimeoutStorageRpc {
    inner: Arc<dyn StorageRpc>,
    timeout: Duration,
}

impl TimeoutStorageRpc {
    pub fn new(inner: Arc<dyn StorageRpc>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        key: &[u8],
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "storage RPC exceeded {}s for key {}",
                self.timeout.as_secs(),
                String::from_utf8_lossy(key)
            ))),
        }
    }
}

#[async_trait]
impl StorageRpc for TimeoutStorageRpc {
    async fn get(&self, key: &[u8]) -> Result<(ObjectMetadata, Bytes)> {
        self.bounded(key, self.inner.get(key)).await
    }

    async fn get_if_match(&self, key: &[u8], etag_hint: u128) -> Result<GetOrMatch> {
        self.bounded(key, self.inner.get_if_match(key, etag_hint))
            .await
    }

    async fn get_range(&self, key: &[u8], start: u64, end: u64) -> Result<(ObjectMetadata, Bytes)> {
        self.bounded(key, self.inner.get_range(key, start, end))
            .await
    }

    async fn head(&self, key: &[u8]) -> Result<ObjectMetadata> {
        self.bounded(key, self.inner.head(key)).await
    }

    async fn put(&self, key: &[u8], body: Bytes, size: u64, chunk_index: u32) -> Result<u128> {
        self.bounded(key, self.inner.put(key, body, size, chunk_index))
            .await
    }

    async fn put_manifest(
        &self,
        key: &[u8],
        total_size: u64,
        chunk_size: u64,
        total_chunks: u64,
        digest: u128,
    ) -> Result<u128> {
        self.bounded(
            key,
            self.inner
                .put_manifest(key, total_size, chunk_size, total_chunks, digest),
        )
        .await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.bounded(key, self.inner.delete(key)).await
    }
}

/// One stored record in the in-memory cluster.
#[derive(Debug, Clone)]
struct StoredObject {
    meta: ObjectMetadata,
    body: Bytes,
}

/// In-memory implementation of the cluster interface.
///
/// Backs the test suite and the standalone wiring. Supports fault injection:
/// puts can be failed per chunk index and any key can be made to hang past
/// the RPC timeout.
pub struct MemoryStorageRpc {
    objects: DashMap<Vec<u8>, StoredObject>,
    /// Chunk indices whose put fails with an internal error
    fail_put_indices: DashSet<u32>,
    /// Keys whose operations stall (paired with `TimeoutStorageRpc` in tests)
    stall_keys: DashSet<Vec<u8>>,
}

impl MemoryStorageRpc {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            fail_put_indices: DashSet::new(),
            stall_keys: DashSet::new(),
        }
    }

    /// Make every put with this chunk index fail with an internal error.
    pub fn fail_puts_for_index(&self, chunk_index: u32) {
        self.fail_put_indices.insert(chunk_index);
    }

    /// Make every operation on this key stall for ten minutes.
    pub fn stall_key(&self, key: &[u8]) {
        self.stall_keys.insert(key.to_vec());
    }

    /// Number of live objects held.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    async fn maybe_stall(&self, key: &[u8]) {
        if self.stall_keys.contains(key) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<StoredObject> {
        match self.objects.get(key) {
            Some(obj) if !obj.meta.del => Ok(obj.clone()),
            _ => Err(GatewayError::NotFound(
                String::from_utf8_lossy(key).into_owned(),
            )),
        }
    }
}

impl Default for MemoryStorageRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageRpc for MemoryStorageRpc {
    async fn get(&self, key: &[u8]) -> Result<(ObjectMetadata, Bytes)> {
        self.maybe_stall(key).await;
        let obj = self.lookup(key)?;
        Ok((obj.meta, obj.body))
    }

    async fn get_if_match(&self, key: &[u8], etag_hint: u128) -> Result<GetOrMatch> {
        self.maybe_stall(key).await;
        let obj = self.lookup(key)?;
        if obj.meta.checksum == etag_hint {
            Ok(GetOrMatch::Match)
        } else {
            Ok(GetOrMatch::Modified(obj.meta, obj.body))
        }
    }

    async fn get_range(&self, key: &[u8], start: u64, end: u64) -> Result<(ObjectMetadata, Bytes)> {
        self.maybe_stall(key).await;
        let obj = self.lookup(key)?;
        let len = obj.body.len() as u64;
        if start >= len {
            return Ok((obj.meta, Bytes::new()));
        }
        let end = end.min(len.saturating_sub(1));
        let body = obj.body.slice(start as usize..=end as usize);
        Ok((obj.meta, body))
    }

    async fn head(&self, key: &[u8]) -> Result<ObjectMetadata> {
        self.maybe_stall(key).await;
        Ok(self.lookup(key)?.meta)
    }

    async fn put(&self, key: &[u8], body: Bytes, size: u64, chunk_index: u32) -> Result<u128> {
        self.maybe_stall(key).await;
        if self.fail_put_indices.contains(&chunk_index) {
            return Err(GatewayError::InternalError(format!(
                "injected put failure for chunk index {}",
                chunk_index
            )));
        }
        let checksum = md5_u128(&body);
        let meta = ObjectMetadata {
            checksum,
            timestamp: crate::cache_store::unix_now(),
            dsize: size,
            cnumber: 0,
            del: false,
        };
        self.objects.insert(key.to_vec(), StoredObject { meta, body });
        Ok(checksum)
    }

    async fn put_manifest(
        &self,
        key: &[u8],
        total_size: u64,
        _chunk_size: u64,
        total_chunks: u64,
        digest: u128,
    ) -> Result<u128> {
        self.maybe_stall(key).await;
        let meta = ObjectMetadata {
            checksum: digest,
            timestamp: crate::cache_store::unix_now(),
            dsize: total_size,
            cnumber: total_chunks,
            del: false,
        };
        self.objects.insert(
            key.to_vec(),
            StoredObject {
                meta,
                body: Bytes::new(),
            },
        );
        Ok(digest)
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.maybe_stall(key).await;
        match self.objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(
                String::from_utf8_lossy(key).into_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let storage = MemoryStorageRpc::new();
        let etag = storage
            .put(b"k", Bytes::from_static(b"body"), 4, 0)
            .await
            .unwrap();
        assert_eq!(etag, md5_u128(b"body"));

        let (meta, body) = storage.get(b"k").await.unwrap();
        assert_eq!(body, Bytes::from_static(b"body"));
        assert_eq!(meta.dsize, 4);
        assert_eq!(meta.cnumber, 0);
        assert!(!meta.is_chunked());

        storage.delete(b"k").await.unwrap();
        assert!(storage.head(b"k").await.unwrap_err().is_not_found());
        assert!(storage.delete(b"k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_if_match() {
        let storage = MemoryStorageRpc::new();
        let etag = storage
            .put(b"k", Bytes::from_static(b"v1"), 2, 0)
            .await
            .unwrap();

        match storage.get_if_match(b"k", etag).await.unwrap() {
            GetOrMatch::Match => {}
            GetOrMatch::Modified(..) => panic!("checksum matched, expected Match"),
        }

        storage
            .put(b"k", Bytes::from_static(b"v2"), 2, 0)
            .await
            .unwrap();
        match storage.get_if_match(b"k", etag).await.unwrap() {
            GetOrMatch::Modified(_, body) => assert_eq!(body, Bytes::from_static(b"v2")),
            GetOrMatch::Match => panic!("object changed, expected Modified"),
        }
    }

    #[tokio::test]
    async fn test_get_range_clamps_and_empties() {
        let storage = MemoryStorageRpc::new();
        storage
            .put(b"k", Bytes::from_static(b"0123456789"), 10, 0)
            .await
            .unwrap();

        let (_, body) = storage.get_range(b"k", 2, 5).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"2345"));

        let (_, body) = storage.get_range(b"k", 8, 100).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"89"));

        let (_, body) = storage.get_range(b"k", 50, 60).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_metadata() {
        let storage = MemoryStorageRpc::new();
        let etag = storage.put_manifest(b"m", 100, 20, 5, 0xabcd).await.unwrap();
        assert_eq!(etag, 0xabcd);

        let meta = storage.head(b"m").await.unwrap();
        assert_eq!(meta.cnumber, 5);
        assert_eq!(meta.dsize, 100);
        assert!(meta.is_chunked());

        let (_, body) = storage.get(b"m").await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let storage = MemoryStorageRpc::new();
        storage.fail_puts_for_index(3);
        assert!(storage
            .put(b"k", Bytes::from_static(b"x"), 1, 3)
            .await
            .is_err());
        // Other indices are unaffected.
        assert!(storage
            .put(b"k", Bytes::from_static(b"x"), 1, 2)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_wrapper_surfaces_timeout() {
        let storage = Arc::new(MemoryStorageRpc::new());
        storage
            .put(b"slow", Bytes::from_static(b"x"), 1, 0)
            .await
            .unwrap();
        storage.stall_key(b"slow");

        let timed = TimeoutStorageRpc::new(storage, Duration::from_millis(20));
        match timed.get(b"slow").await {
            Err(GatewayError::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }
}
