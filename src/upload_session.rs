//! Upload Session Module
//!
//! Per-object coordinator for streaming PUTs above the large-object
//! threshold. The session stores each chunk under its derived chunk key,
//! advances a rolling MD5 over the chunk bodies in strict index order, and
//! either yields the final digest at commit or deletes every written chunk
//! on rollback.
//!
//! A session is owned by the handler task of a single HTTP upload and is
//! never shared.

use crate::cache_store::{CacheStore, CachedEntry};
use crate::chunk_key::chunk_key;
use crate::digest::RollingDigest;
use crate::storage_rpc::StorageRpc;
use crate::{GatewayError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Content type recorded for cached chunk bodies.
const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";

/// Streaming upload coordinator for one large object.
pub struct LargeUploadSession {
    parent_key: Vec<u8>,
    digest: RollingDigest,
    errors: Vec<(u32, GatewayError)>,
    storage: Arc<dyn StorageRpc>,
    cache: Arc<dyn CacheStore>,
}

impl LargeUploadSession {
    /// Open a session for the object at `parent_key`.
    pub fn open(
        parent_key: impl Into<Vec<u8>>,
        storage: Arc<dyn StorageRpc>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            parent_key: parent_key.into(),
            digest: RollingDigest::new(),
            errors: Vec::new(),
            storage,
            cache,
        }
    }

    /// The object key this session writes under.
    pub fn parent_key(&self) -> &[u8] {
        &self.parent_key
    }

    /// Store chunk `index` (1-based) and advance the rolling digest.
    ///
    /// The digest advances only when the storage put succeeds; a failed
    /// chunk leaves the digest untouched so that the final value stays equal
    /// to the MD5 of the committed bytes. Failures are recorded in the
    /// session and also returned to the caller.
    pub async fn put_chunk(&mut self, index: u32, bytes: Bytes) -> Result<()> {
        let key = chunk_key(&self.parent_key, index);
        let size = bytes.len() as u64;

        match self.storage.put(&key, bytes.clone(), size, index).await {
            Ok(_) => {
                self.digest.update(&bytes);
                debug!(
                    "Stored chunk {} of {} ({} bytes)",
                    index,
                    String::from_utf8_lossy(&self.parent_key),
                    size
                );

                // Best-effort: a failed cache write never fails the upload.
                // The entry carries the digest state over the bytes committed
                // so far.
                let rolling_etag = self.digest.clone().finalize_u128();
                let entry = CachedEntry::inline(bytes.to_vec(), rolling_etag, CHUNK_CONTENT_TYPE);
                if let Err(e) = self.cache.put(&key, entry).await {
                    warn!("Cache put failed for chunk {}: {}", index, e);
                }
                Ok(())
            }
            Err(cause) => {
                warn!(
                    "Chunk {} put failed for {}: {}",
                    index,
                    String::from_utf8_lossy(&self.parent_key),
                    cause
                );
                self.errors.push((index, cause.clone()));
                Err(cause)
            }
        }
    }

    /// Finish the upload: the assembled digest when every chunk landed, the
    /// accumulated failures otherwise. Writing the manifest is the
    /// dispatcher's job.
    pub fn commit(&self) -> std::result::Result<u128, Vec<(u32, GatewayError)>> {
        if self.errors.is_empty() {
            Ok(self.digest.clone().finalize_u128())
        } else {
            Err(self.errors.clone())
        }
    }

    /// Delete chunks `total_chunks` down to `1` from both the cache and the
    /// cluster. Best-effort: individual delete failures are logged and the
    /// iteration continues. Clears the recorded chunk errors.
    pub async fn rollback(&mut self, total_chunks: u32) {
        for index in (1..=total_chunks).rev() {
            let key = chunk_key(&self.parent_key, index);

            if let Err(e) = self.cache.delete(&key).await {
                warn!("Cache delete failed during rollback of chunk {}: {}", index, e);
            }

            match self.storage.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        "Storage delete failed during rollback of chunk {}: {}",
                        index, e
                    );
                }
            }
        }

        debug!(
            "Rolled back {} chunks of {}",
            total_chunks,
            String::from_utf8_lossy(&self.parent_key)
        );
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use crate::digest::md5_u128;
    use crate::storage_rpc::MemoryStorageRpc;

    fn session(
        storage: &Arc<MemoryStorageRpc>,
        cache: &Arc<MemoryCacheStore>,
    ) -> LargeUploadSession {
        LargeUploadSession::open(
            b"docs/report".to_vec(),
            Arc::clone(storage) as Arc<dyn StorageRpc>,
            Arc::clone(cache) as Arc<dyn CacheStore>,
        )
    }

    #[tokio::test]
    async fn test_commit_digest_matches_concatenation() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let mut session = session(&storage, &cache);

        let chunks: [&[u8]; 3] = [b"first-", b"second-", b"third"];
        for (i, chunk) in chunks.iter().enumerate() {
            session
                .put_chunk(i as u32 + 1, Bytes::copy_from_slice(chunk))
                .await
                .unwrap();
        }

        let digest = session.commit().expect("no chunk failed");
        assert_eq!(digest, md5_u128(&chunks.concat()));
    }

    #[tokio::test]
    async fn test_failed_chunk_leaves_digest_untouched() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        storage.fail_puts_for_index(2);

        let mut session = session(&storage, &cache);
        session
            .put_chunk(1, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        assert!(session
            .put_chunk(2, Bytes::from_static(b"bbbb"))
            .await
            .is_err());

        // Commit reports the failure rather than a digest.
        let errors = session.commit().expect_err("chunk 2 failed");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 2);
    }

    #[tokio::test]
    async fn test_put_chunk_populates_cache() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let mut session = session(&storage, &cache);

        session
            .put_chunk(1, Bytes::from_static(b"cached-bytes"))
            .await
            .unwrap();

        let key = chunk_key(b"docs/report", 1);
        let entry = cache.get(&key).await.unwrap().expect("chunk should be cached");
        assert_eq!(entry.body, b"cached-bytes");
        assert_eq!(entry.content_type, CHUNK_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_rollback_removes_all_chunks() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let mut session = session(&storage, &cache);

        for i in 1..=4u32 {
            session
                .put_chunk(i, Bytes::from_static(b"chunk"))
                .await
                .unwrap();
        }
        assert_eq!(storage.object_count(), 4);

        session.rollback(4).await;

        assert_eq!(storage.object_count(), 0);
        for i in 1..=4u32 {
            let key = chunk_key(b"docs/report", i);
            assert!(storage.head(&key).await.unwrap_err().is_not_found());
            assert!(cache.get(&key).await.unwrap().is_none());
        }
        assert!(session.commit().is_ok(), "rollback clears recorded errors");
    }

    #[tokio::test]
    async fn test_rollback_survives_missing_chunks() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let mut session = session(&storage, &cache);

        session
            .put_chunk(1, Bytes::from_static(b"only"))
            .await
            .unwrap();

        // Rolling back more chunks than were written must not error out.
        session.rollback(5).await;
        let key = chunk_key(b"docs/report", 1);
        assert!(storage.head(&key).await.unwrap_err().is_not_found());
    }
}
