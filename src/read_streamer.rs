//! Read Streamer Module
//!
//! Reconstructs a chunked object from its chunk tree and writes the bytes to
//! the HTTP response in order, one chunk at a time, without buffering the
//! whole object. Children may themselves be manifests; traversal is
//! iterative with an explicit stack, emitting bytes in pre-order which is
//! exactly ascending byte order.
//!
//! A streamer is owned by the handler task of a single response.

use crate::cache_store::CacheStore;
use crate::chunk_key::chunk_key;
use crate::storage_rpc::StorageRpc;
use crate::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Destination for streamed response bytes.
///
/// A write error means the client is gone; the streamer aborts on it and
/// performs no retries.
#[async_trait]
pub trait BodySink: Send {
    async fn write(&mut self, bytes: Bytes) -> Result<()>;
}

/// Collecting sink used by tests and by callers that buffer small bodies.
#[async_trait]
impl BodySink for Vec<Bytes> {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.push(bytes);
        Ok(())
    }
}

/// Sink feeding the chunked HTTP response body through an mpsc channel.
pub struct ChannelBodySink {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelBodySink {
    pub fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl BodySink for ChannelBodySink {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.sender
            .send(bytes)
            .await
            .map_err(|_| GatewayError::HttpError("client disconnected during streamed read".into()))
    }
}

/// One level of the chunk-tree traversal.
struct Frame {
    key: Vec<u8>,
    total: u64,
    next_index: u64,
}

/// Streams chunked objects (and byte ranges of them) to a body sink.
pub struct LargeReadStreamer {
    storage: Arc<dyn StorageRpc>,
    cache: Arc<dyn CacheStore>,
}

impl LargeReadStreamer {
    pub fn new(storage: Arc<dyn StorageRpc>, cache: Arc<dyn CacheStore>) -> Self {
        Self { storage, cache }
    }

    /// Stream the whole object at `parent` with `total` direct children.
    ///
    /// Each chunk is first looked up in the cache (best-effort, inline
    /// entries only); misses fall through to the cluster. Any sink or RPC
    /// error aborts the stream with that error.
    pub async fn stream_all<W: BodySink>(
        &self,
        parent: &[u8],
        total: u64,
        writer: &mut W,
    ) -> Result<u64> {
        let mut written = 0u64;
        let mut stack = vec![Frame {
            key: parent.to_vec(),
            total,
            next_index: 1,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next_index > frame.total {
                stack.pop();
                continue;
            }
            let index = frame.next_index;
            frame.next_index += 1;
            let key = chunk_key(&frame.key, index as u32);

            // Cache errors fall through to the cluster, never to the client.
            if let Ok(Some(entry)) = self.cache.get(&key).await {
                if !entry.is_on_disk() {
                    written += entry.body.len() as u64;
                    writer.write(Bytes::from(entry.body)).await?;
                    continue;
                }
            }

            let (meta, body) = self.storage.get(&key).await?;
            if meta.cnumber == 0 {
                written += body.len() as u64;
                writer.write(body).await?;
            } else {
                stack.push(Frame {
                    key,
                    total: meta.cnumber,
                    next_index: 1,
                });
            }
        }

        debug!(
            "Streamed {} bytes of {}",
            written,
            String::from_utf8_lossy(parent)
        );
        Ok(written)
    }

    /// Stream the inclusive byte range `[start, end]` of the object at
    /// `parent`. The range must already be normalized against the object
    /// size (see [`normalize_range`]).
    ///
    /// Chunks entirely before `start` are skipped without fetching their
    /// bodies; the traversal stops as soon as the cursor passes `end`.
    pub async fn stream_range<W: BodySink>(
        &self,
        parent: &[u8],
        total: u64,
        start: u64,
        end: u64,
        writer: &mut W,
    ) -> Result<u64> {
        let mut written = 0u64;
        let mut cur_pos = 0u64;
        let mut stack = vec![Frame {
            key: parent.to_vec(),
            total,
            next_index: 1,
        }];

        'traversal: while let Some(frame) = stack.last_mut() {
            if frame.next_index > frame.total {
                stack.pop();
                continue;
            }
            let index = frame.next_index;
            frame.next_index += 1;
            let key = chunk_key(&frame.key, index as u32);

            let meta = self.storage.head(&key).await?;
            if meta.cnumber > 0 {
                stack.push(Frame {
                    key,
                    total: meta.cnumber,
                    next_index: 1,
                });
                continue;
            }

            let chunk_size = meta.dsize;
            if chunk_size == 0 {
                continue;
            }
            let chunk_end = cur_pos + chunk_size - 1;

            if chunk_end < start {
                // Entirely before the range: no body fetch.
                cur_pos += chunk_size;
                continue;
            }

            if cur_pos >= start && chunk_end <= end {
                // Fully contained: whole-chunk read.
                let (_, body) = self.storage.get(&key).await?;
                written += body.len() as u64;
                writer.write(body).await?;
            } else {
                // Partial overlap: ranged read within the chunk.
                let start_pos = start.saturating_sub(cur_pos);
                let end_pos = (chunk_size - 1).min(end - cur_pos);
                let (_, body) = self.storage.get_range(&key, start_pos, end_pos).await?;
                written += body.len() as u64;
                writer.write(body).await?;
            }

            cur_pos += chunk_size;
            if cur_pos > end {
                break 'traversal;
            }
        }

        debug!(
            "Streamed range [{}, {}] of {}: {} bytes",
            start,
            end,
            String::from_utf8_lossy(parent),
            written
        );
        Ok(written)
    }
}

/// Normalize a client-supplied byte range against the object size.
///
/// `end == 0` selects everything from `start` to the last byte; a negative
/// `end` selects a suffix of length `|end|`. The result is an inclusive
/// `[start, end]` pair in `0..object_size`. A range that starts past the
/// last byte is invalid.
pub fn normalize_range(start: i64, end: i64, object_size: u64) -> Result<(u64, u64)> {
    if object_size == 0 {
        return Err(GatewayError::InvalidRange(
            "range request on empty object".into(),
        ));
    }

    let last = object_size - 1;
    let (start, end) = if end < 0 {
        // Suffix of length |end|.
        let suffix = end.unsigned_abs().min(object_size);
        (object_size - suffix, last)
    } else if end == 0 {
        (start.max(0) as u64, last)
    } else {
        (start.max(0) as u64, (end as u64).min(last))
    };

    if start > last {
        return Err(GatewayError::InvalidRange(format!(
            "range start {} beyond object size {}",
            start, object_size
        )));
    }
    if start > end {
        return Err(GatewayError::InvalidRange(format!(
            "range start {} after end {}",
            start, end
        )));
    }

    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use crate::digest::md5_u128;
    use crate::storage_rpc::MemoryStorageRpc;

    /// Store `body` as `chunks` equal slices under `parent` with a manifest.
    async fn store_chunked(storage: &MemoryStorageRpc, parent: &[u8], body: &[u8], chunk_len: usize) -> u64 {
        let mut index = 0u32;
        for chunk in body.chunks(chunk_len) {
            index += 1;
            let key = chunk_key(parent, index);
            storage
                .put(&key, Bytes::copy_from_slice(chunk), chunk.len() as u64, index)
                .await
                .unwrap();
        }
        storage
            .put_manifest(
                parent,
                body.len() as u64,
                chunk_len as u64,
                index as u64,
                md5_u128(body),
            )
            .await
            .unwrap();
        index as u64
    }

    fn streamer(
        storage: &Arc<MemoryStorageRpc>,
        cache: &Arc<MemoryCacheStore>,
    ) -> LargeReadStreamer {
        LargeReadStreamer::new(
            Arc::clone(storage) as Arc<dyn StorageRpc>,
            Arc::clone(cache) as Arc<dyn CacheStore>,
        )
    }

    fn collect(parts: &[Bytes]) -> Vec<u8> {
        parts.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[tokio::test]
    async fn test_stream_all_reassembles_body() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let body: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let total = store_chunked(&storage, b"obj", &body, 300).await;

        let mut sink: Vec<Bytes> = Vec::new();
        let written = streamer(&storage, &cache)
            .stream_all(b"obj", total, &mut sink)
            .await
            .unwrap();

        assert_eq!(written, 1000);
        assert_eq!(collect(&sink), body);
    }

    #[tokio::test]
    async fn test_stream_all_reads_nested_manifests() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());

        // Child 1 is itself chunked (grand-children), child 2 is a leaf.
        let inner_key = chunk_key(b"nested", 1);
        let inner_body = b"grand-child-bytes".to_vec();
        let inner_total = store_chunked(&storage, &inner_key, &inner_body, 5).await;
        assert!(inner_total > 1);

        let leaf_key = chunk_key(b"nested", 2);
        storage
            .put(&leaf_key, Bytes::from_static(b"+leaf"), 5, 2)
            .await
            .unwrap();

        let full: Vec<u8> = [inner_body.as_slice(), b"+leaf"].concat();
        storage
            .put_manifest(b"nested", full.len() as u64, 5, 2, md5_u128(&full))
            .await
            .unwrap();

        let mut sink: Vec<Bytes> = Vec::new();
        streamer(&storage, &cache)
            .stream_all(b"nested", 2, &mut sink)
            .await
            .unwrap();
        assert_eq!(collect(&sink), full);
    }

    #[tokio::test]
    async fn test_stream_all_prefers_cached_chunks() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let body = b"0123456789".to_vec();
        let total = store_chunked(&storage, b"obj", &body, 5).await;

        // Poison the cache for chunk 1; the stream must serve the cached copy.
        let key = chunk_key(b"obj", 1);
        let entry = crate::cache_store::CachedEntry::inline(b"XXXXX".to_vec(), 1, "application/octet-stream");
        cache.put(&key, entry).await.unwrap();

        let mut sink: Vec<Bytes> = Vec::new();
        streamer(&storage, &cache)
            .stream_all(b"obj", total, &mut sink)
            .await
            .unwrap();
        assert_eq!(collect(&sink), b"XXXXX56789");
    }

    #[tokio::test]
    async fn test_stream_range_slices_match_full_body() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let body: Vec<u8> = (0..100u8).collect();
        let total = store_chunked(&storage, b"obj", &body, 7).await;
        let s = streamer(&storage, &cache);

        for (start, end) in [(0u64, 99u64), (0, 6), (7, 13), (3, 41), (95, 99), (50, 50)] {
            let mut sink: Vec<Bytes> = Vec::new();
            s.stream_range(b"obj", total, start, end, &mut sink)
                .await
                .unwrap();
            assert_eq!(
                collect(&sink),
                body[start as usize..=end as usize].to_vec(),
                "range [{}, {}]",
                start,
                end
            );
        }
    }

    #[tokio::test]
    async fn test_stream_range_skips_leading_chunks() {
        let storage = Arc::new(MemoryStorageRpc::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let body = vec![0x41u8; 100];
        let total = store_chunked(&storage, b"obj", &body, 10).await;

        // A range inside chunk 9 must not fetch bodies of chunks 1..8; the
        // cheap proxy for that here is that the emitted bytes are exact.
        let mut sink: Vec<Bytes> = Vec::new();
        let written = streamer(&storage, &cache)
            .stream_range(b"obj", total, 85, 87, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(collect(&sink), vec![0x41u8; 3]);
    }

    #[test]
    fn test_normalize_range() {
        // end == 0 means "through the last byte".
        assert_eq!(normalize_range(10, 0, 100).unwrap(), (10, 99));
        // Negative end selects a suffix.
        assert_eq!(normalize_range(0, -20, 100).unwrap(), (80, 99));
        // Explicit end is clamped to the object.
        assert_eq!(normalize_range(5, 500, 100).unwrap(), (5, 99));
        assert_eq!(normalize_range(5, 50, 100).unwrap(), (5, 50));
        // Suffix longer than the object selects all of it.
        assert_eq!(normalize_range(0, -500, 100).unwrap(), (0, 99));

        assert!(normalize_range(100, 0, 100).is_err());
        assert!(normalize_range(60, 40, 100).is_err());
        assert!(normalize_range(0, 0, 0).is_err());
    }
}
