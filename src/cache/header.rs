//! Key-value cache for the first bytes of each file ("header cache").
//!
//! Small files and file headers are kept in a shared KV store so that a
//! freshly mounted snapshot can serve its first reads without waiting on the
//! blob store. The core only ever queries prefixes starting at zero.

use crate::error::CacheResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// One cached blob covering `[from, to)` of a file.
#[derive(Debug, Clone)]
pub struct CachedHeader {
    pub from: u64,
    pub to: u64,
    pub bytes: Bytes,
}

impl CachedHeader {
    pub fn new(from: u64, bytes: Bytes) -> Self {
        let to = from + bytes.len() as u64;
        Self { from, to, bytes }
    }

    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    /// True when `[position, position + length)` falls inside this blob.
    pub fn covers(&self, position: u64, length: u64) -> bool {
        self.from <= position && position + length <= self.to
    }
}

/// Outcome of a header cache lookup. `NotReady` serves like a miss but
/// signals that the cache index does not exist yet; it is only created on
/// the first put, so a fill must still be triggered.
#[derive(Debug, Clone)]
pub enum HeaderLookup {
    Hit(CachedHeader),
    Miss,
    NotReady,
}

/// Contract of the header KV cache consumed by the readers.
#[async_trait]
pub trait HeaderCache: Send + Sync {
    /// Look up a blob covering `[from, from + length)` of `name`.
    async fn lookup(&self, name: &str, from: u64, length: u64) -> HeaderLookup;

    /// Store a blob for `name` starting at `from`. Fire-and-forget from the
    /// reader's point of view; callers report fill durations themselves.
    async fn put(&self, name: &str, from: u64, bytes: Bytes) -> CacheResult<()>;
}

/// In-memory header cache on a bounded concurrent store.
pub struct MemoryHeaderCache {
    entries: moka::future::Cache<String, CachedHeader>,
    ready: AtomicBool,
}

impl MemoryHeaderCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: moka::future::Cache::builder()
                .weigher(|key: &String, header: &CachedHeader| {
                    (key.len() + header.bytes.len()) as u32
                })
                .max_capacity(max_capacity)
                .build(),
            ready: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryHeaderCache {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

#[async_trait]
impl HeaderCache for MemoryHeaderCache {
    async fn lookup(&self, name: &str, from: u64, length: u64) -> HeaderLookup {
        if !self.ready.load(Ordering::Acquire) {
            trace!(file = name, "header cache not ready");
            return HeaderLookup::NotReady;
        }
        match self.entries.get(name).await {
            Some(header) if header.covers(from, length) => {
                trace!(file = name, from, length, "header cache hit");
                HeaderLookup::Hit(header)
            }
            Some(_) => {
                trace!(file = name, from, length, "header cache entry too short");
                HeaderLookup::Miss
            }
            None => {
                trace!(file = name, "header cache miss");
                HeaderLookup::Miss
            }
        }
    }

    async fn put(&self, name: &str, from: u64, bytes: Bytes) -> CacheResult<()> {
        debug!(file = name, from, len = bytes.len(), "storing header cache blob");
        self.entries
            .insert(name.to_string(), CachedHeader::new(from, bytes))
            .await;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_ready_until_first_put() {
        let cache = MemoryHeaderCache::default();
        assert!(matches!(
            cache.lookup("_0.cfs", 0, 16).await,
            HeaderLookup::NotReady
        ));

        cache
            .put("_1.doc", 0, Bytes::from_static(b"0123456789abcdef"))
            .await
            .unwrap();

        // index now exists: other files miss instead of NotReady
        assert!(matches!(
            cache.lookup("_0.cfs", 0, 16).await,
            HeaderLookup::Miss
        ));
    }

    #[tokio::test]
    async fn test_hit_requires_coverage() {
        let cache = MemoryHeaderCache::default();
        cache
            .put("_0.cfs", 0, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        match cache.lookup("_0.cfs", 0, 4).await {
            HeaderLookup::Hit(header) => {
                assert_eq!(header.from, 0);
                assert_eq!(header.to, 10);
                assert!(header.covers(2, 8));
                assert!(!header.covers(2, 9));
            }
            other => panic!("expected hit, got {other:?}"),
        }

        assert!(matches!(
            cache.lookup("_0.cfs", 0, 11).await,
            HeaderLookup::Miss
        ));
    }
}
