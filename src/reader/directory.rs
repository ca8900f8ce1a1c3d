//! Directory facade: wires the blob container, header cache and shared
//! cache together and opens per-file readers.

use crate::blob::BlobContainer;
use crate::cache::{HeaderCache, SharedCache};
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::reader::cached::CachedFileReader;
use crate::reader::IoContext;
use crate::snapshot::FileInfo;
use crate::stats::ReadStats;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheap-clone handle; clones share the collaborators and stats registry.
#[derive(Clone)]
pub struct SnapshotDirectory {
    inner: Arc<DirectoryState>,
}

struct DirectoryState {
    container: Arc<dyn BlobContainer>,
    headers: Arc<dyn HeaderCache>,
    cache: Arc<SharedCache>,
    config: CacheConfig,
    recovery_done: AtomicBool,
    // one stats sink per physical file, shared by all readers of that file
    stats: DashMap<String, Arc<ReadStats>>,
}

impl SnapshotDirectory {
    pub fn new(
        container: Arc<dyn BlobContainer>,
        headers: Arc<dyn HeaderCache>,
        cache: Arc<SharedCache>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DirectoryState {
                container,
                headers,
                cache,
                config,
                recovery_done: AtomicBool::new(false),
                stats: DashMap::new(),
            }),
        })
    }

    /// Open a reader over `info` positioned at zero. Counts one open; clones
    /// and slices of the returned reader do not.
    pub fn open(&self, info: FileInfo, context: IoContext) -> CachedFileReader {
        let stats = self.stats_for(info.name());
        stats.increment_open();
        CachedFileReader::new(self.clone(), Arc::new(info), context, stats)
    }

    /// Stats sink for a physical file name, created on first use.
    pub fn stats_for(&self, name: &str) -> Arc<ReadStats> {
        self.inner
            .stats
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ReadStats::default()))
            .clone()
    }

    /// Whether recovery of the snapshot has completed; until then, reads use
    /// the smaller recovery range size to avoid over-fetching.
    pub fn is_recovery_done(&self) -> bool {
        self.inner.recovery_done.load(Ordering::Acquire)
    }

    pub fn set_recovery_done(&self, done: bool) {
        self.inner.recovery_done.store(done, Ordering::Release);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub(crate) fn blob_container(&self) -> &Arc<dyn BlobContainer> {
        &self.inner.container
    }

    pub(crate) fn header_cache(&self) -> &Arc<dyn HeaderCache> {
        &self.inner.headers
    }

    pub(crate) fn shared_cache(&self) -> &Arc<SharedCache> {
        &self.inner.cache
    }
}
