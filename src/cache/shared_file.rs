//! Shared cache regions: sparse on-disk files with interval-tracked
//! population.
//!
//! Each logical snapshot file maps to one sparse cache file of the same
//! length. A [`SharedCacheFile`] handle is cheap to clone; eviction is a
//! one-way transition observed by every holder as a typed error. Admission
//! and eviction *policy* live outside this crate — the registry only
//! allocates regions and offers an explicit eviction hook.

use crate::cache::coordinator::{
    as_cache_fetch_task, CacheChannel, CacheCoordinator, FetchPermit, ProgressUpdater,
    RangeWriter, ReadSink, COPY_BUFFER_SIZE,
};
use crate::error::{CacheError, CacheResult};
use crate::snapshot::{ByteRange, RangeSet};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Handle to one region of the shared cache. Clones share the same state.
#[derive(Clone)]
pub struct SharedCacheFile {
    inner: Arc<FileState>,
}

struct FileState {
    name: String,
    len: u64,
    channel: CacheChannel,
    fill: Mutex<FillState>,
    // bumped on every population/eviction change to wake waiters
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct FillState {
    populated: RangeSet,
    in_flight: Vec<InFlightFill>,
    evicted: bool,
}

struct InFlightFill {
    range: ByteRange,
    progress: u64,
    failed: Option<Arc<CacheError>>,
}

fn overlaps(a: ByteRange, b: ByteRange) -> bool {
    a.start < b.end && b.start < a.end
}

impl FillState {
    /// Length of the readable prefix of `range`: populated bytes plus the
    /// progressed prefixes of active fills.
    fn available_prefix(&self, range: ByteRange) -> u64 {
        let mut pos = range.start;
        'extend: while pos < range.end {
            if let Some(end) = self.populated.extent_at(pos) {
                pos = end.min(range.end);
                continue;
            }
            for fill in &self.in_flight {
                if fill.failed.is_none()
                    && fill.range.start <= pos
                    && pos < fill.range.start + fill.progress
                {
                    pos = (fill.range.start + fill.progress).min(range.end);
                    continue 'extend;
                }
            }
            break;
        }
        pos - range.start
    }

    /// A failed fill overlapping the not-yet-readable remainder of `range`.
    fn blocking_error(&self, range: ByteRange, available: u64) -> Option<Arc<CacheError>> {
        let rest = ByteRange::new(range.start + available, range.end);
        self.in_flight
            .iter()
            .find(|fill| fill.failed.is_some() && overlaps(fill.range, rest))
            .and_then(|fill| fill.failed.clone())
    }

    /// True when the remainder of `range` past `available` is fully covered
    /// by populated bytes and active claims, i.e. somebody will finish it.
    fn remainder_claimed(&self, range: ByteRange, available: u64) -> bool {
        let rest = ByteRange::new(range.start + available, range.end);
        if rest.is_empty() {
            return true;
        }
        let mut coverage = self.populated.clone();
        for fill in self.in_flight.iter().filter(|f| f.failed.is_none()) {
            coverage.insert(fill.range);
        }
        coverage.gaps(rest).is_empty()
    }
}

impl FileState {
    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl SharedCacheFile {
    /// Create a region backed by a fresh sparse file of `len` bytes.
    pub fn create(name: impl Into<String>, len: u64, path: &Path) -> CacheResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        let (version, _) = watch::channel(0u64);
        Ok(Self {
            inner: Arc::new(FileState {
                name: name.into(),
                len,
                channel: CacheChannel::new(Arc::new(file)),
                fill: Mutex::new(FillState::default()),
                version,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.fill.lock().unwrap().evicted
    }

    /// One-way transition; in-flight operations observe a typed error.
    pub fn evict(&self) {
        {
            let mut state = self.inner.fill.lock().unwrap();
            if state.evicted {
                return;
            }
            state.evicted = true;
        }
        self.inner.channel.mark_evicted();
        self.inner.bump();
        debug!(file = %self.inner.name, "evicted shared cache file");
    }

    fn check_ranges(&self, write_range: ByteRange, read_range: ByteRange) -> CacheResult<()> {
        if write_range.start > read_range.start
            || read_range.end > write_range.end
            || write_range.end > self.inner.len
        {
            return Err(CacheError::InvalidArgument(format!(
                "write range {write_range} must contain read range {read_range} within [0-{})",
                self.inner.len
            )));
        }
        Ok(())
    }

    /// Claim the unpopulated, unclaimed gaps of `write_range`. Failed claims
    /// overlapping the range are released for retry first.
    fn claim_gaps(&self, write_range: ByteRange) -> CacheResult<Vec<ByteRange>> {
        let mut state = self.inner.fill.lock().unwrap();
        if state.evicted {
            return Err(CacheError::Evicted);
        }
        state
            .in_flight
            .retain(|fill| fill.failed.is_none() || !overlaps(fill.range, write_range));
        let mut coverage = state.populated.clone();
        for fill in &state.in_flight {
            coverage.insert(fill.range);
        }
        let gaps = coverage.gaps(write_range);
        for gap in &gaps {
            state.in_flight.push(InFlightFill {
                range: *gap,
                progress: 0,
                failed: None,
            });
        }
        Ok(gaps)
    }

    fn progress_updater(&self, gap: ByteRange) -> ProgressUpdater {
        let inner = Arc::clone(&self.inner);
        ProgressUpdater::new(move |bytes_written| {
            {
                let mut state = inner.fill.lock().unwrap();
                if let Some(fill) = state.in_flight.iter_mut().find(|f| f.range == gap) {
                    fill.progress = fill.progress.max(bytes_written.min(gap.len()));
                }
            }
            inner.bump();
        })
    }

    fn complete_gap(&self, gap: ByteRange) {
        {
            let mut state = self.inner.fill.lock().unwrap();
            state.in_flight.retain(|fill| fill.range != gap);
            state.populated.insert(gap);
        }
        self.inner.bump();
    }

    fn fail_gap(&self, gap: ByteRange, error: Arc<CacheError>) {
        {
            let mut state = self.inner.fill.lock().unwrap();
            if let Some(fill) = state.in_flight.iter_mut().find(|f| f.range == gap) {
                // the written prefix stays readable
                let progressed = ByteRange::new(gap.start, gap.start + fill.progress);
                fill.failed = Some(error);
                state.populated.insert(progressed);
            }
        }
        self.inner.bump();
    }

    async fn run_fills(
        self,
        write_start: u64,
        gaps: Vec<ByteRange>,
        writer: Arc<dyn RangeWriter>,
    ) {
        let permit = FetchPermit::acquire();
        let mut abort: Option<Arc<CacheError>> = None;
        for gap in gaps {
            if let Some(error) = &abort {
                self.fail_gap(gap, Arc::clone(error));
                continue;
            }
            trace!(file = %self.inner.name, range = %gap, "filling cache gap");
            let updater = self.progress_updater(gap);
            let result = writer
                .fill(
                    &self.inner.channel,
                    &permit,
                    gap.start,
                    gap.start - write_start,
                    gap.len(),
                    &updater,
                )
                .await;
            match result {
                Ok(()) => self.complete_gap(gap),
                Err(error) => {
                    debug!(
                        file = %self.inner.name,
                        range = %gap,
                        error = %error,
                        "cache fill failed"
                    );
                    let error = Arc::new(error);
                    self.fail_gap(gap, Arc::clone(&error));
                    abort = Some(error);
                }
            }
        }
    }

    /// Wait for `range` to become readable, streaming newly available
    /// prefixes into the sink as population progresses.
    async fn await_range(&self, range: ByteRange, mut sink: ReadSink<'_, '_>) -> CacheResult<u64> {
        let mut version = self.inner.version.subscribe();
        let mut delivered: u64 = 0;
        loop {
            enum Status {
                Ready,
                Pending,
                Failed(Arc<CacheError>),
                Stalled,
            }
            let (available, status) = {
                let state = self.inner.fill.lock().unwrap();
                if state.evicted {
                    return Err(CacheError::Evicted);
                }
                let available = state.available_prefix(range);
                let status = if available >= range.len() {
                    Status::Ready
                } else if let Some(error) = state.blocking_error(range, available) {
                    Status::Failed(error)
                } else if state.remainder_claimed(range, available) {
                    Status::Pending
                } else {
                    Status::Stalled
                };
                (available, status)
            };

            // deliver the newly readable prefix before acting on the status,
            // so partial fills reach the caller even when the rest fails
            if available > delivered {
                match &mut sink {
                    ReadSink::Buffer(buf) => {
                        let mut chunk = vec![0u8; COPY_BUFFER_SIZE];
                        while delivered < available {
                            let want = chunk.len().min((available - delivered) as usize);
                            self.inner
                                .channel
                                .read_exact_at(range.start + delivered, &mut chunk[..want])?;
                            buf.put(&chunk[..want]);
                            delivered += want as u64;
                        }
                    }
                    ReadSink::Discard => delivered = available,
                }
            }

            match status {
                Status::Ready => {
                    debug_assert_eq!(delivered, range.len());
                    return Ok(range.len());
                }
                Status::Failed(error) => return Err(CacheError::Shared(error)),
                Status::Stalled => {
                    return Err(CacheError::Io(std::io::Error::other(
                        "cache fill abandoned before completion",
                    )))
                }
                Status::Pending => {
                    version.changed().await.map_err(|_| CacheError::Evicted)?;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheCoordinator for SharedCacheFile {
    async fn read_if_available_or_pending(
        &self,
        range: ByteRange,
        sink: ReadSink<'_, '_>,
    ) -> CacheResult<Option<u64>> {
        {
            let state = self.inner.fill.lock().unwrap();
            if state.evicted {
                return Err(CacheError::Evicted);
            }
            if !state.remainder_claimed(range, 0) {
                return Ok(None);
            }
        }
        self.await_range(range, sink).await.map(Some)
    }

    async fn populate_and_read(
        &self,
        write_range: ByteRange,
        read_range: ByteRange,
        sink: ReadSink<'_, '_>,
        writer: Arc<dyn RangeWriter>,
    ) -> CacheResult<u64> {
        self.check_ranges(write_range, read_range)?;
        let gaps = self.claim_gaps(write_range)?;
        if !gaps.is_empty() {
            self.inner.bump();
            let this = self.clone();
            tokio::spawn(as_cache_fetch_task(this.run_fills(
                write_range.start,
                gaps,
                writer,
            )));
        }
        self.await_range(read_range, sink).await
    }
}

/// Process-wide registry of shared cache files, one sparse file per logical
/// file, named by digest under the cache directory.
pub struct SharedCache {
    dir: PathBuf,
    files: DashMap<String, SharedCacheFile>,
    generation: AtomicU64,
}

impl SharedCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> CacheResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            dir,
            files: DashMap::new(),
            generation: AtomicU64::new(0),
        }))
    }

    fn file_name_for(name: &str, generation: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        format!("{}-{generation}", hex::encode(hasher.finalize()))
    }

    fn create_file(&self, name: &str, len: u64) -> CacheResult<SharedCacheFile> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(Self::file_name_for(name, generation));
        SharedCacheFile::create(name, len, &path)
    }

    /// Return a live region for `name`, creating one iff the current entry
    /// is missing or evicted.
    pub fn grab(&self, name: &str, len: u64) -> CacheResult<SharedCacheFile> {
        match self.files.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_evicted() {
                    return Ok(entry.get().clone());
                }
                let fresh = self.create_file(name, len)?;
                entry.insert(fresh.clone());
                Ok(fresh)
            }
            Entry::Vacant(entry) => {
                let fresh = self.create_file(name, len)?;
                entry.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }

    /// Evict the region registered under `name`, if any.
    pub fn evict(&self, name: &str) -> bool {
        match self.files.remove(name) {
            Some((_, file)) => {
                file.evict();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::coordinator::ReadBuffer;
    use std::sync::atomic::AtomicUsize;

    /// Writes from a full-file image; the channel of a region spans the
    /// whole file, so `channel_pos` doubles as the absolute offset.
    struct StaticWriter {
        data: Vec<u8>,
        fills: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RangeWriter for StaticWriter {
        async fn fill(
            &self,
            channel: &CacheChannel,
            permit: &FetchPermit,
            channel_pos: u64,
            relative_pos: u64,
            length: u64,
            progress: &ProgressUpdater,
        ) -> CacheResult<()> {
            assert!(relative_pos <= channel_pos);
            self.fills.fetch_add(1, Ordering::SeqCst);
            let start = channel_pos as usize;
            let data = &self.data[start..start + length as usize];
            channel.write_at(permit, channel_pos, data)?;
            progress.update(length);
            Ok(())
        }
    }

    struct FailingWriter;

    #[async_trait::async_trait]
    impl RangeWriter for FailingWriter {
        async fn fill(
            &self,
            _channel: &CacheChannel,
            _permit: &FetchPermit,
            _channel_pos: u64,
            _relative_pos: u64,
            _length: u64,
            _progress: &ProgressUpdater,
        ) -> CacheResult<()> {
            Err(CacheError::Eof("backing stream dried up".into()))
        }
    }

    fn cache_file(len: u64) -> (SharedCacheFile, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let file = SharedCacheFile::create("_0.cfs", len, &dir.path().join("region")).unwrap();
        (file, dir)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 13 + 5) % 251) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_populate_then_resident_read() {
        let (file, _dir) = cache_file(4096);
        let data = pattern(4096);
        let writer = Arc::new(StaticWriter {
            data: data.clone(),
            fills: AtomicUsize::new(0),
        });

        let mut out = vec![0u8; 100];
        let mut buf = ReadBuffer::new(&mut out);
        let read = file
            .populate_and_read(
                ByteRange::new(0, 4096),
                ByteRange::new(50, 150),
                ReadSink::Buffer(&mut buf),
                writer.clone(),
            )
            .await
            .unwrap();
        assert_eq!(read, 100);
        assert_eq!(out, &data[50..150]);
        assert_eq!(writer.fills.load(Ordering::SeqCst), 1);

        // now resident: served without another fill
        let mut out2 = vec![0u8; 4096];
        let mut buf2 = ReadBuffer::new(&mut out2);
        let served = file
            .read_if_available_or_pending(ByteRange::new(0, 4096), ReadSink::Buffer(&mut buf2))
            .await
            .unwrap();
        assert_eq!(served, Some(4096));
        assert_eq!(out2, data);
        assert_eq!(writer.fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_if_available_misses_when_unpopulated() {
        let (file, _dir) = cache_file(4096);
        let mut out = vec![0u8; 64];
        let mut buf = ReadBuffer::new(&mut out);
        let served = file
            .read_if_available_or_pending(ByteRange::new(0, 64), ReadSink::Buffer(&mut buf))
            .await
            .unwrap();
        assert_eq!(served, None);
        assert_eq!(buf.filled(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_populates_run_one_writer() {
        let (file, _dir) = cache_file(8192);
        let data = pattern(8192);
        let writer = Arc::new(StaticWriter {
            data: data.clone(),
            fills: AtomicUsize::new(0),
        });

        let range = ByteRange::new(0, 8192);
        let mut a = vec![0u8; 8192];
        let mut b = vec![0u8; 8192];
        let mut buf_a = ReadBuffer::new(&mut a);
        let mut buf_b = ReadBuffer::new(&mut b);
        let (ra, rb) = tokio::join!(
            file.populate_and_read(range, range, ReadSink::Buffer(&mut buf_a), writer.clone()),
            file.populate_and_read(range, range, ReadSink::Buffer(&mut buf_b), writer.clone()),
        );
        assert_eq!(ra.unwrap(), 8192);
        assert_eq!(rb.unwrap(), 8192);
        assert_eq!(a, data);
        assert_eq!(b, data);
        // overlapping write ranges share a single writer invocation
        assert_eq!(writer.fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_fill_propagates_and_is_retryable() {
        let (file, _dir) = cache_file(1024);
        let range = ByteRange::new(0, 1024);

        let err = file
            .populate_and_read(range, range, ReadSink::Discard, Arc::new(FailingWriter))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Shared(_)));

        // the failed claim is released; a later populate succeeds
        let data = pattern(1024);
        let writer = Arc::new(StaticWriter {
            data: data.clone(),
            fills: AtomicUsize::new(0),
        });
        let mut out = vec![0u8; 1024];
        let mut buf = ReadBuffer::new(&mut out);
        let read = file
            .populate_and_read(range, range, ReadSink::Buffer(&mut buf), writer)
            .await
            .unwrap();
        assert_eq!(read, 1024);
        assert_eq!(out, data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eviction_fails_waiters() {
        let (file, _dir) = cache_file(1024);
        file.evict();
        assert!(file.is_evicted());
        let err = file
            .read_if_available_or_pending(ByteRange::new(0, 10), ReadSink::Discard)
            .await
            .unwrap_err();
        assert!(err.is_eviction());
        let err = file
            .populate_and_read(
                ByteRange::new(0, 1024),
                ByteRange::new(0, 10),
                ReadSink::Discard,
                Arc::new(FailingWriter),
            )
            .await
            .unwrap_err();
        assert!(err.is_eviction());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registry_replaces_only_evicted_regions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SharedCache::new(dir.path()).unwrap();

        let first = cache.grab("_0.cfs", 1024).unwrap();
        let again = cache.grab("_0.cfs", 1024).unwrap();
        assert!(Arc::ptr_eq(&first.inner, &again.inner));

        assert!(cache.evict("_0.cfs"));
        assert!(first.is_evicted());
        assert!(!cache.evict("_0.cfs"));

        let fresh = cache.grab("_0.cfs", 1024).unwrap();
        assert!(!fresh.is_evicted());
        assert!(!Arc::ptr_eq(&first.inner, &fresh.inner));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_write_range_only_fills_gaps() {
        let (file, _dir) = cache_file(4096);
        let data = pattern(4096);

        let writer = Arc::new(StaticWriter {
            data: data.clone(),
            fills: AtomicUsize::new(0),
        });
        // populate the middle first
        file.populate_and_read(
            ByteRange::new(1024, 2048),
            ByteRange::new(1024, 2048),
            ReadSink::Discard,
            writer.clone(),
        )
        .await
        .unwrap();
        assert_eq!(writer.fills.load(Ordering::SeqCst), 1);

        // a covering populate only fills the two remaining gaps
        let mut out = vec![0u8; 4096];
        let mut buf = ReadBuffer::new(&mut out);
        file.populate_and_read(
            ByteRange::new(0, 4096),
            ByteRange::new(0, 4096),
            ReadSink::Buffer(&mut buf),
            writer.clone(),
        )
        .await
        .unwrap();
        assert_eq!(out, data);
        assert_eq!(writer.fills.load(Ordering::SeqCst), 3);
    }
}
