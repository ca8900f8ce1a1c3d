//! Consumed contract of the shared cache: coordinator trait, positional
//! channel IO, read sinks, and the fetch-task capability token.
//!
//! Only cache-fetch tasks may write to a cache channel. Instead of matching
//! on thread names, the coordinator scopes its fetch tasks with a task-local
//! marker and mints a [`FetchPermit`] inside that scope; `write_at` demands
//! the permit.

use crate::error::{CacheError, CacheResult};
use crate::snapshot::ByteRange;
use async_trait::async_trait;
use std::fs::File;
use std::future::Future;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Chunk size for streaming copies between the blob store, the cache
/// channel and caller buffers.
pub const COPY_BUFFER_SIZE: usize = 8 * 1024;

tokio::task_local! {
    static CACHE_FETCH_TASK: ();
}

/// True when the current task was spawned as a cache-fetch task.
pub fn is_cache_fetch_task() -> bool {
    CACHE_FETCH_TASK.try_with(|_| ()).is_ok()
}

/// Wrap a future so it runs marked as a cache-fetch task.
pub fn as_cache_fetch_task<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    CACHE_FETCH_TASK.scope((), fut)
}

/// Capability required for positional writes into a cache channel. Minted by
/// coordinator implementations inside their fetch-task scope.
pub struct FetchPermit(());

impl FetchPermit {
    pub fn acquire() -> Self {
        debug_assert!(
            is_cache_fetch_task(),
            "fetch permits may only be minted on cache-fetch tasks"
        );
        FetchPermit(())
    }
}

/// Positional IO over the storage backing one cache region. The handle stays
/// valid for the duration of a callback; eviction invalidates it.
#[derive(Clone)]
pub struct CacheChannel {
    file: Arc<File>,
    evicted: Arc<AtomicBool>,
}

impl CacheChannel {
    pub fn new(file: Arc<File>) -> Self {
        Self {
            file,
            evicted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Read exactly `buf.len()` bytes at `position`. The region length is
    /// known up front, so a short read is an invariant violation.
    pub fn read_exact_at(&self, position: u64, buf: &mut [u8]) -> CacheResult<()> {
        if self.is_evicted() {
            return Err(CacheError::Evicted);
        }
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.file.read_at(&mut buf[read..], position + read as u64)?;
            if n == 0 {
                return Err(CacheError::Eof(format!(
                    "unexpected EOF reading [{}-{}] from cache channel",
                    position,
                    position + buf.len() as u64
                )));
            }
            read += n;
        }
        Ok(())
    }

    /// Positional write; requires a fetch permit.
    pub fn write_at(&self, _permit: &FetchPermit, position: u64, data: &[u8]) -> CacheResult<()> {
        if self.is_evicted() {
            return Err(CacheError::Evicted);
        }
        self.file.write_all_at(data, position)?;
        Ok(())
    }
}

/// Destination buffer for a cached read, tracking how many bytes have been
/// delivered so partial fills can be completed by a fallback path.
pub struct ReadBuffer<'a> {
    dst: &'a mut [u8],
    filled: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(dst: &'a mut [u8]) -> Self {
        Self { dst, filled: 0 }
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn remaining(&self) -> usize {
        self.dst.len() - self.filled
    }

    /// Append `src` at the fill cursor.
    pub fn put(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.remaining());
        self.dst[self.filled..self.filled + src.len()].copy_from_slice(src);
        self.filled += src.len();
    }
}

/// Where a coordinator read delivers its bytes: into a caller buffer, or
/// nowhere (populate-only operations that still await readability).
pub enum ReadSink<'a, 'b> {
    Buffer(&'a mut ReadBuffer<'b>),
    Discard,
}

/// Reports writer progress back to the coordinator; every update makes the
/// written prefix of the current gap readable to concurrent readers.
pub struct ProgressUpdater {
    notify: Box<dyn Fn(u64) + Send + Sync>,
}

impl ProgressUpdater {
    pub fn new(notify: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            notify: Box::new(notify),
        }
    }

    /// Report the total bytes written so far for the current gap.
    pub fn update(&self, bytes_written: u64) {
        (self.notify)(bytes_written);
    }
}

/// Fills contiguous unpopulated gaps of a declared write range. Invoked once
/// per gap, on a cache-fetch task, with positions relative to both the
/// channel and the declared range.
#[async_trait]
pub trait RangeWriter: Send + Sync {
    async fn fill(
        &self,
        channel: &CacheChannel,
        permit: &FetchPermit,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
        progress: &ProgressUpdater,
    ) -> CacheResult<()>;
}

/// Contract exposed by a shared cache region to its readers.
#[async_trait]
pub trait CacheCoordinator: Send + Sync {
    /// Serve `range` if it is entirely resident or currently being filled by
    /// another writer: wait for coverage, stream available prefixes into the
    /// sink and return the byte count. Returns `Ok(None)` otherwise.
    async fn read_if_available_or_pending(
        &self,
        range: ByteRange,
        sink: ReadSink<'_, '_>,
    ) -> CacheResult<Option<u64>>;

    /// Declare intent to fill `write_range` (which must contain
    /// `read_range`). Unpopulated gaps are claimed and handed to `writer`
    /// one by one on a cache-fetch task, with at most one active writer per
    /// region. Completes once `read_range` is readable, delivering it into
    /// the sink.
    async fn populate_and_read(
        &self,
        write_range: ByteRange,
        read_range: ByteRange,
        sink: ReadSink<'_, '_>,
        writer: Arc<dyn RangeWriter>,
    ) -> CacheResult<u64>;
}
