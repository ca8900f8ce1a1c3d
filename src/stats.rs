//! Per-file read statistics.
//!
//! Counters are plain relaxed atomics so they can be bumped from caller
//! tasks, cache-fetch tasks and completion tasks alike.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct ReadStats {
    open_count: AtomicU64,

    cached_bytes_read: AtomicU64,
    cached_bytes_written: AtomicU64,
    cached_write_nanos: AtomicU64,

    index_cache_bytes_read: AtomicU64,
    index_cache_fills: AtomicU64,
    index_cache_fill_nanos: AtomicU64,

    blob_bytes_requested: AtomicU64,

    direct_bytes_read: AtomicU64,
    direct_read_nanos: AtomicU64,

    contiguous_bytes_read: AtomicU64,
    non_contiguous_bytes_read: AtomicU64,

    forward_seeks: AtomicU64,
    backward_seeks: AtomicU64,
}

impl ReadStats {
    pub fn increment_open(&self) {
        self.open_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cached_bytes_read(&self, n: u64) {
        if n > 0 {
            self.cached_bytes_read.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_cached_bytes_written(&self, n: u64, elapsed: Duration) {
        self.cached_bytes_written.fetch_add(n, Ordering::Relaxed);
        self.cached_write_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_index_cache_bytes_read(&self, n: u64) {
        self.index_cache_bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_blob_bytes_requested(&self, n: u64) {
        self.blob_bytes_requested.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_direct_bytes_read(&self, n: u64, elapsed: Duration) {
        self.direct_bytes_read.fetch_add(n, Ordering::Relaxed);
        self.direct_read_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a completed read, distinguishing contiguous reads (starting
    /// exactly where the previous one ended) from non-contiguous ones.
    pub fn increment_bytes_read(&self, last_position: u64, position: u64, n: u64) {
        if position == last_position {
            self.contiguous_bytes_read.fetch_add(n, Ordering::Relaxed);
        } else {
            self.non_contiguous_bytes_read.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record a seek, distinguishing forward from backward moves.
    pub fn increment_seeks(&self, last_position: u64, position: u64) {
        if position > last_position {
            self.forward_seeks.fetch_add(1, Ordering::Relaxed);
        } else if position < last_position {
            self.backward_seeks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    pub fn cached_bytes_read(&self) -> u64 {
        self.cached_bytes_read.load(Ordering::Relaxed)
    }

    pub fn cached_bytes_written(&self) -> u64 {
        self.cached_bytes_written.load(Ordering::Relaxed)
    }

    pub fn cached_write_nanos(&self) -> u64 {
        self.cached_write_nanos.load(Ordering::Relaxed)
    }

    pub fn index_cache_fill_nanos(&self) -> u64 {
        self.index_cache_fill_nanos.load(Ordering::Relaxed)
    }

    pub fn direct_read_nanos(&self) -> u64 {
        self.direct_read_nanos.load(Ordering::Relaxed)
    }

    pub fn index_cache_bytes_read(&self) -> u64 {
        self.index_cache_bytes_read.load(Ordering::Relaxed)
    }

    pub fn index_cache_fills(&self) -> u64 {
        self.index_cache_fills.load(Ordering::Relaxed)
    }

    pub fn blob_bytes_requested(&self) -> u64 {
        self.blob_bytes_requested.load(Ordering::Relaxed)
    }

    pub fn direct_bytes_read(&self) -> u64 {
        self.direct_bytes_read.load(Ordering::Relaxed)
    }

    pub fn contiguous_bytes_read(&self) -> u64 {
        self.contiguous_bytes_read.load(Ordering::Relaxed)
    }

    pub fn non_contiguous_bytes_read(&self) -> u64 {
        self.non_contiguous_bytes_read.load(Ordering::Relaxed)
    }

    pub fn forward_seeks(&self) -> u64 {
        self.forward_seeks.load(Ordering::Relaxed)
    }

    pub fn backward_seeks(&self) -> u64 {
        self.backward_seeks.load(Ordering::Relaxed)
    }
}

/// Timer handle for one header-cache fill; closes exactly once.
#[derive(Debug)]
pub struct FillTimer {
    stats: Arc<ReadStats>,
    started: Instant,
    closed: bool,
}

impl FillTimer {
    /// Start timing a header-cache fill. The timer records exactly one fill
    /// when closed (or dropped).
    pub fn start(stats: Arc<ReadStats>) -> Self {
        Self {
            stats,
            started: Instant::now(),
            closed: false,
        }
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stats.index_cache_fills.fetch_add(1, Ordering::Relaxed);
        self.stats
            .index_cache_fill_nanos
            .fetch_add(self.started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Drop for FillTimer {
    fn drop(&mut self) {
        self.finish();
    }
}
