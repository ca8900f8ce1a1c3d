//! Random-access readers over cached snapshot files.

pub mod cached;
pub mod directory;

pub use cached::CachedFileReader;
pub use directory::SnapshotDirectory;

use crate::error::CacheResult;
use async_trait::async_trait;

/// Tag distinguishing normal reads from cache-warming reads. Warming
/// operates at part granularity through a separate prefetch subsystem and
/// must not use the header cache path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoContext {
    Normal,
    Warming,
}

/// Capability set of a random-access file reader.
#[async_trait]
pub trait RandomAccessReader: Send {
    /// Fill `dst` completely starting at the current file pointer and
    /// advance the pointer; partial reads never surface.
    async fn read_bytes(&mut self, dst: &mut [u8]) -> CacheResult<()>;

    /// Position the file pointer within `[0, len]`.
    fn seek(&mut self, position: u64) -> CacheResult<()>;

    fn file_pointer(&self) -> u64;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A narrowed view `[offset, offset + length)` with its own cursor.
    fn slice(&self, description: &str, offset: u64, length: u64) -> CacheResult<Self>
    where
        Self: Sized;

    /// Idempotent; releases no shared cache state.
    fn close(&mut self) {}
}
