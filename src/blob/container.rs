//! Contract for the remote object store holding snapshot file parts.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;

/// Byte stream handed back by a ranged blob read.
pub type BlobRead = Box<dyn AsyncRead + Send + Unpin>;

/// A container of immutable blobs supporting ranged reads.
#[async_trait]
pub trait BlobContainer: Send + Sync {
    /// Open a sequential stream over `[offset, offset + length)` of the blob
    /// stored under `name`. The stream may end early if the blob is shorter
    /// than requested; callers that require exact lengths enforce that.
    async fn read_blob(&self, name: &str, offset: u64, length: u64) -> CacheResult<BlobRead>;
}

/// In-memory container for local development and tests.
#[derive(Default)]
pub struct MemoryBlobContainer {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_blob(&self, name: impl Into<String>, data: Bytes) {
        self.blobs.write().await.insert(name.into(), data);
    }
}

#[async_trait]
impl BlobContainer for MemoryBlobContainer {
    async fn read_blob(&self, name: &str, offset: u64, length: u64) -> CacheResult<BlobRead> {
        let guard = self.blobs.read().await;
        let blob = guard
            .get(name)
            .ok_or_else(|| CacheError::BlobNotFound(name.to_string()))?;
        let start = (offset as usize).min(blob.len());
        let end = ((offset + length) as usize).min(blob.len());
        Ok(Box::new(Cursor::new(blob.slice(start..end))))
    }
}
