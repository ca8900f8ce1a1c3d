//! Unified error surface for cache reads.
//!
//! Higher layers branch on the error class: only [`CacheError::Evicted`]
//! (possibly behind a wrapper) makes a reader fall back to reading the blob
//! store directly; everything else propagates.

use std::sync::Arc;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Bad positions, bad slice bounds, invalid io context.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Seek past end of file, or a stream that ended before the requested
    /// number of bytes was delivered.
    #[error("unexpected end of file: {0}")]
    Eof(String),

    /// The shared cache region backing an in-flight operation was reclaimed.
    #[error("shared cache region evicted")]
    Evicted,

    /// The blob store has no object under the requested part name.
    #[error("blob [{0}] not found")]
    BlobNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// One cache fill failed and its error is shared with every waiter.
    #[error("{0}")]
    Shared(Arc<CacheError>),

    /// Wrapper applied by the reader to non-eviction failures of the cached
    /// read paths.
    #[error("failed to read data from cache")]
    ReadFailed {
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// True when the root cause of this error is a cache eviction.
    pub fn is_eviction(&self) -> bool {
        match self {
            CacheError::Evicted => true,
            CacheError::Shared(inner) => inner.is_eviction(),
            CacheError::ReadFailed { source } => source.is_eviction(),
            _ => false,
        }
    }
}
