//! frostcache: a read-through byte-range cache for snapshot files.
//!
//! Sits between a search/index engine and a remote immutable blob store
//! holding the physical parts of snapshot files. Each logical file gets a
//! random-access reader whose semantics match a plain local file, while the
//! bytes are fetched from the blob store in cache-aligned ranges and
//! memoized in on-disk regions shared across files. Small files and file
//! headers are additionally served from a key-value header cache so a fresh
//! mount can answer its first reads without a blob store round trip.

pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod reader;
pub mod snapshot;
pub mod stats;

pub use crate::blob::{
    BlobContainer, BlobRead, BlobSource, BlobStream, LocalFsContainer, MemoryBlobContainer,
};
pub use crate::cache::{
    CacheChannel, CacheCoordinator, CachedHeader, FetchPermit, HeaderCache, HeaderLookup,
    MemoryHeaderCache, ProgressUpdater, RangeWriter, ReadBuffer, ReadSink, SharedCache,
    SharedCacheFile, COPY_BUFFER_SIZE,
};
pub use crate::config::CacheConfig;
pub use crate::error::{CacheError, CacheResult};
pub use crate::reader::{CachedFileReader, IoContext, RandomAccessReader, SnapshotDirectory};
pub use crate::snapshot::{ByteRange, FileInfo, RangeSet, FOOTER_LEN};
pub use crate::stats::{FillTimer, ReadStats};
