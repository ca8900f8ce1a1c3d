//! Shared cache plumbing: the coordinator contract, the on-disk region
//! implementation, and the header KV cache.

pub mod coordinator;
pub mod header;
pub mod shared_file;

pub use coordinator::{
    as_cache_fetch_task, is_cache_fetch_task, CacheChannel, CacheCoordinator, FetchPermit,
    ProgressUpdater, RangeWriter, ReadBuffer, ReadSink, COPY_BUFFER_SIZE,
};
pub use header::{CachedHeader, HeaderCache, HeaderLookup, MemoryHeaderCache};
pub use shared_file::{SharedCache, SharedCacheFile};
