//! The cached reader: a random-access view over one snapshot file whose
//! bytes live in the blob store and are memoized in the shared cache.
//!
//! A read is served by the first of three sources that can satisfy it:
//! bytes already resident (or being filled) on disk, the header KV cache for
//! file prefixes and tiny files, and finally the blob store itself, which
//! populates the shared cache and the caller's buffer in one pass. If the
//! cache region is evicted while a read is in flight, the unfilled tail is
//! fetched directly from the blob store.

use crate::blob::BlobSource;
use crate::cache::{
    is_cache_fetch_task, CacheChannel, CacheCoordinator, CachedHeader, FetchPermit,
    HeaderLookup, ProgressUpdater, RangeWriter, ReadBuffer, ReadSink, SharedCache,
    SharedCacheFile, COPY_BUFFER_SIZE,
};
use crate::error::{CacheError, CacheResult};
use crate::reader::directory::SnapshotDirectory;
use crate::reader::{IoContext, RandomAccessReader};
use crate::snapshot::{ByteRange, FileInfo, FOOTER_LEN};
use crate::stats::{FillTimer, ReadStats};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, trace};

pub struct CachedFileReader {
    directory: SnapshotDirectory,
    info: Arc<FileInfo>,
    context: IoContext,
    stats: Arc<ReadStats>,
    /// Start of this view within the logical file.
    offset: u64,
    /// Length of this view.
    length: u64,
    cache_ref: Arc<CacheFileRef>,
    default_range_size: u64,
    recovery_range_size: u64,
    header_blob_size: u64,
    is_clone: bool,
    file_pointer: u64,
    last_read_position: u64,
    last_seek_position: u64,
}

impl CachedFileReader {
    pub(crate) fn new(
        directory: SnapshotDirectory,
        info: Arc<FileInfo>,
        context: IoContext,
        stats: Arc<ReadStats>,
    ) -> Self {
        let config = directory.config().clone();
        let cache_ref = Arc::new(CacheFileRef::new(
            Arc::clone(directory.shared_cache()),
            info.name().to_string(),
            info.length(),
        ));
        Self {
            default_range_size: config.default_range_size,
            recovery_range_size: config.recovery_range_size,
            header_blob_size: config.header_blob_size,
            offset: 0,
            length: info.length(),
            cache_ref,
            is_clone: false,
            file_pointer: 0,
            last_read_position: 0,
            last_seek_position: 0,
            directory,
            info,
            context,
            stats,
        }
    }

    pub fn file_pointer(&self) -> u64 {
        self.file_pointer
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Releases no external state; cache lifetimes are managed elsewhere.
    pub fn close(&mut self) {}

    /// Fill `dst` completely from the current file pointer, advancing it.
    pub async fn read_bytes(&mut self, dst: &mut [u8]) -> CacheResult<()> {
        if self.context == IoContext::Warming {
            return Err(CacheError::InvalidArgument(
                "cannot service reads in the cache warming context".into(),
            ));
        }
        debug_assert!(
            !is_cache_fetch_task(),
            "reads must not run on cache-fetch tasks"
        );
        if dst.is_empty() {
            return Ok(());
        }
        let length = dst.len() as u64;
        if self
            .file_pointer
            .checked_add(length)
            .is_none_or(|end| end > self.length)
        {
            return Err(CacheError::Eof(format!(
                "read past end of file [position={}, read_length={length}, length={}]",
                self.file_pointer, self.length
            )));
        }
        let position = self.file_pointer + self.offset;

        // Directories read the trailing checksum footer of every file when
        // they open; the snapshot metadata already holds the checksum, so
        // serve those 16 bytes without touching any cache or the blob store.
        if !self.is_clone
            && length == FOOTER_LEN as u64
            && self.info.length() >= FOOTER_LEN as u64
            && position == self.info.length() - FOOTER_LEN as u64
        {
            if let Some(footer) = self.info.footer_from_checksum() {
                dst.copy_from_slice(&footer);
                trace!(
                    file = self.info.name(),
                    position,
                    "read footer from snapshot metadata, bypassing all caches"
                );
                self.file_pointer += length;
                return Ok(());
            }
        }

        trace!(
            file = self.info.name(),
            position,
            length,
            "reading from cached input"
        );

        let mut buf = ReadBuffer::new(dst);
        match self.read_cached(position, &mut buf).await {
            Ok(()) => debug_assert_eq!(buf.remaining(), 0),
            Err(error) if error.is_eviction() => {
                // the buffer may hold a partial fill; fetch only the tail
                let already_read = buf.filled() as u64;
                debug!(
                    file = self.info.name(),
                    position,
                    already_read,
                    "cache region evicted mid-read, reading remainder from blob store"
                );
                self.read_directly(position + already_read, &mut buf)
                    .await
                    .map_err(|direct| match direct {
                        eof @ CacheError::Eof(_) => eof,
                        other => CacheError::ReadFailed {
                            source: Box::new(other),
                        },
                    })?;
            }
            Err(error) => {
                return Err(CacheError::ReadFailed {
                    source: Box::new(error),
                })
            }
        }

        self.read_complete(position, length);
        self.file_pointer += length;
        Ok(())
    }

    /// Position the cursor within `[0, len]`. Contiguity of reads is judged
    /// only across reads, so the last read position stays untouched.
    pub fn seek(&mut self, position: u64) -> CacheResult<()> {
        if position > self.length {
            return Err(CacheError::Eof(format!(
                "seeking past end of file [position={position}, length={}]",
                self.length
            )));
        }
        let absolute = position + self.offset;
        self.stats.increment_seeks(self.last_seek_position, absolute);
        self.last_seek_position = absolute;
        self.file_pointer = position;
        Ok(())
    }

    /// A narrowed view sharing the cache reference and stats sink.
    pub fn slice(&self, description: &str, offset: u64, length: u64) -> CacheResult<Self> {
        if offset
            .checked_add(length)
            .is_none_or(|end| end > self.length)
        {
            return Err(CacheError::InvalidArgument(format!(
                "slice [{description}] out of bounds: offset={offset}, length={length}, \
                 file_length={}",
                self.length
            )));
        }
        let mut slice = self.clone();
        slice.offset = self.offset + offset;
        slice.length = length;
        slice.file_pointer = 0;
        slice.last_read_position = slice.offset;
        slice.last_seek_position = slice.offset;
        Ok(slice)
    }

    fn read_complete(&mut self, position: u64, length: u64) {
        self.stats
            .increment_bytes_read(self.last_read_position, position, length);
        self.last_read_position = position + length;
        self.last_seek_position = self.last_read_position;
    }

    fn range_size(&self) -> u64 {
        match self.context {
            IoContext::Warming => self.info.part_size(),
            IoContext::Normal => {
                if self.directory.is_recovery_done() {
                    self.default_range_size
                } else {
                    self.recovery_range_size
                }
            }
        }
    }

    fn blob_source(&self) -> BlobSource {
        BlobSource::new(
            Arc::clone(self.directory.blob_container()),
            Arc::clone(&self.info),
            Arc::clone(&self.stats),
        )
    }

    fn header_miss_range(&self, can_be_fully_cached: bool) -> ByteRange {
        if can_be_fully_cached {
            ByteRange::new(0, self.info.length())
        } else {
            ByteRange::new(0, self.header_blob_size)
        }
    }

    /// Steps of the cached read: disk fast path, header cache, blob store.
    async fn read_cached(&self, position: u64, buf: &mut ReadBuffer<'_>) -> CacheResult<()> {
        let length = buf.remaining() as u64;
        let cache_file = self.cache_ref.get()?;
        let read_range = ByteRange::new(position, position + length);

        // Can the read be served from disk? If so, nothing else matters.
        let before = buf.filled();
        let resident = cache_file
            .read_if_available_or_pending(read_range, ReadSink::Buffer(&mut *buf))
            .await;
        self.stats
            .add_cached_bytes_read((buf.filled() - before) as u64);
        if let Some(read) = resident? {
            debug_assert_eq!(read, length);
            trace!(
                file = self.info.name(),
                position,
                length,
                "read served from shared cache"
            );
            return Ok(());
        }

        // Not on disk; consult the header cache for file prefixes and files
        // small enough to be cached whole.
        let can_be_fully_cached = self.info.length() <= self.header_blob_size * 2;
        let is_start_of_file = position + length <= self.header_blob_size;
        let mut index_cache_miss = None;

        if can_be_fully_cached || is_start_of_file {
            match self
                .directory
                .header_cache()
                .lookup(self.info.name(), 0, length)
                .await
            {
                HeaderLookup::Hit(header) if header.covers(position, length) => {
                    trace!(
                        file = self.info.name(),
                        position,
                        length,
                        "read served from header cache"
                    );
                    self.stats.add_index_cache_bytes_read(header.len());
                    let start = (position - header.from) as usize;
                    buf.put(&header.bytes[start..start + length as usize]);
                    self.schedule_backfill(cache_file.clone(), header);
                    return Ok(());
                }
                HeaderLookup::Hit(_) | HeaderLookup::Miss | HeaderLookup::NotReady => {
                    // A miss must be filled even when the cache is not ready
                    // yet: the cache index is only created on the first put.
                    index_cache_miss = Some(self.header_miss_range(can_be_fully_cached));
                }
            }
        }

        // Visit the blob store, satisfying the read and any header cache
        // miss with a single cache-aligned population.
        let range_size = self.range_size();
        let file_len = self.info.length();
        let mut write_range = ByteRange::aligned(position, range_size, file_len).union(
            ByteRange::aligned(position + length - 1, range_size, file_len),
        );
        if let Some(miss) = index_cache_miss {
            write_range = write_range.union(miss);
        }
        debug_assert!(
            write_range.start <= position && position + length <= write_range.end,
            "{write_range} does not contain {read_range}"
        );

        let writer: Arc<dyn RangeWriter> = Arc::new(BlobFetchWriter {
            source: self.blob_source(),
            logical_start: write_range.start,
            stats: Arc::clone(&self.stats),
        });

        let before = buf.filled();
        let populated = if let Some(miss) = index_cache_miss {
            let fill_timer = FillTimer::start(Arc::clone(&self.stats));
            let populate = cache_file.populate_and_read(
                write_range,
                read_range,
                ReadSink::Buffer(&mut *buf),
                writer,
            );
            let header_fill = self.fill_header_cache(&cache_file, miss, fill_timer);
            let (populated, ()) = tokio::join!(populate, header_fill);
            populated
        } else {
            cache_file
                .populate_and_read(write_range, read_range, ReadSink::Buffer(&mut *buf), writer)
                .await
        };
        self.stats
            .add_cached_bytes_read((buf.filled() - before) as u64);
        let read = populated?;
        debug_assert_eq!(read, length);
        Ok(())
    }

    /// Once the missed header range is populated on disk, read it back and
    /// hand it to the header cache. The fill timer closes exactly once, on
    /// the put completion or on any of the failure paths.
    async fn fill_header_cache(
        &self,
        cache_file: &SharedCacheFile,
        miss: ByteRange,
        fill_timer: FillTimer,
    ) {
        let mut scratch = vec![0u8; miss.len() as usize];
        let mut scratch_buf = ReadBuffer::new(&mut scratch);
        let outcome = cache_file
            .read_if_available_or_pending(miss, ReadSink::Buffer(&mut scratch_buf))
            .await;
        match outcome {
            Ok(Some(read)) => {
                debug_assert_eq!(read, miss.len());
                let headers = Arc::clone(self.directory.header_cache());
                let name = self.info.name().to_string();
                let bytes = Bytes::from(scratch);
                tokio::spawn(async move {
                    if let Err(error) = headers.put(&name, miss.start, bytes).await {
                        debug!(file = %name, error = %error, "failed to store header cache blob");
                    }
                    fill_timer.close();
                });
            }
            Ok(None) => {
                // population of the covering range already failed; move on
                fill_timer.close();
            }
            Err(error) => {
                debug!(
                    file = self.info.name(),
                    range = %miss,
                    error = %error,
                    "header cache fill read failed"
                );
                fill_timer.close();
            }
        }
    }

    /// Copy a header cache hit into the shared cache in the background so
    /// the next read of this range is served from disk.
    fn schedule_backfill(&self, cache_file: SharedCacheFile, header: CachedHeader) {
        let range = ByteRange::new(header.from, header.to);
        let writer: Arc<dyn RangeWriter> = Arc::new(HeaderCopyWriter {
            header,
            stats: Arc::clone(&self.stats),
        });
        let name = self.info.name().to_string();
        tokio::spawn(async move {
            if let Err(error) = cache_file
                .populate_and_read(range, range, ReadSink::Discard, writer)
                .await
            {
                // no big deal, the bytes already reached the caller
                debug!(
                    file = %name,
                    range = %range,
                    error = %error,
                    "failed to copy header cache blob into shared cache"
                );
            }
        });
    }

    /// Read the remaining bytes straight from the blob store, bypassing the
    /// cache. Used once the backing region has been evicted.
    async fn read_directly(&self, position: u64, buf: &mut ReadBuffer<'_>) -> CacheResult<()> {
        let length = buf.remaining() as u64;
        if length == 0 {
            return Ok(());
        }
        trace!(
            file = self.info.name(),
            position,
            length,
            "direct read from blob store"
        );
        let started = Instant::now();
        let mut stream = self.blob_source().open(position, length).await?;
        let mut chunk = vec![0u8; COPY_BUFFER_SIZE.min(length as usize)];
        let mut copied = 0u64;
        while copied < length {
            let want = chunk.len().min((length - copied) as usize);
            let n = stream.read(&mut chunk[..want]).await?;
            buf.put(&chunk[..n]);
            copied += n as u64;
        }
        self.stats.add_direct_bytes_read(copied, started.elapsed());
        Ok(())
    }
}

impl Clone for CachedFileReader {
    /// Clones share the cache reference and stats sink but carry their own
    /// cursor; a clone never takes the footer shortcut.
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            info: Arc::clone(&self.info),
            context: self.context,
            stats: Arc::clone(&self.stats),
            offset: self.offset,
            length: self.length,
            cache_ref: Arc::clone(&self.cache_ref),
            default_range_size: self.default_range_size,
            recovery_range_size: self.recovery_range_size,
            header_blob_size: self.header_blob_size,
            is_clone: true,
            file_pointer: self.file_pointer,
            last_read_position: self.last_read_position,
            last_seek_position: self.last_seek_position,
        }
    }
}

#[async_trait]
impl RandomAccessReader for CachedFileReader {
    async fn read_bytes(&mut self, dst: &mut [u8]) -> CacheResult<()> {
        CachedFileReader::read_bytes(self, dst).await
    }

    fn seek(&mut self, position: u64) -> CacheResult<()> {
        CachedFileReader::seek(self, position)
    }

    fn file_pointer(&self) -> u64 {
        CachedFileReader::file_pointer(self)
    }

    fn len(&self) -> u64 {
        CachedFileReader::len(self)
    }

    fn slice(&self, description: &str, offset: u64, length: u64) -> CacheResult<Self> {
        CachedFileReader::slice(self, description, offset, length)
    }

    fn close(&mut self) {
        CachedFileReader::close(self)
    }
}

/// Lazily acquired reference to the shared cache region of one file.
///
/// Holds the last used handle and replaces it only when it is missing or
/// evicted; the check and the swap happen under one lock so concurrent
/// getters never install a second region over a live one.
struct CacheFileRef {
    cache: Arc<SharedCache>,
    name: String,
    file_len: u64,
    current: Mutex<Option<SharedCacheFile>>,
}

impl CacheFileRef {
    fn new(cache: Arc<SharedCache>, name: String, file_len: u64) -> Self {
        Self {
            cache,
            name,
            file_len,
            current: Mutex::new(None),
        }
    }

    fn get(&self) -> CacheResult<SharedCacheFile> {
        let mut slot = self.current.lock().unwrap();
        if let Some(file) = slot.as_ref() {
            if !file.is_evicted() {
                return Ok(file.clone());
            }
        }
        let fresh = self.cache.grab(&self.name, self.file_len)?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Streams a range from the blob store into the cache channel, reporting
/// progress after every chunk so concurrent readers can consume the prefix.
struct BlobFetchWriter {
    source: BlobSource,
    /// Start of the declared write range within the logical file.
    logical_start: u64,
    stats: Arc<ReadStats>,
}

#[async_trait]
impl RangeWriter for BlobFetchWriter {
    async fn fill(
        &self,
        channel: &CacheChannel,
        permit: &FetchPermit,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
        progress: &ProgressUpdater,
    ) -> CacheResult<()> {
        let started = Instant::now();
        let mut stream = self
            .source
            .open(self.logical_start + relative_pos, length)
            .await?;
        let mut chunk = vec![0u8; COPY_BUFFER_SIZE.min(length as usize)];
        let mut copied = 0u64;
        while copied < length {
            let want = chunk.len().min((length - copied) as usize);
            let n = stream.read(&mut chunk[..want]).await?;
            channel.write_at(permit, channel_pos + copied, &chunk[..n])?;
            copied += n as u64;
            progress.update(copied);
        }
        self.stats.add_cached_bytes_written(copied, started.elapsed());
        Ok(())
    }
}

/// Re-serializes a header cache blob into the cache channel with positional
/// writes; the read half of the backfill is a no-op.
struct HeaderCopyWriter {
    header: CachedHeader,
    stats: Arc<ReadStats>,
}

#[async_trait]
impl RangeWriter for HeaderCopyWriter {
    async fn fill(
        &self,
        channel: &CacheChannel,
        permit: &FetchPermit,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
        progress: &ProgressUpdater,
    ) -> CacheResult<()> {
        let started = Instant::now();
        let start = relative_pos as usize;
        let data = &self.header.bytes[start..start + length as usize];
        let mut copied = 0u64;
        for chunk in data.chunks(COPY_BUFFER_SIZE) {
            channel.write_at(permit, channel_pos + copied, chunk)?;
            copied += chunk.len() as u64;
            progress.update(copied);
        }
        self.stats.add_cached_bytes_written(copied, started.elapsed());
        Ok(())
    }
}
