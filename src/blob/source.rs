//! Exact-length byte streams over the parts of a logical file.
//!
//! A read of `[position, position + length)` may span several parts; the
//! stream requests only the needed suffix/prefix of the edge parts and the
//! full span of interior parts, concatenating the slices in order.

use crate::blob::container::{BlobContainer, BlobRead};
use crate::error::{CacheError, CacheResult};
use crate::snapshot::FileInfo;
use crate::stats::ReadStats;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::trace;

/// Opens [`BlobStream`]s over a logical file, charging every requested part
/// slice to the stats sink.
pub struct BlobSource {
    container: Arc<dyn BlobContainer>,
    info: Arc<FileInfo>,
    stats: Arc<ReadStats>,
}

/// One per-part slice of a logical read.
struct PartSlice {
    name: String,
    offset: u64,
    length: u64,
}

impl BlobSource {
    pub fn new(container: Arc<dyn BlobContainer>, info: Arc<FileInfo>, stats: Arc<ReadStats>) -> Self {
        Self {
            container,
            info,
            stats,
        }
    }

    /// Open a stream yielding exactly `length` bytes starting at logical
    /// `position`. Requested bytes are counted up front, one entry per part
    /// slice the stream will request.
    pub async fn open(&self, position: u64, length: u64) -> CacheResult<BlobStream> {
        if position + length > self.info.length() {
            return Err(CacheError::InvalidArgument(format!(
                "cannot read [{position}-{}] from [{}] of length [{}]",
                position + length,
                self.info.name(),
                self.info.length()
            )));
        }

        let mut slices = VecDeque::new();
        if length > 0 {
            if self.info.number_of_parts() == 1 {
                self.stats.add_blob_bytes_requested(length);
                slices.push_back(PartSlice {
                    name: self.info.part_name(0),
                    offset: position,
                    length,
                });
            } else {
                let start_part = self.info.part_index(position)?;
                let end_part = self.info.part_index(position + length - 1)?;
                for part in start_part..=end_part {
                    let start_in_part = if part == start_part {
                        self.info.offset_in_part(position)?
                    } else {
                        0
                    };
                    let end_in_part = if part == end_part {
                        self.info.offset_in_part(position + length - 1)? + 1
                    } else {
                        self.info.part_bytes(part)
                    };
                    self.stats
                        .add_blob_bytes_requested(end_in_part - start_in_part);
                    slices.push_back(PartSlice {
                        name: self.info.part_name(part),
                        offset: start_in_part,
                        length: end_in_part - start_in_part,
                    });
                }
            }
        }

        trace!(
            file = self.info.name(),
            position,
            length,
            parts = slices.len(),
            "opening blob stream"
        );

        Ok(BlobStream {
            container: Arc::clone(&self.container),
            slices,
            current: None,
            position,
            length,
            remaining: length,
        })
    }
}

/// Sequential stream over one or more part slices, enforcing the exact
/// length: running dry before `length` bytes is an error.
pub struct BlobStream {
    container: Arc<dyn BlobContainer>,
    slices: VecDeque<PartSlice>,
    current: Option<BlobRead>,
    position: u64,
    length: u64,
    remaining: u64,
}

impl BlobStream {
    /// Read some bytes into `out`. Returns a positive count until the stream
    /// is exhausted, then `Ok(0)`; an early end of the underlying blobs is
    /// reported as [`CacheError::Eof`].
    pub async fn read(&mut self, out: &mut [u8]) -> CacheResult<usize> {
        if self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                match self.slices.pop_front() {
                    Some(slice) => {
                        let stream = self
                            .container
                            .read_blob(&slice.name, slice.offset, slice.length)
                            .await?;
                        self.current = Some(stream);
                    }
                    None => return Err(self.unexpected_eof()),
                }
            }

            let want = out.len().min(self.remaining as usize);
            let stream = self.current.as_mut().expect("slice stream just installed");
            let n = stream.read(&mut out[..want]).await?;
            if n == 0 {
                // current slice exhausted, move on to the next one
                self.current = None;
                continue;
            }
            self.remaining -= n as u64;
            return Ok(n);
        }
    }

    /// Read exactly `out.len()` bytes.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> CacheResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(self.unexpected_eof());
            }
            filled += n;
        }
        Ok(())
    }

    fn unexpected_eof(&self) -> CacheError {
        CacheError::Eof(format!(
            "unexpected EOF reading [{}-{}] ([{}] bytes remaining)",
            self.position,
            self.position + self.length,
            self.remaining
        ))
    }
}
