//! Logical snapshot file descriptor and part arithmetic.
//!
//! A logical file is stored in the blob store as `number_of_parts` blobs of
//! `part_size` bytes each (the last one may be shorter). Helpers here map
//! logical offsets to `(part index, offset in part)` pairs.

use crate::error::{CacheError, CacheResult};

/// Length of the codec footer that terminates every snapshot file.
pub const FOOTER_LEN: usize = 16;

/// Footer marker word, written big-endian ahead of the checksum.
const FOOTER_MAGIC: u32 = 0xC028_93E8;

/// Immutable descriptor of a logical snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    name: String,
    length: u64,
    part_size: u64,
    checksum: Option<String>,
}

impl FileInfo {
    /// `part_size` must be non-zero; `checksum`, when present, is the base-36
    /// digest string recorded in the snapshot metadata.
    pub fn new(
        name: impl Into<String>,
        length: u64,
        part_size: u64,
        checksum: Option<String>,
    ) -> CacheResult<Self> {
        if part_size == 0 {
            return Err(CacheError::InvalidArgument("part size must be non-zero".into()));
        }
        Ok(Self {
            name: name.into(),
            length,
            part_size,
            checksum,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn number_of_parts(&self) -> u64 {
        if self.length == 0 {
            1
        } else {
            self.length.div_ceil(self.part_size)
        }
    }

    /// Blob name of part `i`. Single-part files keep the physical name.
    pub fn part_name(&self, part: u64) -> String {
        if self.number_of_parts() == 1 {
            self.name.clone()
        } else {
            format!("{}.part{}", self.name, part)
        }
    }

    /// Byte length of part `i`; all parts but possibly the last have
    /// `part_size` bytes and the per-part lengths sum to `length`.
    pub fn part_bytes(&self, part: u64) -> u64 {
        debug_assert!(part < self.number_of_parts());
        let start = part * self.part_size;
        (self.length - start).min(self.part_size)
    }

    /// Part containing the byte at `position`.
    pub fn part_index(&self, position: u64) -> CacheResult<u64> {
        self.ensure_valid_position(position)?;
        Ok(position / self.part_size)
    }

    /// Position of the byte at `position` relative to the start of its part.
    pub fn offset_in_part(&self, position: u64) -> CacheResult<u64> {
        self.ensure_valid_position(position)?;
        Ok(position % self.part_size)
    }

    fn ensure_valid_position(&self, position: u64) -> CacheResult<()> {
        if position >= self.length {
            return Err(CacheError::InvalidArgument(format!(
                "position [{position}] is invalid for a file of length [{}]",
                self.length
            )));
        }
        Ok(())
    }

    /// Synthesize the trailing 16-byte footer from the recorded checksum, or
    /// `None` when no checksum is present or it does not parse.
    pub fn footer_from_checksum(&self) -> Option<[u8; FOOTER_LEN]> {
        let digest = self.checksum.as_deref()?;
        let value = i64::from_str_radix(digest, 36).ok()?;
        let mut footer = [0u8; FOOTER_LEN];
        footer[0..4].copy_from_slice(&FOOTER_MAGIC.to_be_bytes());
        // bytes 4..8 stay zero: the algorithm id
        footer[8..16].copy_from_slice(&value.to_be_bytes());
        Some(footer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(length: u64, part_size: u64) -> FileInfo {
        FileInfo::new("_0.cfs", length, part_size, None).unwrap()
    }

    #[test]
    fn test_single_part_mapping() {
        let fi = info(1000, 4096);
        assert_eq!(fi.number_of_parts(), 1);
        assert_eq!(fi.part_name(0), "_0.cfs");
        assert_eq!(fi.part_bytes(0), 1000);
        assert_eq!(fi.part_index(999).unwrap(), 0);
        assert_eq!(fi.offset_in_part(999).unwrap(), 999);
    }

    #[test]
    fn test_multi_part_mapping() {
        let fi = info(1_048_576, 524_288);
        assert_eq!(fi.number_of_parts(), 2);
        assert_eq!(fi.part_name(0), "_0.cfs.part0");
        assert_eq!(fi.part_name(1), "_0.cfs.part1");
        assert_eq!(fi.part_bytes(0), 524_288);
        assert_eq!(fi.part_bytes(1), 524_288);
        assert_eq!(fi.part_index(524_287).unwrap(), 0);
        assert_eq!(fi.part_index(524_288).unwrap(), 1);
        assert_eq!(fi.offset_in_part(524_288).unwrap(), 0);
    }

    #[test]
    fn test_last_part_may_be_short() {
        let fi = info(1_000_000, 524_288);
        assert_eq!(fi.number_of_parts(), 2);
        assert_eq!(fi.part_bytes(0) + fi.part_bytes(1), 1_000_000);
        assert_eq!(fi.part_bytes(1), 1_000_000 - 524_288);
    }

    #[test]
    fn test_invalid_position_rejected() {
        let fi = info(100, 4096);
        assert!(fi.part_index(100).is_err());
        assert!(fi.offset_in_part(200).is_err());
    }

    #[test]
    fn test_footer_from_valid_checksum() {
        let fi = FileInfo::new("_0.cfs", 1024, 4096, Some("1a2b3c4d".into())).unwrap();
        let footer = fi.footer_from_checksum().unwrap();
        assert_eq!(&footer[0..4], &FOOTER_MAGIC.to_be_bytes());
        assert_eq!(&footer[4..8], &[0, 0, 0, 0]);
        let expected = i64::from_str_radix("1a2b3c4d", 36).unwrap();
        assert_eq!(footer[8..16], expected.to_be_bytes());
    }

    #[test]
    fn test_footer_skipped_for_bad_checksum() {
        let fi = FileInfo::new("_0.cfs", 1024, 4096, Some("not a digest!".into())).unwrap();
        assert!(fi.footer_from_checksum().is_none());
        let fi = FileInfo::new("_0.cfs", 1024, 4096, None).unwrap();
        assert!(fi.footer_from_checksum().is_none());
    }
}
