//! Snapshot file model: part arithmetic and byte-range math.

pub mod info;
pub mod range;

pub use info::{FileInfo, FOOTER_LEN};
pub use range::{ByteRange, RangeSet};
