//! Blob store access: the container contract and the multi-part source.

pub mod container;
pub mod localfs;
pub mod source;

pub use container::{BlobContainer, BlobRead, MemoryBlobContainer};
pub use localfs::LocalFsContainer;
pub use source::{BlobSource, BlobStream};
