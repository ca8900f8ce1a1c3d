//! Local filesystem backend used to mock a blob store.

use crate::blob::container::{BlobContainer, BlobRead};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Blob container backed by a local directory, one file per part.
#[derive(Clone)]
pub struct LocalFsContainer {
    root: PathBuf,
}

impl LocalFsContainer {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write a blob under `name`, creating parent directories as needed.
    pub async fn write_blob(&self, name: &str, data: &[u8]) -> CacheResult<()> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut f = fs::File::create(path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl BlobContainer for LocalFsContainer {
    async fn read_blob(&self, name: &str, offset: u64, length: u64) -> CacheResult<BlobRead> {
        let path = self.path_for(name);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::BlobNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(length)))
    }
}
