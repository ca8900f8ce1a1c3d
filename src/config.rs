//! Cache configuration: range sizes, header blob size, cache directory.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the byte-range cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the shared cache files. When `None`, a `frostcache`
    /// subdirectory of the system cache directory is used.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Range granularity for cache fills once recovery has completed.
    #[serde(default = "default_range_size")]
    pub default_range_size: u64,

    /// Smaller range granularity used while a directory is still recovering,
    /// to avoid over-fetching data that may never be read again.
    #[serde(default = "default_recovery_range_size")]
    pub recovery_range_size: u64,

    /// Size of the header blobs stored in the key-value header cache. Files
    /// up to twice this size are cached in full.
    #[serde(default = "default_header_blob_size")]
    pub header_blob_size: u64,
}

fn default_range_size() -> u64 {
    32 * 1024 * 1024
}

fn default_recovery_range_size() -> u64 {
    128 * 1024
}

fn default_header_blob_size() -> u64 {
    4 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_range_size: default_range_size(),
            recovery_range_size: default_recovery_range_size(),
            header_blob_size: default_header_blob_size(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: CacheConfig =
            serde_yaml::from_str(&content).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.default_range_size == 0 || self.recovery_range_size == 0 {
            return Err(CacheError::Config("range sizes must be non-zero".into()));
        }
        if self.header_blob_size == 0 {
            return Err(CacheError::Config("header blob size must be non-zero".into()));
        }
        Ok(())
    }

    /// Resolve the cache directory, falling back to the system cache dir.
    pub fn resolve_cache_dir(&self) -> CacheResult<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|d| d.join("frostcache"))
                .ok_or_else(|| CacheError::Config("no system cache directory".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert!(config.default_range_size > config.recovery_range_size);
    }

    #[test]
    fn test_from_file_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yml");
        std::fs::write(&path, "default_range_size: 32768\n").unwrap();

        let config = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config.default_range_size, 32768);
        assert_eq!(config.recovery_range_size, default_recovery_range_size());
        assert_eq!(config.header_blob_size, default_header_blob_size());
    }

    #[test]
    fn test_resolve_explicit_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(config.resolve_cache_dir().unwrap(), dir.path());
    }

    #[test]
    fn test_zero_range_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yml");
        std::fs::write(&path, "default_range_size: 0\n").unwrap();
        assert!(CacheConfig::from_file(&path).is_err());
    }
}
