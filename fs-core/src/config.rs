//! Filesystem configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tree::DEFAULT_MAX_SYMLINK_HOPS;

/// Tunables for a [`VirtualFilesystem`](crate::vfs::VirtualFilesystem)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Blocks held by the LRU block cache
    pub cache_capacity: usize,
    /// Symbolic link dereferences allowed per path resolution
    pub max_symlink_hops: usize,
    /// Minimum number of blocks appended when the image grows
    pub growth_blocks: u32,
    /// Largest image size in blocks; `None` grows without bound
    pub max_blocks: Option<u32>,
    /// Flush the backing file after every mutating operation
    pub sync_on_write: bool,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
            max_symlink_hops: DEFAULT_MAX_SYMLINK_HOPS,
            growth_blocks: 1,
            max_blocks: None,
            sync_on_write: false,
        }
    }
}

impl VfsConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the filesystem cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(Error::InvalidArgument(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.growth_blocks == 0 {
            return Err(Error::InvalidArgument(
                "growth_blocks must be at least 1".to_string(),
            ));
        }
        if self.max_blocks == Some(0) {
            return Err(Error::InvalidArgument(
                "max_blocks must leave room for the root".to_string(),
            ));
        }
        Ok(())
    }
}
