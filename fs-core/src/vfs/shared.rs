//! Thread-safe handle around a [`VirtualFilesystem`]

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::Path;
use std::sync::Arc;

use super::{DirEntry, NodeMetadata, VirtualFilesystem};
use crate::config::VfsConfig;
use crate::error::Result;

/// Cloneable handle that serializes mutations and lets reads run together
#[derive(Clone)]
pub struct SharedFilesystem {
    inner: Arc<RwLock<VirtualFilesystem>>,
}

impl SharedFilesystem {
    pub fn new(fs: VirtualFilesystem) -> Self {
        Self {
            inner: Arc::new(RwLock::new(fs)),
        }
    }

    /// Open an image and wrap it
    pub fn open(path: impl AsRef<Path>, config: VfsConfig) -> Result<Self> {
        Ok(Self::new(VirtualFilesystem::open_with_config(path, config)?))
    }

    /// Shared access for queries
    pub fn read(&self) -> RwLockReadGuard<'_, VirtualFilesystem> {
        self.inner.read()
    }

    /// Exclusive access for mutations
    pub fn write(&self) -> RwLockWriteGuard<'_, VirtualFilesystem> {
        self.inner.write()
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read().read_file(path)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.inner.write().write_file(path, data)
    }

    pub fn metadata(&self, path: &str) -> Result<NodeMetadata> {
        self.inner.read().metadata(path)
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.read().list_directory(path)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.write().sync()
    }
}

impl std::fmt::Debug for SharedFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFilesystem")
            .field("inner", &*self.inner.read())
            .finish()
    }
}
