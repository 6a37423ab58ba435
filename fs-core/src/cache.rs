//! Block cache implementation for BlockVFS
//!
//! `BlockCache` is the block store the filesystem talks to: it forwards every
//! write straight to the device and keeps the most recently used blocks in
//! memory so metadata reads do not hit the backing file.

use arrayref::array_ref;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A cached block
struct CachedBlock {
    data: Box<[u8; BLOCK_SIZE]>,
}

/// Write-through LRU cache in front of a block device
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: Mutex<LruCache<u32, CachedBlock>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a new block cache with the given capacity (in number of blocks)
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Read the first `len` bytes of block `index`
    pub fn read(&self, index: u32, len: usize) -> Result<Vec<u8>> {
        if len > BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(len));
        }

        if let Some(block) = self.cache.lock().get(&index) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.data[..len].to_vec());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut block = vec![0u8; BLOCK_SIZE];
        self.device.read_block(index, &mut block)?;

        let data = Box::new(*array_ref!(block, 0, BLOCK_SIZE));
        self.cache.lock().push(index, CachedBlock { data });

        block.truncate(len);
        Ok(block)
    }

    /// Read a whole block
    pub fn read_full(&self, index: u32) -> Result<Vec<u8>> {
        self.read(index, BLOCK_SIZE)
    }

    /// Write `data` at the start of block `index`, through to the device
    pub fn write(&self, index: u32, data: &[u8]) -> Result<()> {
        self.device.write_block(index, data)?;

        let mut cache = self.cache.lock();
        if data.len() == BLOCK_SIZE {
            let data = Box::new(*array_ref!(data, 0, BLOCK_SIZE));
            cache.push(index, CachedBlock { data });
        } else if let Some(block) = cache.get_mut(&index) {
            block.data[..data.len()].copy_from_slice(data);
        }

        Ok(())
    }

    /// Append zeroed blocks to the device, returning the first new index
    pub fn grow(&self, additional: u32) -> Result<u32> {
        self.device.grow(additional)
    }

    /// Number of blocks on the device
    pub fn block_count(&self) -> u32 {
        self.device.block_count()
    }

    /// Flush the device
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    /// Drop every cached block
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Number of blocks currently cached
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().len()
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (hits, misses) = self.stats();
        f.debug_struct("BlockCache")
            .field("cached_blocks", &self.cached_blocks())
            .field("hits", &hits)
            .field("misses", &misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    fn cache_on_temp_device(capacity: usize) -> (tempfile::TempDir, Arc<FileBackedBlockDevice>, BlockCache) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_cache.img");
        let device = Arc::new(FileBackedBlockDevice::create(&path, 0).unwrap());
        let cache = BlockCache::new(device.clone(), capacity);
        (dir, device, cache)
    }

    #[test]
    fn test_cache_read_write() {
        let (_dir, device, cache) = cache_on_temp_device(2);

        let test_data1 = [0xAA; BLOCK_SIZE];
        let test_data2 = [0x55; BLOCK_SIZE];
        cache.write(0, &test_data1).unwrap();
        cache.write(1, &test_data2).unwrap();

        assert_eq!(cache.read_full(0).unwrap(), test_data1.to_vec());
        assert_eq!(cache.read_full(1).unwrap(), test_data2.to_vec());

        // Write-through: the device already has the data
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, test_data1);
        device.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, test_data2);
    }

    #[test]
    fn test_cache_eviction_rereads_device() {
        let (_dir, _device, cache) = cache_on_temp_device(2);

        let test_data = [[0x11; BLOCK_SIZE], [0x22; BLOCK_SIZE], [0x33; BLOCK_SIZE]];
        for (i, data) in test_data.iter().enumerate() {
            cache.write(i as u32, data).unwrap();
        }
        assert_eq!(cache.cached_blocks(), 2);

        // Block 0 was evicted but is still readable from the device
        assert_eq!(cache.read_full(0).unwrap(), test_data[0].to_vec());
        let (_, misses) = cache.stats();
        assert_eq!(misses, 1);
    }

    #[test]
    fn test_partial_write_updates_cached_block() {
        let (_dir, _device, cache) = cache_on_temp_device(4);

        cache.write(0, &[0x77; BLOCK_SIZE]).unwrap();
        cache.write(0, b"abc").unwrap();

        let block = cache.read_full(0).unwrap();
        assert_eq!(&block[..3], b"abc");
        assert_eq!(block[3], 0x77);
        assert_eq!(cache.read(0, 3).unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_partial_write_to_uncached_block_is_read_back() {
        let (_dir, _device, cache) = cache_on_temp_device(4);

        cache.write(2, b"tail").unwrap();
        cache.clear();
        assert_eq!(cache.read(2, 4).unwrap(), b"tail".to_vec());
        assert_eq!(cache.block_count(), 3);
    }
}
