//! Block device trait definitions for BlockVFS

use std::io;
use thiserror::Error;

/// Block size in bytes
pub const BLOCK_SIZE: usize = 512;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Invalid block size: {0} (at most {BLOCK_SIZE})")]
    InvalidBlockSize(usize),
    #[error("Short read at offset {offset}: wanted {wanted} bytes")]
    ShortRead { offset: u64, wanted: usize },
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// A window of at most [`BLOCK_SIZE`] bytes into the backing file.
///
/// Blocks are never stored; one is built for every read or write and only
/// its effect on the file outlives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    offset: u64,
    size: usize,
}

impl Block {
    /// Build the block addressing `size` bytes of logical block `index`,
    /// where logical block 0 starts at byte `base`.
    pub fn at_index(base: u64, index: u32, size: usize) -> Result<Self> {
        if size > BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(size));
        }
        Ok(Self {
            offset: base + u64::from(index) * BLOCK_SIZE as u64,
            size,
        })
    }

    /// Byte position of the block in the backing file
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of significant bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// First byte past the significant part of the block
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Trait for block device operations
pub trait BlockDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes (at most one block) from the start of block `index`
    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `data` (at most one block) at the start of block `index`,
    /// extending the device when the block lies past its end
    fn write_block(&self, index: u32, data: &[u8]) -> Result<()>;

    /// Get the total number of blocks in the device
    fn block_count(&self) -> u32;

    /// Append `additional` zeroed blocks, returning the index of the first one
    fn grow(&self, additional: u32) -> Result<u32>;

    /// Sync any pending writes to the device
    fn sync(&self) -> Result<()>;
}
