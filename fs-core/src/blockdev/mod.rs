//! Block device I/O operations for BlockVFS

mod blockdev_trait;

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Re-export the block device trait and related types
pub use self::blockdev_trait::{Block, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

#[derive(Debug)]
struct DeviceState {
    file: File,
    block_count: u32,
}

/// A block device backed by a regular file.
///
/// The first `base` bytes of the file (the image header) are not part of
/// the block space; logical block 0 starts right after them.
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    state: Mutex<DeviceState>,
    path: PathBuf,
    base: u64,
}

impl FileBackedBlockDevice {
    /// Create a new, empty file-backed block device, truncating any existing file
    pub fn create(path: impl AsRef<Path>, base: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(base)?;

        Ok(Self {
            state: Mutex::new(DeviceState {
                file,
                block_count: 0,
            }),
            path,
            base,
        })
    }

    /// Open an existing file-backed block device
    pub fn open(path: impl AsRef<Path>, base: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let len = file.metadata()?.len();
        let block_bytes = len.saturating_sub(base);
        let block_count = u32::try_from(block_bytes / BLOCK_SIZE as u64)
            .map_err(|_| BlockDeviceError::InvalidBlockNumber(block_bytes / BLOCK_SIZE as u64))?;

        Ok(Self {
            state: Mutex::new(DeviceState { file, block_count }),
            path,
            base,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read raw bytes outside the block space (the image header)
    pub fn read_header(&self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(0))?;
        read_exact_at(&mut state.file, 0, buf)
    }

    /// Write raw bytes outside the block space (the image header)
    pub fn write_header(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.base {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(data)?;
        state.file.flush()?;
        Ok(())
    }
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(BlockDeviceError::ShortRead {
            offset,
            wanted: buf.len(),
        }),
        Err(e) => Err(e.into()),
    }
}

impl BlockDevice for FileBackedBlockDevice {
    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        let block = Block::at_index(self.base, index, buf.len())?;
        let mut state = self.state.lock();

        if index >= state.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(u64::from(index)));
        }

        state.file.seek(SeekFrom::Start(block.offset()))?;
        read_exact_at(&mut state.file, block.offset(), buf)
    }

    fn write_block(&self, index: u32, data: &[u8]) -> Result<()> {
        let block = Block::at_index(self.base, index, data.len())?;
        let mut state = self.state.lock();

        state.file.seek(SeekFrom::Start(block.offset()))?;
        state.file.write_all(data)?;

        // Keep the file a whole number of blocks long
        if index >= state.block_count {
            let aligned_end = self.base + (u64::from(index) + 1) * BLOCK_SIZE as u64;
            if aligned_end > block.end() {
                state.file.set_len(aligned_end)?;
            }
            state.block_count = index + 1;
            log::debug!("BLOCKDEV: extended {} to {} blocks", self.path.display(), index + 1);
        }

        state.file.flush()?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.state.lock().block_count
    }

    fn grow(&self, additional: u32) -> Result<u32> {
        let mut state = self.state.lock();
        let first = state.block_count;
        let new_count = first
            .checked_add(additional)
            .ok_or(BlockDeviceError::InvalidBlockNumber(u64::from(first) + u64::from(additional)))?;

        state
            .file
            .set_len(self.base + u64::from(new_count) * BLOCK_SIZE as u64)?;
        state.block_count = new_count;

        log::info!(
            "BLOCKDEV: grew {} by {} blocks to {}",
            self.path.display(),
            additional,
            new_count
        );
        Ok(first)
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.img");

        let device = FileBackedBlockDevice::create(&file_path, 0).unwrap();
        assert_eq!(device.block_count(), 0);

        // Writing past the end grows the device one block at a time
        let test_data = [0xAAu8; BLOCK_SIZE];
        device.write_block(0, &test_data).unwrap();
        assert_eq!(device.block_count(), 1);

        let mut read_buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut read_buf).unwrap();
        assert_eq!(test_data, read_buf);

        for i in 1..8u32 {
            let data = [i as u8; BLOCK_SIZE];
            device.write_block(i, &data).unwrap();

            let mut read_data = [0u8; BLOCK_SIZE];
            device.read_block(i, &mut read_data).unwrap();
            assert_eq!(data, read_data);
        }
        assert_eq!(device.block_count(), 8);
    }

    #[test]
    fn test_partial_block_keeps_file_aligned() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("partial.img");

        let device = FileBackedBlockDevice::create(&file_path, 512).unwrap();
        device.write_block(0, b"hi").unwrap();

        let len = std::fs::metadata(&file_path).unwrap().len();
        assert_eq!(len, 512 + BLOCK_SIZE as u64);

        let mut buf = [0u8; 2];
        device.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_read_past_end_fails() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("short.img");

        let device = FileBackedBlockDevice::create(&file_path, 0).unwrap();
        let mut buf = [0u8; 16];
        let result = device.read_block(3, &mut buf);
        assert!(matches!(result, Err(BlockDeviceError::InvalidBlockNumber(3))));
    }

    #[test]
    fn test_oversized_write_rejected() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("oversized.img");

        let device = FileBackedBlockDevice::create(&file_path, 0).unwrap();
        let result = device.write_block(0, &[0u8; BLOCK_SIZE + 1]);
        assert!(matches!(result, Err(BlockDeviceError::InvalidBlockSize(_))));
    }

    #[test]
    fn test_grow_and_reopen() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("grow.img");

        let device = FileBackedBlockDevice::create(&file_path, 0).unwrap();
        assert_eq!(device.grow(4).unwrap(), 0);
        assert_eq!(device.block_count(), 4);

        // Grown blocks read back as zeroes
        let mut buf = [0xFFu8; BLOCK_SIZE];
        device.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        device.write_block(1, &[0x55u8; BLOCK_SIZE]).unwrap();
        drop(device);

        let reopened = FileBackedBlockDevice::open(&file_path, 0).unwrap();
        assert_eq!(reopened.block_count(), 4);

        let mut read_buf = [0u8; BLOCK_SIZE];
        reopened.read_block(1, &mut read_buf).unwrap();
        assert_eq!(read_buf, [0x55u8; BLOCK_SIZE]);
    }
}
