//! BlockVFS image header
//!
//! Every image starts with one header block. It carries the magic number,
//! format version and block size so that a foreign or damaged file is
//! rejected before any metablock is decoded. The header is not part of the
//! logical block space: logical block 0 starts at [`HEADER_SIZE`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

use crate::blockdev::BLOCK_SIZE;

/// Magic number for BlockVFS images
pub const BLOCKVFS_MAGIC: &[u8; 4] = b"BVFS";
/// Current image format version
pub const FORMAT_VERSION: u32 = 1;
/// Bytes reserved for the header at the start of the image
pub const HEADER_SIZE: u64 = BLOCK_SIZE as u64;

/// Error type for image header operations
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),
    #[error("Unsupported block size: {0}")]
    UnsupportedBlockSize(u32),
    #[error("Header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

/// Image header stored in front of the block space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number (BVFS)
    pub magic: [u8; 4],
    /// Image format version
    pub version: u32,
    /// Block size in bytes
    pub block_size: u32,
    /// Random identifier of the image
    pub image_id: [u8; 16],
    /// Creation time, milliseconds since the epoch
    pub created_ms: i64,
}

impl Superblock {
    /// Encoded size of the header fields, checksum included
    pub const SIZE: usize = 4 + 4 + 4 + 16 + 8 + 4;

    /// Create a header for a fresh image
    pub fn new() -> Result<Self, FormatError> {
        let mut image_id = [0u8; 16];
        getrandom::getrandom(&mut image_id)
            .map_err(|e| FormatError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        Ok(Self {
            magic: *BLOCKVFS_MAGIC,
            version: FORMAT_VERSION,
            block_size: BLOCK_SIZE as u32,
            image_id,
            created_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Write the header, padded to [`HEADER_SIZE`] bytes
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut fields = Vec::with_capacity(Self::SIZE);
        fields.write_all(&self.magic)?;
        fields.write_u32::<LittleEndian>(self.version)?;
        fields.write_u32::<LittleEndian>(self.block_size)?;
        fields.write_all(&self.image_id)?;
        fields.write_i64::<LittleEndian>(self.created_ms)?;
        let checksum = crc32fast::hash(&fields);
        fields.write_u32::<LittleEndian>(checksum)?;

        writer.write_all(&fields)?;
        writer.write_all(&vec![0u8; HEADER_SIZE as usize - fields.len()])?;
        Ok(())
    }

    /// Encode into a header-sized buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Read and validate a header
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let mut fields = [0u8; Self::SIZE];
        reader.read_exact(&mut fields)?;

        let mut cursor = Cursor::new(&fields[..]);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != BLOCKVFS_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        if block_size as usize != BLOCK_SIZE {
            return Err(FormatError::UnsupportedBlockSize(block_size));
        }

        let mut image_id = [0u8; 16];
        cursor.read_exact(&mut image_id)?;
        let created_ms = cursor.read_i64::<LittleEndian>()?;

        let stored = cursor.read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(&fields[..Self::SIZE - 4]);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch { stored, computed });
        }

        Ok(Self {
            magic,
            version,
            block_size,
            image_id,
            created_ms,
        })
    }
}
