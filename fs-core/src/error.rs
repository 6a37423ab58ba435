//! Error types for BlockVFS

use std::io;
use thiserror::Error;

use crate::block_ranges::AllocError;
use crate::blockdev::BlockDeviceError;
use crate::format::FormatError;
use crate::layout::CodecError;

/// Filesystem error type
#[derive(Debug, Error)]
pub enum Error {
    /// Name is empty, too long, or contains a reserved character
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// A sibling already uses the name
    #[error("Name already exists: {0}")]
    NameCollision(String),

    /// Path does not resolve
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation needs a regular file
    #[error("Not a file: {0}")]
    NotAFile(String),

    /// Operation needs a directory
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Dereference bound exceeded, or a link would close a cycle
    #[error("Too many symbolic links: {0}")]
    TooManySymbolicLinks(String),

    /// Non-recursive delete of a directory with children
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Wrong current password
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Block allocation failure (out of space, double free)
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),

    /// Metablock encoding or decoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Structural damage found while loading the image
    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    /// Backing file inaccessible
    #[error("I/O failure: {0}")]
    Io(#[from] BlockDeviceError),
}

impl Error {
    /// True for allocator exhaustion
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Error::Alloc(AllocError::OutOfSpace { .. }))
    }

    /// True when a metablock failed to decode
    pub fn is_corrupt_metablock(&self) -> bool {
        matches!(self, Error::Codec(CodecError::CorruptMetablock(_)))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(BlockDeviceError::Io(err))
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Io(e) if e.kind() != io::ErrorKind::UnexpectedEof => Error::from(e),
            other => Error::CorruptImage(other.to_string()),
        }
    }
}

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, Error>;
