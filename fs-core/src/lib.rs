//! BlockVFS Core - a block-based virtual filesystem stored in a single image file
//!
//! This crate provides the storage engine behind BlockVFS: a fixed-size block
//! layer over the image file, a free-range block allocator, the metablock
//! codec, the in-memory directory tree, and the path-based filesystem façade
//! that ties them together.
//!
//! ```no_run
//! use blockvfs::VirtualFilesystem;
//!
//! # fn main() -> blockvfs::Result<()> {
//! let mut fs = VirtualFilesystem::open("disk.vfs")?;
//! fs.create_directory("/docs", None)?;
//! fs.create_file("/docs/readme.txt", None)?;
//! fs.write_file("/docs/readme.txt", b"hi")?;
//! assert_eq!(fs.read_file("/docs/readme.txt")?, b"hi");
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod block_ranges;
pub mod blockdev;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod layout;
pub mod node;
pub mod tree;
pub mod vfs;

// Re-export the types most callers need
pub use config::VfsConfig;
pub use error::{Error, Result};
pub use node::{NodeId, NodeType};
pub use vfs::{DirEntry, FsUsage, NodeMetadata, SharedFilesystem, VirtualFilesystem};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, BLOCK_SIZE};
    pub use crate::config::VfsConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{NodeId, NodeType};
    pub use crate::vfs::{DirEntry, NodeMetadata, SharedFilesystem, VirtualFilesystem};
}
