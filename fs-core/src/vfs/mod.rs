//! Path-based filesystem façade
//!
//! `VirtualFilesystem` ties the block cache, the range allocator and the node
//! tree together. Every mutation follows the same order: allocate and write
//! new blocks, write the metablock that commits them, then release whatever
//! the old metablock referenced. A failure before the commit leaves the
//! previous state intact; unreferenced blocks are reclaimed on the next load.

mod loader;
mod shared;

pub use self::loader::ROOT_BLOCK;
pub use self::shared::SharedFilesystem;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::block_ranges::{AllocError, BlockIndexRange, BlockRangeAllocator};
use crate::blockdev::{BlockDevice, FileBackedBlockDevice, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::config::VfsConfig;
use crate::error::{Error, Result};
use crate::format::{Superblock, HEADER_SIZE};
use crate::layout::{overflow_blocks_needed, IndexChainBlock, Metablock, OVERFLOW_CAPACITY};
use crate::node::{now_ms, to_datetime, Node, NodeId, NodeKind, NodeType, PasswordHash, Timestamps};
use crate::tree::NodeTree;

/// Metadata of one node, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub name: String,
    /// Absolute path
    pub path: String,
    pub node_type: NodeType,
    /// Bytes of a file, aggregate of a directory, target size of a link
    pub size: u64,
    pub created_ms: i64,
    pub accessed_ms: i64,
    pub modified_ms: i64,
    pub has_password: bool,
    pub metablock: Option<u32>,
}

impl NodeMetadata {
    pub fn created(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.created_ms)
    }

    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.accessed_ms)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.modified_ms)
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
}

/// Space accounting of the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    pub block_size: usize,
    pub total_blocks: u32,
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub free_ranges: Vec<BlockIndexRange>,
    pub node_count: usize,
}

/// A block-based filesystem stored in a single image file
pub struct VirtualFilesystem {
    device: Arc<FileBackedBlockDevice>,
    cache: BlockCache,
    allocator: BlockRangeAllocator,
    tree: NodeTree,
    superblock: Superblock,
    config: VfsConfig,
    /// Access stamps taken by `read_file`, folded into the tree on the next mutation
    pending_access: Mutex<HashMap<NodeId, i64>>,
}

impl VirtualFilesystem {
    /// Open an image with the default configuration, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, VfsConfig::default())
    }

    /// Open an image, creating it if missing or empty
    pub fn open_with_config(path: impl AsRef<Path>, config: VfsConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let existing_len = match std::fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match existing_len {
            None | Some(0) => Self::format(path, config),
            Some(len) => Self::load(path, len, config),
        }
    }

    fn format(path: &Path, config: VfsConfig) -> Result<Self> {
        log::info!("VFS: initializing new image at {}", path.display());

        let superblock = Superblock::new()?;
        let device = Arc::new(FileBackedBlockDevice::create(path, HEADER_SIZE)?);
        device.write_header(&superblock.to_bytes()?)?;
        device.grow(1)?;

        let cache = BlockCache::new(device.clone(), config.cache_capacity);
        let mut allocator = BlockRangeAllocator::new(cache.block_count());
        let root_block = allocator.allocate(1)?;

        let mut root = Node::new("/", None, NodeKind::empty_directory(), None);
        root.metablock = root_block.first().copied();
        let tree = NodeTree::new(root, config.max_symlink_hops);

        let mut fs = Self {
            device,
            cache,
            allocator,
            tree,
            superblock,
            config,
            pending_access: Mutex::new(HashMap::new()),
        };
        let root = fs.tree.root();
        fs.persist(root)?;
        fs.cache.sync()?;
        Ok(fs)
    }

    fn load(path: &Path, len: u64, config: VfsConfig) -> Result<Self> {
        let block_bytes = len.saturating_sub(HEADER_SIZE);
        if len < HEADER_SIZE + BLOCK_SIZE as u64 || block_bytes % BLOCK_SIZE as u64 != 0 {
            return Err(Error::CorruptImage(format!(
                "image length {} is not a header plus whole blocks",
                len
            )));
        }

        let device = Arc::new(FileBackedBlockDevice::open(path, HEADER_SIZE)?);
        let mut header = vec![0u8; HEADER_SIZE as usize];
        device.read_header(&mut header)?;
        let superblock = Superblock::read_from(&mut &header[..])?;

        let cache = BlockCache::new(device.clone(), config.cache_capacity);
        let loaded = loader::load_image(&cache, config.max_symlink_hops)?;
        log::info!(
            "VFS: opened {} ({} blocks, {} free)",
            path.display(),
            loaded.allocator.total_blocks(),
            loaded.allocator.free_blocks()
        );

        Ok(Self {
            device,
            cache,
            allocator: loaded.allocator,
            tree: loaded.tree,
            superblock,
            config,
            pending_access: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the backing image
    pub fn image_path(&self) -> &Path {
        self.device.path()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// The in-memory directory tree
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// Look up a node by id
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.tree.node(id)
    }

    /// Resolve a path, following every symbolic link
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        self.tree.resolve(path)
    }

    /// Resolve a path without following a final symbolic link
    pub fn resolve_no_follow(&self, path: &str) -> Result<NodeId> {
        self.tree.resolve_no_follow(path)
    }

    /// True when `path` resolves to a live node
    pub fn exists(&self, path: &str) -> bool {
        self.tree.resolve(path).is_ok()
    }

    /// Absolute path of whatever `path` resolves to
    pub fn canonical_path(&self, path: &str) -> Result<String> {
        Ok(self.tree.path_of(self.tree.resolve(path)?))
    }

    // ---- creation ----

    /// Create an empty file
    pub fn create_file(&mut self, path: &str, password: Option<&str>) -> Result<NodeId> {
        self.create_node(path, NodeKind::empty_file(), password)
    }

    /// Create an empty directory
    pub fn create_directory(&mut self, path: &str, password: Option<&str>) -> Result<NodeId> {
        self.create_node(path, NodeKind::empty_directory(), password)
    }

    /// Create a symbolic link at `path` pointing at the node named by `target`.
    ///
    /// A link to a link is allowed; a target chain that already loops is rejected.
    pub fn create_symbolic_link(&mut self, path: &str, target: &str) -> Result<NodeId> {
        let target_id = self.tree.resolve_no_follow(target)?;
        self.tree.check_link_target(target_id)?;
        self.create_node(
            path,
            NodeKind::SymbolicLink {
                target: Some(target_id),
            },
            None,
        )
    }

    fn create_node(&mut self, path: &str, kind: NodeKind, password: Option<&str>) -> Result<NodeId> {
        self.settle_access();
        let (parent, name) = self.tree.resolve_parent(path)?;
        let parent_times = *self.tree.node(parent)?.times();
        let parent_dirty = self.tree.node(parent)?.is_dirty();

        let node_type = kind.node_type();
        let id = self.tree.create_child(parent, name, kind, password)?;

        if let Err(e) = self.commit_new_node(id, parent) {
            log::warn!("VFS: rolling back creation of {}: {}", path, e);
            self.discard_new_node(id);
            if let Some(dir) = self.tree.get_mut(parent) {
                dir.times = parent_times;
                dir.dirty = parent_dirty;
            }
            return Err(e);
        }

        log::debug!("VFS: created {} {}", node_type, self.tree.path_of(id));
        self.after_mutation()?;
        Ok(id)
    }

    fn commit_new_node(&mut self, id: NodeId, parent: NodeId) -> Result<()> {
        let block = self.allocate(1)?;
        self.tree.node_mut(id)?.metablock = block.first().copied();
        self.persist(id)?;
        // Listing the child in its parent is the commit point
        self.persist(parent)
    }

    fn discard_new_node(&mut self, id: NodeId) {
        let _ = self.tree.detach(id);
        if let Some(node) = self.tree.remove_detached(id) {
            self.release_quietly(&node.held_blocks());
        }
    }

    // ---- content ----

    /// Read a whole file
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let id = self.tree.resolve(path)?;
        let node = self.tree.node(id)?;
        let NodeKind::File { blocks, size } = &node.kind else {
            return Err(Error::NotAFile(path.to_string()));
        };

        let mut remaining = *size as usize;
        let mut data = Vec::with_capacity(remaining);
        for &block in blocks {
            let take = remaining.min(BLOCK_SIZE);
            data.extend_from_slice(&self.cache.read(block, take)?);
            remaining -= take;
        }

        self.pending_access.lock().insert(id, now_ms());
        Ok(data)
    }

    /// Replace a file's content
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.settle_access();
        let id = self.tree.resolve(path)?;
        if !matches!(self.tree.node(id)?.kind, NodeKind::File { .. }) {
            return Err(Error::NotAFile(path.to_string()));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(Error::InvalidArgument(format!(
                "{} bytes exceed the largest storable file",
                data.len()
            )));
        }

        let count = (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let blocks = self.allocate(count)?;
        if let Err(e) = self.write_data(&blocks, data) {
            self.release_quietly(&blocks);
            return Err(e);
        }

        let node = self.tree.node_mut(id)?;
        let previous_times = node.times;
        let previous = std::mem::replace(
            &mut node.kind,
            NodeKind::File {
                blocks: blocks.clone(),
                size: data.len() as u64,
            },
        );
        node.times.touch_modified();
        node.dirty = true;

        if let Err(e) = self.persist(id) {
            let node = self.tree.node_mut(id)?;
            node.kind = previous;
            node.times = previous_times;
            self.release_quietly(&blocks);
            return Err(e);
        }

        if let NodeKind::File { blocks: old, .. } = previous {
            self.allocator.release(&old)?;
        }
        log::debug!(
            "VFS: wrote {} bytes to {} in {} blocks",
            data.len(),
            path,
            count
        );
        self.after_mutation()
    }

    fn write_data(&self, blocks: &[u32], data: &[u8]) -> Result<()> {
        for (&block, chunk) in blocks.iter().zip(data.chunks(BLOCK_SIZE)) {
            let mut buf = [0u8; BLOCK_SIZE];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.cache.write(block, &buf)?;
        }
        Ok(())
    }

    /// Copy a host file into the image, creating the target file if needed
    pub fn import_file(&mut self, native_path: impl AsRef<Path>, path: &str) -> Result<()> {
        let data = std::fs::read(native_path.as_ref())?;
        match self.tree.resolve(path) {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                self.create_file(path, None)?;
            }
            Err(e) => return Err(e),
        }
        self.write_file(path, &data)
    }

    /// Copy a file out of the image to the host
    pub fn export_file(&self, path: &str, native_path: impl AsRef<Path>) -> Result<()> {
        let data = self.read_file(path)?;
        std::fs::write(native_path.as_ref(), data)?;
        Ok(())
    }

    // ---- structure ----

    /// Delete a node. A directory with children needs `recursive`.
    pub fn delete(&mut self, path: &str, recursive: bool) -> Result<()> {
        self.settle_access();
        let id = self.tree.resolve_no_follow(path)?;
        let node = self.tree.node(id)?;
        let parent = node
            .parent()
            .ok_or_else(|| Error::InvalidArgument("the root cannot be deleted".to_string()))?;
        if let NodeKind::Directory { children } = &node.kind {
            if !recursive && !children.is_empty() {
                return Err(Error::DirectoryNotEmpty(path.to_string()));
            }
        }

        let parent_times = *self.tree.node(parent)?.times();
        self.tree.detach(id)?;
        let dir = self.tree.node_mut(parent)?;
        dir.times.touch_modified();
        dir.dirty = true;

        if let Err(e) = self.persist(parent) {
            self.tree.attach(parent, id)?;
            self.tree.node_mut(parent)?.times = parent_times;
            return Err(e);
        }

        let removed = self.tree.remove_subtree(id)?;
        self.allocator.release(&removed.held_blocks())?;
        log::debug!(
            "VFS: deleted {} ({} nodes)",
            path,
            removed.nodes.len()
        );

        for link in removed.dangling_links {
            self.persist_committed(link);
        }
        self.after_mutation()
    }

    /// Rename or move a node
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.settle_access();
        let id = self.tree.resolve_no_follow(old_path)?;
        let old_parent = self
            .tree
            .node(id)?
            .parent()
            .ok_or_else(|| Error::InvalidArgument("the root cannot be renamed".to_string()))?;
        let old_name = self.tree.node(id)?.name().to_string();
        let (new_parent, new_name) = self.tree.resolve_parent(new_path)?;
        let saved = self.save_times(&[id, old_parent, new_parent]);

        if new_parent == old_parent {
            self.tree.rename(id, new_name)?;
            // The node's metablock carries the name and commits the rename
            if let Err(e) = self.persist(id) {
                self.tree.rename(id, &old_name)?;
                self.restore_times(&saved);
                return Err(e);
            }
            self.persist_committed(old_parent);
        } else {
            self.tree.move_node(id, new_parent, new_name)?;
            // The new listing is ignored on load until the node names its new parent
            let committed = self
                .persist(new_parent)
                .and_then(|()| self.persist(id));
            if let Err(e) = committed {
                log::warn!("VFS: rolling back move of {}: {}", old_path, e);
                self.tree.move_node(id, old_parent, &old_name)?;
                self.restore_times(&saved);
                // Its listing may already name the node; the next sync rewrites it
                if let Some(dir) = self.tree.get_mut(new_parent) {
                    dir.dirty = true;
                }
                return Err(e);
            }
            self.persist_committed(old_parent);
        }

        log::debug!("VFS: renamed {} to {}", old_path, self.tree.path_of(id));
        self.after_mutation()
    }

    fn save_times(&self, ids: &[NodeId]) -> Vec<(NodeId, Timestamps, bool)> {
        ids.iter()
            .filter_map(|&id| self.tree.get(id).map(|node| (id, node.times, node.dirty)))
            .collect()
    }

    fn restore_times(&mut self, saved: &[(NodeId, Timestamps, bool)]) {
        for &(id, times, dirty) in saved {
            if let Some(node) = self.tree.get_mut(id) {
                node.times = times;
                node.dirty = dirty;
            }
        }
    }

    // ---- passwords ----

    /// Check `candidate` against the password of the node at `path`
    pub fn check_password(&self, path: &str, candidate: Option<&str>) -> Result<bool> {
        let id = self.tree.resolve(path)?;
        self.tree.check_password(id, candidate)
    }

    /// Change or remove a node's password
    pub fn set_password(
        &mut self,
        path: &str,
        current: Option<&str>,
        new_password: Option<&str>,
    ) -> Result<()> {
        self.settle_access();
        let id = self.tree.resolve(path)?;
        if !self.tree.check_password(id, current)? {
            return Err(Error::PermissionDenied(path.to_string()));
        }

        let node = self.tree.node_mut(id)?;
        let previous = std::mem::replace(&mut node.password, new_password.map(PasswordHash::of));
        let previous_times = node.times;
        node.times.touch_modified();
        node.dirty = true;

        if let Err(e) = self.persist(id) {
            let node = self.tree.node_mut(id)?;
            node.password = previous;
            node.times = previous_times;
            return Err(e);
        }
        log::debug!("VFS: password of {} updated", path);
        self.after_mutation()
    }

    // ---- metadata ----

    fn metadata_of(&self, id: NodeId) -> Result<NodeMetadata> {
        let node = self.tree.node(id)?;
        let times = self.effective_times(id, node);
        Ok(NodeMetadata {
            name: node.name().to_string(),
            path: self.tree.path_of(id),
            node_type: node.node_type(),
            size: self.tree.node_size(id)?,
            created_ms: times.created_ms,
            accessed_ms: times.accessed_ms,
            modified_ms: times.modified_ms,
            has_password: node.has_password(),
            metablock: node.metablock(),
        })
    }

    fn effective_times(&self, id: NodeId, node: &Node) -> Timestamps {
        let mut times = node.times;
        if let Some(&at) = self.pending_access.lock().get(&id) {
            times.record_access(at);
        }
        times
    }

    /// Metadata of the node `path` resolves to
    pub fn metadata(&self, path: &str) -> Result<NodeMetadata> {
        self.metadata_of(self.tree.resolve(path)?)
    }

    /// Metadata of the node at `path` itself, not following a final link
    pub fn link_metadata(&self, path: &str) -> Result<NodeMetadata> {
        self.metadata_of(self.tree.resolve_no_follow(path)?)
    }

    pub fn node_size(&self, path: &str) -> Result<u64> {
        self.tree.node_size(self.tree.resolve(path)?)
    }

    pub fn creation_time(&self, path: &str) -> Result<i64> {
        Ok(self.metadata(path)?.created_ms)
    }

    pub fn last_access_time(&self, path: &str) -> Result<i64> {
        Ok(self.metadata(path)?.accessed_ms)
    }

    pub fn last_modification_time(&self, path: &str) -> Result<i64> {
        Ok(self.metadata(path)?.modified_ms)
    }

    /// Entries of a directory sorted by name
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.tree.resolve(path)?;
        self.tree
            .children(dir)?
            .into_iter()
            .map(|(name, id)| {
                Ok(DirEntry {
                    name,
                    node_type: self.tree.node_type(id)?,
                    size: self.tree.node_size(id)?,
                })
            })
            .collect()
    }

    /// Absolute path of a link's target, `None` when it dangles
    pub fn read_link(&self, path: &str) -> Result<Option<String>> {
        let id = self.tree.resolve_no_follow(path)?;
        match &self.tree.node(id)?.kind {
            NodeKind::SymbolicLink { target } => Ok(target.map(|t| self.tree.path_of(t))),
            _ => Err(Error::InvalidArgument(format!("{} is not a symbolic link", path))),
        }
    }

    /// Block and node accounting
    pub fn usage(&self) -> FsUsage {
        FsUsage {
            block_size: BLOCK_SIZE,
            total_blocks: self.allocator.total_blocks(),
            free_blocks: self.allocator.free_blocks(),
            used_blocks: self.allocator.used_blocks(),
            free_ranges: self.allocator.free_ranges().collect(),
            node_count: self.tree.len(),
        }
    }

    /// True when block `index` is in the free set
    pub fn is_block_free(&self, index: u32) -> bool {
        self.allocator.is_free(index)
    }

    // ---- persistence ----

    /// Write every dirty metablock and flush the image
    pub fn sync(&mut self) -> Result<()> {
        self.settle_access();
        let dirty: Vec<NodeId> = self
            .tree
            .iter()
            .filter(|(_, node)| node.is_dirty())
            .map(|(id, _)| id)
            .collect();
        for id in &dirty {
            self.persist(*id)?;
        }
        self.cache.sync()?;
        log::debug!("VFS: synced {} dirty nodes", dirty.len());
        Ok(())
    }

    /// Sync and release the image
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        log::info!("VFS: closed {}", self.image_path().display());
        Ok(())
    }

    fn after_mutation(&mut self) -> Result<()> {
        if self.config.sync_on_write {
            self.cache.sync()?;
        }
        Ok(())
    }

    /// Fold access stamps recorded by reads into the tree
    fn settle_access(&mut self) {
        for (id, at) in self.pending_access.get_mut().drain() {
            if let Some(node) = self.tree.get_mut(id) {
                node.times.record_access(at);
                node.dirty = true;
            }
        }
    }

    /// Metablock index of a node that must already be persisted
    fn metablock_of(&self, id: NodeId) -> Result<u32> {
        self.tree.node(id)?.metablock().ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no metablock", self.tree.path_of(id)))
        })
    }

    /// Metablock fields of a node and its full index list
    fn encode_node(&self, id: NodeId) -> Result<(u32, Metablock, Vec<u32>)> {
        let node = self.tree.node(id)?;
        let index = self.metablock_of(id)?;
        let parent = match node.parent() {
            Some(parent) => self.metablock_of(parent)?,
            None => index,
        };

        let (indices, link_target) = match &node.kind {
            NodeKind::File { blocks, .. } => (blocks.clone(), None),
            NodeKind::Directory { children } => (
                children
                    .values()
                    .map(|&child| self.metablock_of(child))
                    .collect::<Result<Vec<_>>>()?,
                None,
            ),
            NodeKind::SymbolicLink { target } => (
                Vec::new(),
                target
                    .and_then(|t| self.tree.get(t))
                    .and_then(|t| t.metablock()),
            ),
        };

        let metablock = Metablock {
            node_type: node.node_type(),
            parent,
            name: node.name().to_string(),
            size: u32::try_from(self.tree.node_size(id)?).unwrap_or(u32::MAX),
            password_hash: node.password_hash().map(|h| *h.as_bytes()),
            created_ms: node.times.created_ms,
            accessed_ms: node.times.accessed_ms,
            modified_ms: node.times.modified_ms,
            link_target,
            inline_indices: Vec::new(),
            next_overflow: None,
        };
        Ok((index, metablock, indices))
    }

    /// Write a node's metablock. An index list whose overflow changed goes to a
    /// fresh chain first; the old chain is released after the metablock.
    fn persist(&mut self, id: NodeId) -> Result<()> {
        let (index, mut metablock, indices) = self.encode_node(id)?;
        let capacity = metablock.inline_capacity();
        let inline = capacity.min(indices.len());
        let (head, tail) = indices.split_at(inline);
        metablock.inline_indices = head.to_vec();

        let node = self.tree.node(id)?;
        if node.chain_indices == tail {
            metablock.next_overflow = node.chain.first().copied();
            self.cache.write(index, &metablock.encode()?)?;
            self.tree.node_mut(id)?.dirty = false;
            log::debug!(
                "VFS: persisted {} at block {} (chain unchanged)",
                self.tree.path_of(id),
                index
            );
            return Ok(());
        }

        let chain = self.allocate(overflow_blocks_needed(indices.len(), capacity))?;
        metablock.next_overflow = chain.first().copied();

        let written = self.write_chain(&chain, tail).and_then(|()| {
            let bytes = metablock.encode()?;
            self.cache.write(index, &bytes)?;
            Ok(())
        });
        if let Err(e) = written {
            self.release_quietly(&chain);
            return Err(e);
        }

        let node = self.tree.node_mut(id)?;
        let old_chain = std::mem::replace(&mut node.chain, chain);
        node.chain_indices = tail.to_vec();
        node.dirty = false;
        self.allocator.release(&old_chain)?;

        log::debug!(
            "VFS: persisted {} at block {} ({} indices)",
            self.tree.path_of(id),
            index,
            indices.len()
        );
        Ok(())
    }

    /// Persist a node after its operation already committed; a failure
    /// leaves it dirty for the next `sync`
    fn persist_committed(&mut self, id: NodeId) {
        if let Err(e) = self.persist(id) {
            log::error!(
                "VFS: deferring {} to the next sync: {}",
                self.tree.path_of(id),
                e
            );
            if let Some(node) = self.tree.get_mut(id) {
                node.dirty = true;
            }
        }
    }

    fn write_chain(&self, chain: &[u32], indices: &[u32]) -> Result<()> {
        for (i, (&block, chunk)) in chain
            .iter()
            .zip(indices.chunks(OVERFLOW_CAPACITY))
            .enumerate()
        {
            let link = IndexChainBlock {
                indices: chunk.to_vec(),
                next: chain.get(i + 1).copied(),
            };
            self.cache.write(block, &link.encode()?)?;
        }
        Ok(())
    }

    /// Allocate `count` blocks, growing the image once when space runs out
    fn allocate(&mut self, count: usize) -> Result<Vec<u32>> {
        let count = u32::try_from(count).map_err(|_| AllocError::OutOfSpace {
            requested: count as u64,
            available: self.allocator.free_blocks(),
        })?;

        match self.allocator.allocate(count) {
            Err(AllocError::OutOfSpace {
                requested,
                available,
            }) => {
                let shortfall = u32::try_from(requested.saturating_sub(available)).unwrap_or(u32::MAX);
                let mut additional = shortfall.max(self.config.growth_blocks);
                if let Some(max) = self.config.max_blocks {
                    let room = max.saturating_sub(self.allocator.total_blocks());
                    if room < shortfall {
                        log::warn!(
                            "VFS: {} more blocks would exceed the {} block limit",
                            shortfall,
                            max
                        );
                        return Err(AllocError::OutOfSpace {
                            requested,
                            available,
                        }
                        .into());
                    }
                    additional = additional.min(room);
                }
                self.grow(additional)?;
                Ok(self.allocator.allocate(count)?)
            }
            other => Ok(other?),
        }
    }

    fn grow(&mut self, additional: u32) -> Result<()> {
        let total = self.allocator.total_blocks();
        if total.checked_add(additional).is_none() {
            return Err(AllocError::OutOfSpace {
                requested: u64::from(additional),
                available: self.allocator.free_blocks(),
            }
            .into());
        }
        let first = self.cache.grow(additional)?;
        if first != total {
            return Err(Error::CorruptImage(format!(
                "device holds {} blocks, allocator tracks {}",
                first, total
            )));
        }
        self.allocator.grow(additional)?;
        Ok(())
    }

    fn release_quietly(&mut self, blocks: &[u32]) {
        if let Err(e) = self.allocator.release(blocks) {
            log::error!("VFS: failed to release {} blocks: {}", blocks.len(), e);
        }
    }
}

impl std::fmt::Debug for VirtualFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFilesystem")
            .field("image", &self.image_path())
            .field("total_blocks", &self.allocator.total_blocks())
            .field("free_blocks", &self.allocator.free_blocks())
            .field("nodes", &self.tree.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, VirtualFilesystem) {
        let dir = tempdir().unwrap();
        let fs = VirtualFilesystem::open(dir.path().join("image.vfs")).unwrap();
        (dir, fs)
    }

    #[test]
    fn test_fresh_image_has_root_only() {
        let (dir, fs) = fresh();
        let usage = fs.usage();
        assert_eq!(usage.total_blocks, 1);
        assert_eq!(usage.free_blocks, 0);
        assert_eq!(usage.node_count, 1);
        assert_eq!(fs.node(fs.tree().root()).unwrap().metablock(), Some(ROOT_BLOCK));

        let len = std::fs::metadata(dir.path().join("image.vfs")).unwrap().len();
        assert_eq!(len, HEADER_SIZE + BLOCK_SIZE as u64);
    }

    #[test]
    fn test_create_grows_image() {
        let (_dir, mut fs) = fresh();
        fs.create_directory("/docs", None).unwrap();
        fs.create_file("/docs/a", None).unwrap();
        assert_eq!(fs.usage().total_blocks, 3);
        assert_eq!(fs.usage().free_blocks, 0);
    }

    #[test]
    fn test_growth_blocks_reserves_space() {
        let dir = tempdir().unwrap();
        let config = VfsConfig {
            growth_blocks: 16,
            ..VfsConfig::default()
        };
        let mut fs = VirtualFilesystem::open_with_config(dir.path().join("img"), config).unwrap();
        fs.create_file("/a", None).unwrap();
        assert_eq!(fs.usage().total_blocks, 17);
        assert_eq!(fs.usage().free_blocks, 15);
    }

    #[test]
    fn test_write_replaces_blocks() {
        let (_dir, mut fs) = fresh();
        fs.create_file("/f", None).unwrap();
        fs.write_file("/f", &[7u8; 1500]).unwrap();
        let id = fs.resolve("/f").unwrap();
        let old = fs.node(id).unwrap().held_blocks();
        assert_eq!(old.len(), 4);

        fs.write_file("/f", b"short").unwrap();
        assert_eq!(fs.read_file("/f").unwrap(), b"short");
        // Three data blocks went back to the free set
        assert_eq!(fs.usage().free_blocks, 3);
        assert_eq!(fs.node_size("/f").unwrap(), 5);
    }

    #[test]
    fn test_empty_write() {
        let (_dir, mut fs) = fresh();
        fs.create_file("/f", None).unwrap();
        fs.write_file("/f", b"abc").unwrap();
        fs.write_file("/f", b"").unwrap();
        assert!(fs.read_file("/f").unwrap().is_empty());
    }

    #[test]
    fn test_read_directory_is_not_a_file() {
        let (_dir, mut fs) = fresh();
        fs.create_directory("/d", None).unwrap();
        assert!(matches!(fs.read_file("/d"), Err(Error::NotAFile(_))));
        assert!(matches!(fs.write_file("/d", b"x"), Err(Error::NotAFile(_))));
        assert!(matches!(fs.read_file("/nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_stamps_access_time() {
        let (_dir, mut fs) = fresh();
        fs.create_file("/f", None).unwrap();
        let before = fs.last_access_time("/f").unwrap();
        fs.read_file("/f").unwrap();
        assert!(fs.last_access_time("/f").unwrap() >= before);

        fs.sync().unwrap();
        let id = fs.resolve("/f").unwrap();
        assert!(!fs.node(id).unwrap().is_dirty());
    }

    #[test]
    fn test_non_recursive_delete() {
        let (_dir, mut fs) = fresh();
        fs.create_directory("/d", None).unwrap();
        fs.create_file("/d/f", None).unwrap();
        assert!(matches!(
            fs.delete("/d", false),
            Err(Error::DirectoryNotEmpty(_))
        ));
        fs.delete("/d/f", false).unwrap();
        fs.delete("/d", false).unwrap();
        assert!(!fs.exists("/d"));
        assert!(matches!(fs.delete("/", true), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_large_directory_uses_overflow_chain() {
        let (_dir, mut fs) = fresh();
        fs.create_directory("/many", None).unwrap();
        for i in 0..300 {
            fs.create_file(&format!("/many/f{:03}", i), None).unwrap();
        }
        let id = fs.resolve("/many").unwrap();
        assert!(!fs.node(id).unwrap().chain.is_empty());
        assert_eq!(fs.list_directory("/many").unwrap().len(), 300);

        for i in 0..300 {
            fs.delete(&format!("/many/f{:03}", i), false).unwrap();
        }
        assert!(fs.node(id).unwrap().chain.is_empty());
    }

    #[test]
    fn test_set_password() {
        let (_dir, mut fs) = fresh();
        fs.create_file("/a", Some("old")).unwrap();
        assert!(matches!(
            fs.set_password("/a", Some("wrong"), Some("new")),
            Err(Error::PermissionDenied(_))
        ));
        fs.set_password("/a", Some("old"), Some("new")).unwrap();
        assert!(fs.check_password("/a", Some("new")).unwrap());
        assert!(!fs.check_password("/a", Some("old")).unwrap());

        fs.set_password("/a", Some("new"), None).unwrap();
        assert!(fs.check_password("/a", None).unwrap());
        assert!(!fs.metadata("/a").unwrap().has_password);
    }

    #[test]
    fn test_read_link_and_metadata() {
        let (_dir, mut fs) = fresh();
        fs.create_file("/target", None).unwrap();
        fs.write_file("/target", b"12345").unwrap();
        fs.create_symbolic_link("/l", "/target").unwrap();

        assert_eq!(fs.read_link("/l").unwrap().as_deref(), Some("/target"));
        assert_eq!(fs.metadata("/l").unwrap().node_type, NodeType::File);
        assert_eq!(fs.link_metadata("/l").unwrap().node_type, NodeType::SymbolicLink);
        assert_eq!(fs.link_metadata("/l").unwrap().size, 5);
        assert!(matches!(fs.read_link("/target"), Err(Error::InvalidArgument(_))));

        fs.delete("/target", false).unwrap();
        assert_eq!(fs.read_link("/l").unwrap(), None);
        assert!(matches!(fs.read_file("/l"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rename_and_move() {
        let (_dir, mut fs) = fresh();
        fs.create_directory("/a", None).unwrap();
        fs.create_directory("/b", None).unwrap();
        fs.create_file("/a/f", None).unwrap();
        fs.write_file("/a/f", b"data").unwrap();

        fs.rename("/a/f", "/a/g").unwrap();
        assert!(!fs.exists("/a/f"));
        fs.rename("/a/g", "/b/h").unwrap();
        assert_eq!(fs.read_file("/b/h").unwrap(), b"data");
        assert!(fs.list_directory("/a").unwrap().is_empty());

        assert!(matches!(
            fs.rename("/a", "/a/inside"),
            Err(Error::InvalidArgument(_))
        ));
        fs.create_file("/b/other", None).unwrap();
        assert!(matches!(
            fs.rename("/b/other", "/b/h"),
            Err(Error::NameCollision(_))
        ));
    }

    #[test]
    fn test_stamp_only_persist_keeps_chain() {
        let (_dir, mut fs) = fresh();
        fs.create_file("/big", None).unwrap();
        fs.write_file("/big", &vec![3u8; 70_000]).unwrap();
        let id = fs.resolve("/big").unwrap();
        let chain = fs.node(id).unwrap().chain.clone();
        assert!(!chain.is_empty());
        assert_eq!(fs.usage().free_blocks, 0);
        let total = fs.usage().total_blocks;

        fs.read_file("/big").unwrap();
        fs.sync().unwrap();
        assert_eq!(fs.node(id).unwrap().chain, chain);
        assert_eq!(fs.usage().total_blocks, total);
    }

    #[test]
    fn test_growth_stops_at_max_blocks() {
        let dir = tempdir().unwrap();
        let config = VfsConfig {
            growth_blocks: 8,
            max_blocks: Some(6),
            ..VfsConfig::default()
        };
        let mut fs = VirtualFilesystem::open_with_config(dir.path().join("img"), config).unwrap();
        fs.create_file("/a", None).unwrap();
        // Growth is clamped to the limit instead of failing
        assert_eq!(fs.usage().total_blocks, 6);

        fs.create_file("/b", None).unwrap();
        let err = fs.write_file("/b", &[1u8; 4 * BLOCK_SIZE]).unwrap_err();
        assert!(err.is_out_of_space());
        assert!(fs.read_file("/b").unwrap().is_empty());
        assert_eq!(fs.usage().total_blocks, 6);
        assert_eq!(fs.usage().free_blocks, 3);
    }

    #[test]
    fn test_debug_names_image() {
        let (dir, fs) = fresh();
        assert_eq!(fs.image_path(), dir.path().join("image.vfs"));
        assert!(format!("{:?}", fs).contains("image.vfs"));
    }

    #[test]
    fn test_canonical_path_follows_links() {
        let (_dir, mut fs) = fresh();
        fs.create_directory("/real", None).unwrap();
        fs.create_symbolic_link("/alias", "/real").unwrap();
        assert_eq!(fs.canonical_path("/alias").unwrap(), "/real");
        assert_eq!(fs.canonical_path("/alias/..").unwrap(), "/");
    }
}
