//! Rebuild the directory tree from an existing image
//!
//! Loading walks the image breadth first from the root metablock at block 0.
//! Only reachable blocks count as occupied; everything else becomes free
//! space, which reclaims blocks left behind by an interrupted operation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::block_ranges::BlockRangeAllocator;
use crate::blockdev::BLOCK_SIZE;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::layout::{IndexChainBlock, Metablock};
use crate::node::{Node, NodeId, NodeKind, NodeType, PasswordHash, Timestamps};
use crate::tree::NodeTree;

/// Metablock index of the root directory
pub const ROOT_BLOCK: u32 = 0;

/// Tree and free space recovered from an image
pub(crate) struct LoadedImage {
    pub tree: NodeTree,
    pub allocator: BlockRangeAllocator,
}

struct Loader<'a> {
    cache: &'a BlockCache,
    total: u32,
    occupied: Vec<u32>,
    by_block: HashMap<u32, NodeId>,
    links: Vec<(NodeId, u32)>,
}

fn corrupt(block: u32, what: impl std::fmt::Display) -> Error {
    Error::CorruptImage(format!("block {}: {}", block, what))
}

pub(crate) fn load_image(cache: &BlockCache, max_symlink_hops: usize) -> Result<LoadedImage> {
    let total = cache.block_count();
    let mut loader = Loader {
        cache,
        total,
        occupied: Vec::new(),
        by_block: HashMap::new(),
        links: Vec::new(),
    };

    let root_mb = loader.decode(ROOT_BLOCK)?;
    if root_mb.node_type != NodeType::Directory {
        return Err(corrupt(
            ROOT_BLOCK,
            format!("root is a {}, not a directory", root_mb.node_type),
        ));
    }
    loader.check_references(ROOT_BLOCK, &root_mb)?;
    if root_mb.parent != ROOT_BLOCK {
        log::warn!(
            "LOADER: root metablock names parent {}, expected itself",
            root_mb.parent
        );
    }
    let (root_children, root_chain) = loader.read_index_list(ROOT_BLOCK, &root_mb)?;
    loader.occupied.push(ROOT_BLOCK);
    loader.occupied.extend_from_slice(&root_chain);

    let chain_indices = root_children[root_mb.inline_indices.len()..].to_vec();
    let root = restore(
        root_mb,
        NodeKind::empty_directory(),
        ROOT_BLOCK,
        root_chain,
        chain_indices,
    );
    let mut tree = NodeTree::new(root, max_symlink_hops);
    loader.by_block.insert(ROOT_BLOCK, tree.root());

    let mut queue = VecDeque::new();
    queue.push_back((tree.root(), ROOT_BLOCK, root_children));
    while let Some((dir, dir_block, children)) = queue.pop_front() {
        for child_block in children {
            if let Some(grandchildren) = loader.load_child(&mut tree, dir, dir_block, child_block)? {
                queue.push_back(grandchildren);
            }
        }
    }

    for (link, target_block) in std::mem::take(&mut loader.links) {
        let target = loader.by_block.get(&target_block).copied();
        if target.is_none() {
            log::warn!(
                "LOADER: link {} points at unreachable block {}, loading it dangling",
                tree.path_of(link),
                target_block
            );
        }
        let node = tree.node_mut(link)?;
        if let NodeKind::SymbolicLink { target: slot } = &mut node.kind {
            *slot = target;
        }
        node.dirty = target.is_none();
    }

    let allocator = BlockRangeAllocator::rebuild_from_occupied(loader.occupied, total)
        .map_err(|e| Error::CorruptImage(format!("overlapping block ownership: {}", e)))?;

    log::info!(
        "LOADER: loaded {} nodes, {} of {} blocks in use",
        tree.len(),
        allocator.used_blocks(),
        total
    );
    Ok(LoadedImage { tree, allocator })
}

impl<'a> Loader<'a> {
    fn decode(&self, block: u32) -> Result<Metablock> {
        if block >= self.total {
            return Err(corrupt(
                block,
                format!("outside the image of {} blocks", self.total),
            ));
        }
        let bytes = self.cache.read_full(block)?;
        Metablock::decode(&bytes).map_err(|e| corrupt(block, e))
    }

    fn check_references(&self, block: u32, mb: &Metablock) -> Result<()> {
        if mb.parent >= self.total {
            return Err(corrupt(block, format!("parent index {} out of range", mb.parent)));
        }
        if let Some(target) = mb.link_target {
            if target >= self.total {
                return Err(corrupt(block, format!("link target {} out of range", target)));
            }
        }
        Ok(())
    }

    /// Collect the inline indices and follow the overflow chain
    fn read_index_list(&self, block: u32, mb: &Metablock) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut indices = mb.inline_indices.clone();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = mb.next_overflow;

        while let Some(overflow) = next {
            if overflow >= self.total || !seen.insert(overflow) {
                return Err(corrupt(
                    block,
                    format!("overflow chain is broken at {}", overflow),
                ));
            }
            let bytes = self.cache.read_full(overflow)?;
            let link = IndexChainBlock::decode(&bytes).map_err(|e| corrupt(overflow, e))?;
            indices.extend_from_slice(&link.indices);
            chain.push(overflow);
            next = link.next;
        }

        if let Some(&bad) = indices.iter().find(|&&i| i >= self.total) {
            return Err(corrupt(block, format!("lists index {} out of range", bad)));
        }
        Ok((indices, chain))
    }

    /// Load one listed child; returns the child's own listing for directories
    fn load_child(
        &mut self,
        tree: &mut NodeTree,
        dir: NodeId,
        dir_block: u32,
        child_block: u32,
    ) -> Result<Option<(NodeId, u32, Vec<u32>)>> {
        let mb = self.decode(child_block)?;
        self.check_references(child_block, &mb)?;

        if mb.parent != dir_block {
            // Left behind by an interrupted move; the new parent owns it
            log::warn!(
                "LOADER: {} lists block {} whose parent is {}, skipping",
                tree.path_of(dir),
                child_block,
                mb.parent
            );
            tree.node_mut(dir)?.dirty = true;
            return Ok(None);
        }
        if self.by_block.contains_key(&child_block) {
            return Err(corrupt(child_block, "listed by more than one directory"));
        }

        let (indices, chain) = self.read_index_list(child_block, &mb)?;
        self.occupied.push(child_block);
        self.occupied.extend_from_slice(&chain);
        let chain_indices = indices[mb.inline_indices.len()..].to_vec();

        let node_type = mb.node_type;
        let link_target = mb.link_target;
        let (kind, listing) = match node_type {
            NodeType::File => {
                let size = u64::from(mb.size);
                let expected = (size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE;
                if indices.len() != expected {
                    return Err(corrupt(
                        child_block,
                        format!(
                            "file of {} bytes lists {} data blocks",
                            size,
                            indices.len()
                        ),
                    ));
                }
                self.occupied.extend_from_slice(&indices);
                (NodeKind::File { blocks: indices, size }, None)
            }
            NodeType::Directory => (NodeKind::empty_directory(), Some(indices)),
            NodeType::SymbolicLink => (NodeKind::SymbolicLink { target: None }, None),
        };

        let id = tree.insert_detached(restore(mb, kind, child_block, chain, chain_indices));
        tree.attach(dir, id).map_err(|e| corrupt(child_block, e))?;
        self.by_block.insert(child_block, id);

        if node_type == NodeType::SymbolicLink {
            match link_target {
                Some(target) => self.links.push((id, target)),
                None => log::debug!("LOADER: {} is a dangling link", tree.path_of(id)),
            }
        }
        Ok(listing.map(|children| (id, child_block, children)))
    }
}

fn restore(
    mb: Metablock,
    kind: NodeKind,
    block: u32,
    chain: Vec<u32>,
    chain_indices: Vec<u32>,
) -> Node {
    let times = Timestamps {
        created_ms: mb.created_ms,
        accessed_ms: mb.accessed_ms,
        modified_ms: mb.modified_ms,
    };
    Node::restore(
        mb.name,
        kind,
        mb.password_hash.map(PasswordHash::from_bytes),
        times,
        block,
        chain,
        chain_indices,
    )
}
