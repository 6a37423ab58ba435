//! In-memory directory hierarchy
//!
//! Nodes live in a flat arena addressed by [`NodeId`]. Directories own their
//! children through the arena; parent back-references and symbolic link
//! targets are plain ids and never keep a node alive.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::layout::NAME_MAX;
use crate::node::{Node, NodeId, NodeKind, NodeType};

/// Default bound on symbolic link dereferences per resolution
pub const DEFAULT_MAX_SYMLINK_HOPS: usize = 32;

/// Nodes detached by a subtree removal
#[derive(Debug)]
pub struct RemovedSubtree {
    /// Removed nodes, children before their parent
    pub nodes: Vec<Node>,
    /// Surviving links whose target was removed; now dangling
    pub dangling_links: Vec<NodeId>,
}

impl RemovedSubtree {
    /// Every block held by the removed nodes
    pub fn held_blocks(&self) -> Vec<u32> {
        self.nodes.iter().flat_map(|n| n.held_blocks()).collect()
    }
}

/// Check a node name: 1 to [`NAME_MAX`] UTF-16 units, no `/` or NUL, not `.` or `..`
pub fn validate_name(name: &str) -> Result<()> {
    let units = name.encode_utf16().count();
    if units == 0
        || units > NAME_MAX
        || name == "."
        || name == ".."
        || name.contains(['/', '\0'])
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Split a path into its parent path and final name
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    validate_name(name)?;
    Ok((parent, name))
}

/// Arena-backed directory tree
#[derive(Debug)]
pub struct NodeTree {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    root: NodeId,
    max_symlink_hops: usize,
}

impl NodeTree {
    /// Create a tree holding only `root`
    pub fn new(mut root: Node, max_symlink_hops: usize) -> Self {
        root.parent = None;
        Self {
            nodes: vec![Some(root)],
            free_slots: Vec::new(),
            root: NodeId::new(0),
            max_symlink_hops,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn max_symlink_hops(&self) -> usize {
        self.max_symlink_hops
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Live node or `NotFound`
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("node #{}", id.index())))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("node #{}", id.index())))
    }

    /// All live nodes
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.as_ref().map(|n| (NodeId::new(slot), n)))
    }

    /// Store a node without linking it into any directory
    pub(crate) fn insert_detached(&mut self, node: Node) -> NodeId {
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId::new(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId::new(self.nodes.len() - 1)
            }
        }
    }

    /// Drop a node that no directory lists
    pub(crate) fn remove_detached(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.free_slots.push(id.index());
        Some(node)
    }

    /// Register `child` under directory `parent` with its current name
    pub(crate) fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let name = self.node(child)?.name.clone();
        match &mut self.node_mut(parent)?.kind {
            NodeKind::Directory { children } => {
                if children.contains_key(&name) {
                    return Err(Error::NameCollision(name));
                }
                children.insert(name, child);
            }
            _ => return Err(Error::NotADirectory(name)),
        }
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Unregister `child` from its parent directory
    pub(crate) fn detach(&mut self, child: NodeId) -> Result<()> {
        let (name, parent) = {
            let node = self.node(child)?;
            (node.name.clone(), node.parent)
        };
        if let Some(parent) = parent {
            if let NodeKind::Directory { children } = &mut self.node_mut(parent)?.kind {
                children.remove(&name);
            }
        }
        self.node_mut(child)?.parent = None;
        Ok(())
    }

    /// Children of a directory, sorted by name
    pub fn children(&self, dir: NodeId) -> Result<Vec<(String, NodeId)>> {
        let node = self.node(dir)?;
        match &node.kind {
            NodeKind::Directory { children } => Ok(children
                .iter()
                .map(|(name, &id)| (name.clone(), id))
                .collect()),
            _ => Err(Error::NotADirectory(node.name.clone())),
        }
    }

    /// Look up a direct child by exact name
    pub fn child(&self, dir: NodeId, name: &str) -> Result<Option<NodeId>> {
        let node = self.node(dir)?;
        match &node.kind {
            NodeKind::Directory { children } => Ok(children.get(name).copied()),
            _ => Err(Error::NotADirectory(node.name.clone())),
        }
    }

    /// Create a node under `parent`, hashing `password` when given
    pub fn create_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        password: Option<&str>,
    ) -> Result<NodeId> {
        validate_name(name)?;
        if self.child(parent, name)?.is_some() {
            return Err(Error::NameCollision(name.to_string()));
        }

        let node = Node::new(name, Some(parent), kind, password);
        let id = self.insert_detached(node);
        if let Err(e) = self.attach(parent, id) {
            self.remove_detached(id);
            return Err(e);
        }

        let dir = self.node_mut(parent)?;
        dir.times.touch_modified();
        dir.dirty = true;
        Ok(id)
    }

    /// Rename a node within its directory
    pub fn rename(&mut self, id: NodeId, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let (old_name, parent) = {
            let node = self.node(id)?;
            (node.name.clone(), node.parent)
        };
        let Some(parent) = parent else {
            return Err(Error::InvalidArgument("the root cannot be renamed".to_string()));
        };
        if old_name == new_name {
            return Ok(());
        }
        if self.child(parent, new_name)?.is_some() {
            return Err(Error::NameCollision(new_name.to_string()));
        }

        self.detach(id)?;
        let node = self.node_mut(id)?;
        node.name = new_name.to_string();
        node.times.touch_modified();
        node.dirty = true;
        self.attach(parent, id)?;

        let dir = self.node_mut(parent)?;
        dir.times.touch_modified();
        dir.dirty = true;
        Ok(())
    }

    /// Move a node under `new_parent` as `new_name`
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let old_parent = self
            .node(id)?
            .parent
            .ok_or_else(|| Error::InvalidArgument("the root cannot be moved".to_string()))?;
        if old_parent == new_parent {
            return self.rename(id, new_name);
        }
        if self.is_ancestor_or_self(id, new_parent) {
            return Err(Error::InvalidArgument(format!(
                "cannot move {} into its own subtree",
                self.path_of(id)
            )));
        }
        if self.child(new_parent, new_name)?.is_some() {
            return Err(Error::NameCollision(new_name.to_string()));
        }

        self.detach(id)?;
        let node = self.node_mut(id)?;
        node.name = new_name.to_string();
        node.times.touch_modified();
        node.dirty = true;
        self.attach(new_parent, id)?;

        for dir in [old_parent, new_parent] {
            let dir = self.node_mut(dir)?;
            dir.times.touch_modified();
            dir.dirty = true;
        }
        Ok(())
    }

    /// True when `ancestor` is `id` or lies on the path from the root to `id`
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.get(c).and_then(|n| n.parent);
        }
        false
    }

    /// Ids of the subtree rooted at `id`, children before parents
    pub fn subtree_post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(Node {
                kind: NodeKind::Directory { children },
                ..
            }) = self.get(current)
            {
                stack.extend(children.values().rev().map(|&c| (c, false)));
            }
        }
        order
    }

    /// Detach `id` and remove its whole subtree from the arena.
    ///
    /// Links outside the subtree that pointed into it are left dangling and
    /// reported so their metablocks can be rewritten.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<RemovedSubtree> {
        if id == self.root {
            return Err(Error::InvalidArgument("the root cannot be deleted".to_string()));
        }
        let parent = self.node(id)?.parent;
        self.detach(id)?;
        if let Some(parent) = parent {
            let dir = self.node_mut(parent)?;
            dir.times.touch_modified();
            dir.dirty = true;
        }

        let doomed = self.subtree_post_order(id);
        let doomed_set: HashSet<NodeId> = doomed.iter().copied().collect();

        let mut dangling_links = Vec::new();
        for slot in 0..self.nodes.len() {
            let link_id = NodeId::new(slot);
            if doomed_set.contains(&link_id) {
                continue;
            }
            if let Some(Node {
                kind: NodeKind::SymbolicLink { target },
                dirty,
                ..
            }) = self.nodes[slot].as_mut()
            {
                if target.map_or(false, |t| doomed_set.contains(&t)) {
                    *target = None;
                    *dirty = true;
                    dangling_links.push(link_id);
                }
            }
        }

        let nodes = doomed
            .into_iter()
            .filter_map(|d| self.remove_detached(d))
            .collect();
        Ok(RemovedSubtree {
            nodes,
            dangling_links,
        })
    }

    /// Follow `id` through symbolic links until a non-link node
    fn dereference(&self, mut id: NodeId, hops: &mut usize, path: &str) -> Result<NodeId> {
        loop {
            match &self.node(id)?.kind {
                NodeKind::SymbolicLink { target } => {
                    *hops += 1;
                    if *hops > self.max_symlink_hops {
                        return Err(Error::TooManySymbolicLinks(path.to_string()));
                    }
                    id = target.ok_or_else(|| Error::NotFound(path.to_string()))?;
                }
                _ => return Ok(id),
            }
        }
    }

    /// Resolve a path to a node, following every symbolic link
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        self.resolve_with(path, true)
    }

    /// Resolve a path without dereferencing a link in the final segment
    pub fn resolve_no_follow(&self, path: &str) -> Result<NodeId> {
        self.resolve_with(path, false)
    }

    fn resolve_with(&self, path: &str, follow_final: bool) -> Result<NodeId> {
        let mut current = self.root;
        let mut hops = 0usize;

        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            current = self.dereference(current, &mut hops, path)?;
            let node = self.node(current)?;
            let NodeKind::Directory { children } = &node.kind else {
                return Err(Error::NotADirectory(path.to_string()));
            };

            current = if segment == ".." {
                node.parent.unwrap_or(self.root)
            } else {
                *children
                    .get(segment)
                    .ok_or_else(|| Error::NotFound(path.to_string()))?
            };
        }

        if follow_final {
            current = self.dereference(current, &mut hops, path)?;
        }
        Ok(current)
    }

    /// Resolve the directory that would hold `path`'s final segment
    pub fn resolve_parent<'p>(&self, path: &'p str) -> Result<(NodeId, &'p str)> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve(parent_path)?;
        if !self.node(parent)?.is_directory() {
            return Err(Error::NotADirectory(parent_path.to_string()));
        }
        Ok((parent, name))
    }

    /// Reject a link to `target` whose chain revisits a node
    pub fn check_link_target(&self, target: NodeId) -> Result<()> {
        let mut seen = HashSet::new();
        let mut current = Some(target);
        while let Some(id) = current {
            if !seen.insert(id) {
                return Err(Error::TooManySymbolicLinks(self.path_of(target)));
            }
            current = match &self.node(id)?.kind {
                NodeKind::SymbolicLink { target } => *target,
                _ => None,
            };
        }
        Ok(())
    }

    /// Absolute path of a node
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            match self.get(c) {
                Some(node) if node.parent.is_some() => {
                    names.push(node.name.as_str());
                    current = node.parent;
                }
                _ => break,
            }
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Size of a node: bytes of a file, sum of file sizes below a directory,
    /// size of a link's final target (0 when dangling)
    pub fn node_size(&self, id: NodeId) -> Result<u64> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::File { size, .. } => Ok(*size),
            NodeKind::Directory { .. } => Ok(self
                .subtree_post_order(id)
                .into_iter()
                .filter_map(|d| match self.get(d).map(|n| &n.kind) {
                    Some(NodeKind::File { size, .. }) => Some(*size),
                    _ => None,
                })
                .sum()),
            NodeKind::SymbolicLink { .. } => {
                let mut hops = 0;
                match self.dereference(id, &mut hops, &node.name) {
                    Ok(target) => self.node_size(target),
                    Err(_) => Ok(0),
                }
            }
        }
    }

    /// Check `candidate` against a node's password
    pub fn check_password(&self, id: NodeId, candidate: Option<&str>) -> Result<bool> {
        Ok(self.node(id)?.check_password(candidate))
    }

    /// Type of a node
    pub fn node_type(&self, id: NodeId) -> Result<NodeType> {
        Ok(self.node(id)?.node_type())
    }
}
