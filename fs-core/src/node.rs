//! Directory tree nodes

use chrono::{DateTime, TimeZone, Utc};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Length of a password digest in bytes
pub const PASSWORD_HASH_LEN: usize = 32;

/// Kind of a node, with its on-disk tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    /// Regular file
    File = 1,
    /// Directory
    Directory = 2,
    /// Symbolic link
    SymbolicLink = 3,
}

impl NodeType {
    /// Parse the on-disk tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::File),
            2 => Some(Self::Directory),
            3 => Some(Self::SymbolicLink),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::File => write!(f, "file"),
            NodeType::Directory => write!(f, "directory"),
            NodeType::SymbolicLink => write!(f, "symlink"),
        }
    }
}

/// Stable identity of a node in the tree arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn new(slot: usize) -> Self {
        Self(slot)
    }

    /// Arena slot of the node
    pub fn index(&self) -> usize {
        self.0
    }
}

/// SHA-256 digest of a node password
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash([u8; PASSWORD_HASH_LEN]);

impl PasswordHash {
    /// Hash a password
    pub fn of(password: &str) -> Self {
        let d = digest(&SHA256, password.as_bytes());
        let mut bytes = [0u8; PASSWORD_HASH_LEN];
        bytes.copy_from_slice(d.as_ref());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; PASSWORD_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PASSWORD_HASH_LEN] {
        &self.0
    }

    /// Compare `candidate`'s digest against this one in constant time
    #[allow(deprecated)]
    pub fn verify(&self, candidate: &str) -> bool {
        let other = Self::of(candidate);
        ring::constant_time::verify_slices_are_equal(&self.0, &other.0).is_ok()
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

/// Current time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a millisecond timestamp for display
pub fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Creation, access and modification times of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_ms: i64,
    pub accessed_ms: i64,
    pub modified_ms: i64,
}

impl Timestamps {
    /// All three stamps set to now
    pub fn now() -> Self {
        let now = now_ms();
        Self {
            created_ms: now,
            accessed_ms: now,
            modified_ms: now,
        }
    }

    /// Record an access at `at_ms`; never moves backwards or before creation
    pub fn record_access(&mut self, at_ms: i64) {
        self.accessed_ms = at_ms.max(self.accessed_ms).max(self.created_ms);
    }

    /// Stamp the modification time; never moves backwards or before creation
    pub fn touch_modified(&mut self) {
        self.modified_ms = now_ms().max(self.modified_ms).max(self.created_ms);
    }
}

/// Kind-specific part of a node
#[derive(Debug, Clone)]
pub enum NodeKind {
    File {
        /// Data blocks in file order
        blocks: Vec<u32>,
        /// Size in bytes
        size: u64,
    },
    Directory {
        children: BTreeMap<String, NodeId>,
    },
    SymbolicLink {
        /// Non-owning reference; `None` once the target was deleted
        target: Option<NodeId>,
    },
}

impl NodeKind {
    pub fn empty_file() -> Self {
        NodeKind::File {
            blocks: Vec::new(),
            size: 0,
        }
    }

    pub fn empty_directory() -> Self {
        NodeKind::Directory {
            children: BTreeMap::new(),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::File { .. } => NodeType::File,
            NodeKind::Directory { .. } => NodeType::Directory,
            NodeKind::SymbolicLink { .. } => NodeType::SymbolicLink,
        }
    }
}

/// One entry of the directory tree
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: NodeKind,
    pub(crate) password: Option<PasswordHash>,
    pub(crate) times: Timestamps,
    /// Block holding the persisted metadata, `None` until persisted
    pub(crate) metablock: Option<u32>,
    /// Overflow blocks of the index list
    pub(crate) chain: Vec<u32>,
    /// Indices those overflow blocks hold
    pub(crate) chain_indices: Vec<u32>,
    /// In-memory metadata differs from the metablock
    pub(crate) dirty: bool,
}

impl Node {
    /// Build a fully initialized node stamped with the current time
    pub fn new(name: &str, parent: Option<NodeId>, kind: NodeKind, password: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            parent,
            kind,
            password: password.map(PasswordHash::of),
            times: Timestamps::now(),
            metablock: None,
            chain: Vec::new(),
            chain_indices: Vec::new(),
            dirty: true,
        }
    }

    /// Rebuild a node from persisted state
    pub(crate) fn restore(
        name: String,
        kind: NodeKind,
        password: Option<PasswordHash>,
        times: Timestamps,
        metablock: u32,
        chain: Vec<u32>,
        chain_indices: Vec<u32>,
    ) -> Self {
        Self {
            name,
            parent: None,
            kind,
            password,
            times,
            metablock: Some(metablock),
            chain,
            chain_indices,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn times(&self) -> &Timestamps {
        &self.times
    }

    pub fn metablock(&self) -> Option<u32> {
        self.metablock
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn password_hash(&self) -> Option<&PasswordHash> {
        self.password.as_ref()
    }

    /// A node without a password accepts any candidate, including none
    pub fn check_password(&self, candidate: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(hash) => candidate.map_or(false, |c| hash.verify(c)),
        }
    }

    /// Every block this node holds: metablock, overflow chain, file data
    pub fn held_blocks(&self) -> Vec<u32> {
        let mut blocks: Vec<u32> = self.metablock.into_iter().collect();
        blocks.extend_from_slice(&self.chain);
        if let NodeKind::File { blocks: data, .. } = &self.kind {
            blocks.extend_from_slice(data);
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_is_sha256() {
        let hash = PasswordHash::of("secret");
        // sha256("secret")
        assert_eq!(hash.as_bytes()[..4], [0x2b, 0xb8, 0x0d, 0x53]);
        assert!(hash.verify("secret"));
        assert!(!hash.verify("wrong"));
        assert!(!hash.verify(""));
    }

    #[test]
    fn test_check_password() {
        let open = Node::new("a", None, NodeKind::empty_file(), None);
        assert!(open.check_password(None));
        assert!(open.check_password(Some("anything")));

        let locked = Node::new("b", None, NodeKind::empty_file(), Some("secret"));
        assert!(locked.check_password(Some("secret")));
        assert!(!locked.check_password(Some("wrong")));
        assert!(!locked.check_password(None));
    }

    #[test]
    fn test_new_node_is_fully_initialized() {
        let node = Node::new("docs", None, NodeKind::empty_directory(), None);
        let t = node.times();
        assert_eq!(t.created_ms, t.accessed_ms);
        assert_eq!(t.created_ms, t.modified_ms);
        assert!(node.is_directory());
        assert!(node.is_dirty());
        assert_eq!(node.metablock(), None);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut t = Timestamps {
            created_ms: i64::MAX - 10,
            accessed_ms: i64::MAX - 10,
            modified_ms: i64::MAX - 5,
        };
        t.record_access(0);
        t.touch_modified();
        assert_eq!(t.accessed_ms, i64::MAX - 10);
        assert_eq!(t.modified_ms, i64::MAX - 5);
    }

    #[test]
    fn test_node_type_tags() {
        for ty in [NodeType::File, NodeType::Directory, NodeType::SymbolicLink] {
            assert_eq!(NodeType::from_u8(ty as u8), Some(ty));
        }
        assert_eq!(NodeType::from_u8(0), None);
        assert_eq!(NodeType::from_u8(4), None);
    }

    #[test]
    fn test_held_blocks() {
        let mut node = Node::new(
            "f",
            None,
            NodeKind::File {
                blocks: vec![4, 5],
                size: 600,
            },
            None,
        );
        node.metablock = Some(2);
        node.chain = vec![9];
        assert_eq!(node.held_blocks(), vec![2, 9, 4, 5]);
    }
}
