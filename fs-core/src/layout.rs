//! On-disk layout definitions for BlockVFS
//!
//! One node per metablock, little-endian:
//!
//! | field | size |
//! |---|---|
//! | node type | 1 (1 = file, 2 = directory, 3 = symbolic link) |
//! | parent metablock index | 4 (the root points at itself) |
//! | name length | 4, in UTF-16 code units |
//! | name | 2 x length |
//! | size | 4 |
//! | password flag | 1 |
//! | password hash | 32, only when the flag is set |
//! | creation, access, modification time | 3 x 8, ms since the epoch |
//! | link flag | 1 |
//! | link target metablock index | 4, only when the flag is set |
//! | inline index count | 4 |
//! | next overflow block | 4 ([`NO_BLOCK`] when absent) |
//! | inline indices | 4 x count |
//!
//! The index list holds a directory's child metablocks or a file's data
//! blocks in order. Whatever does not fit inline continues in a chain of
//! overflow blocks: a count, up to [`OVERFLOW_CAPACITY`] indices, and the
//! next block of the chain in the last four bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

use crate::blockdev::BLOCK_SIZE;
use crate::node::{NodeType, PASSWORD_HASH_LEN};

/// Longest node name, in UTF-16 code units
pub const NAME_MAX: usize = 64;
/// Marks the end of an overflow chain
pub const NO_BLOCK: u32 = u32::MAX;
/// Indices held by one overflow block
pub const OVERFLOW_CAPACITY: usize = (BLOCK_SIZE - 8) / 4;

/// Metablock bytes before the name: type, parent and name length
const PREFIX_LEN: usize = 1 + 4 + 4;
/// Fixed bytes after the name without optional fields
const SUFFIX_LEN: usize = 4 + 1 + 3 * 8 + 1;
/// Index list header: inline count and next overflow block
const INDEX_HEADER_LEN: usize = 4 + 4;

/// Error type for metablock encoding and decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Name is {0} UTF-16 units long, limit is {NAME_MAX}")]
    NameTooLong(usize),
    #[error("Encoded metablock needs {needed} bytes, block holds {BLOCK_SIZE}")]
    EncodingOverflow { needed: usize },
    #[error("Corrupt metablock: {0}")]
    CorruptMetablock(String),
}

fn truncated(_: io::Error) -> CodecError {
    CodecError::CorruptMetablock("field runs past the end of the block".to_string())
}

fn read_flag(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<bool, CodecError> {
    match cursor.read_u8().map_err(truncated)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::CorruptMetablock(format!(
            "{} flag is {}",
            what, other
        ))),
    }
}

/// Decoded metadata of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metablock {
    pub node_type: NodeType,
    /// Metablock index of the parent directory
    pub parent: u32,
    pub name: String,
    /// File size, subtree size of a directory, or the target's size for a link
    pub size: u32,
    pub password_hash: Option<[u8; PASSWORD_HASH_LEN]>,
    pub created_ms: i64,
    pub accessed_ms: i64,
    pub modified_ms: i64,
    pub link_target: Option<u32>,
    /// First part of the index list
    pub inline_indices: Vec<u32>,
    /// First overflow block of the index list
    pub next_overflow: Option<u32>,
}

impl Metablock {
    fn name_units(&self) -> usize {
        self.name.encode_utf16().count()
    }

    /// Bytes used by everything except the index list
    pub fn header_len(&self) -> usize {
        PREFIX_LEN
            + 2 * self.name_units()
            + SUFFIX_LEN
            + self.password_hash.map_or(0, |h| h.len())
            + self.link_target.map_or(0, |_| 4)
            + INDEX_HEADER_LEN
    }

    /// Number of indices that fit inline next to this metadata
    pub fn inline_capacity(&self) -> usize {
        BLOCK_SIZE.saturating_sub(self.header_len()) / 4
    }

    /// Encode into exactly one block
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        if units.len() > NAME_MAX {
            return Err(CodecError::NameTooLong(units.len()));
        }

        let needed = self.header_len() + 4 * self.inline_indices.len();
        if needed > BLOCK_SIZE {
            return Err(CodecError::EncodingOverflow { needed });
        }

        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        self.write_fields(&mut buf, &units)
            .map_err(|_| CodecError::EncodingOverflow { needed })?;
        buf.resize(BLOCK_SIZE, 0);
        Ok(buf)
    }

    fn write_fields<W: Write>(&self, w: &mut W, units: &[u16]) -> io::Result<()> {
        w.write_u8(self.node_type as u8)?;
        w.write_u32::<LittleEndian>(self.parent)?;
        w.write_u32::<LittleEndian>(units.len() as u32)?;
        for &unit in units {
            w.write_u16::<LittleEndian>(unit)?;
        }
        w.write_u32::<LittleEndian>(self.size)?;

        match &self.password_hash {
            Some(hash) => {
                w.write_u8(1)?;
                w.write_all(hash)?;
            }
            None => w.write_u8(0)?,
        }

        w.write_i64::<LittleEndian>(self.created_ms)?;
        w.write_i64::<LittleEndian>(self.accessed_ms)?;
        w.write_i64::<LittleEndian>(self.modified_ms)?;

        match self.link_target {
            Some(target) => {
                w.write_u8(1)?;
                w.write_u32::<LittleEndian>(target)?;
            }
            None => w.write_u8(0)?,
        }

        w.write_u32::<LittleEndian>(self.inline_indices.len() as u32)?;
        w.write_u32::<LittleEndian>(self.next_overflow.unwrap_or(NO_BLOCK))?;
        for &index in &self.inline_indices {
            w.write_u32::<LittleEndian>(index)?;
        }
        Ok(())
    }

    /// Decode a metablock
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != BLOCK_SIZE {
            return Err(CodecError::CorruptMetablock(format!(
                "metablock is {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);

        let type_byte = cursor.read_u8().map_err(truncated)?;
        let node_type = NodeType::from_u8(type_byte).ok_or_else(|| {
            CodecError::CorruptMetablock(format!("unknown node type {}", type_byte))
        })?;
        let parent = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

        let name_len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if name_len == 0 || name_len > NAME_MAX {
            return Err(CodecError::CorruptMetablock(format!(
                "name length {}",
                name_len
            )));
        }
        let mut units = Vec::with_capacity(name_len);
        for _ in 0..name_len {
            units.push(cursor.read_u16::<LittleEndian>().map_err(truncated)?);
        }
        let name = String::from_utf16(&units)
            .map_err(|_| CodecError::CorruptMetablock("name is not valid UTF-16".to_string()))?;

        let size = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

        let password_hash = if read_flag(&mut cursor, "password")? {
            let mut hash = [0u8; PASSWORD_HASH_LEN];
            cursor.read_exact(&mut hash).map_err(truncated)?;
            Some(hash)
        } else {
            None
        };

        let created_ms = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
        let accessed_ms = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
        let modified_ms = cursor.read_i64::<LittleEndian>().map_err(truncated)?;

        let link_target = if read_flag(&mut cursor, "link")? {
            Some(cursor.read_u32::<LittleEndian>().map_err(truncated)?)
        } else {
            None
        };

        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let next = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let remaining = BLOCK_SIZE - cursor.position() as usize;
        if count > remaining / 4 {
            return Err(CodecError::CorruptMetablock(format!(
                "{} inline indices do not fit in {} bytes",
                count, remaining
            )));
        }
        let mut inline_indices = Vec::with_capacity(count);
        for _ in 0..count {
            inline_indices.push(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
        }

        Ok(Self {
            node_type,
            parent,
            name,
            size,
            password_hash,
            created_ms,
            accessed_ms,
            modified_ms,
            link_target,
            inline_indices,
            next_overflow: (next != NO_BLOCK).then_some(next),
        })
    }
}

/// One block of an index list overflow chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChainBlock {
    pub indices: Vec<u32>,
    pub next: Option<u32>,
}

impl IndexChainBlock {
    /// Encode into exactly one block
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.indices.len() > OVERFLOW_CAPACITY {
            return Err(CodecError::EncodingOverflow {
                needed: 8 + 4 * self.indices.len(),
            });
        }

        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        let write = |cursor: &mut Cursor<&mut [u8]>| -> io::Result<()> {
            cursor.write_u32::<LittleEndian>(self.indices.len() as u32)?;
            for &index in &self.indices {
                cursor.write_u32::<LittleEndian>(index)?;
            }
            cursor.set_position((BLOCK_SIZE - 4) as u64);
            cursor.write_u32::<LittleEndian>(self.next.unwrap_or(NO_BLOCK))
        };
        write(&mut cursor).map_err(|_| CodecError::EncodingOverflow {
            needed: 8 + 4 * self.indices.len(),
        })?;
        Ok(buf)
    }

    /// Decode an overflow block
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != BLOCK_SIZE {
            return Err(CodecError::CorruptMetablock(format!(
                "overflow block is {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if count > OVERFLOW_CAPACITY {
            return Err(CodecError::CorruptMetablock(format!(
                "overflow block claims {} indices",
                count
            )));
        }

        let mut indices = Vec::with_capacity(count);
        for _ in 0..count {
            indices.push(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
        }

        cursor.set_position((BLOCK_SIZE - 4) as u64);
        let next = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        Ok(Self {
            indices,
            next: (next != NO_BLOCK).then_some(next),
        })
    }
}

/// Number of overflow blocks needed for `total` indices when `inline` fit in the metablock
pub fn overflow_blocks_needed(total: usize, inline: usize) -> usize {
    let rest = total.saturating_sub(inline);
    (rest + OVERFLOW_CAPACITY - 1) / OVERFLOW_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metablock {
        Metablock {
            node_type: NodeType::File,
            parent: 0,
            name: "readme.txt".to_string(),
            size: 2,
            password_hash: None,
            created_ms: 1_500_000_000_000,
            accessed_ms: 1_500_000_000_100,
            modified_ms: 1_500_000_000_050,
            link_target: None,
            inline_indices: vec![7, 3, 12],
            next_overflow: None,
        }
    }

    #[test]
    fn test_metablock_round_trip() {
        let mut mb = sample();
        mb.password_hash = Some([0xAB; PASSWORD_HASH_LEN]);
        mb.next_overflow = Some(40);

        let bytes = mb.encode().unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(Metablock::decode(&bytes).unwrap(), mb);
    }

    #[test]
    fn test_symbolic_link_round_trip() {
        let mb = Metablock {
            node_type: NodeType::SymbolicLink,
            parent: 4,
            name: "ссылка→λ".to_string(),
            link_target: Some(9),
            inline_indices: Vec::new(),
            ..sample()
        };
        let decoded = Metablock::decode(&mb.encode().unwrap()).unwrap();
        assert_eq!(decoded.link_target, Some(9));
        assert_eq!(decoded.name, "ссылка→λ");
        assert_eq!(decoded, mb);
    }

    #[test]
    fn test_layout_offsets() {
        let bytes = sample().encode().unwrap();
        // type, parent, name length, then UTF-16 name
        assert_eq!(&bytes[1..5], &0u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &10u32.to_le_bytes());
        assert_eq!(&bytes[9..11], &(b'r' as u16).to_le_bytes());
        // size follows the 20 name bytes
        assert_eq!(&bytes[29..33], &2u32.to_le_bytes());
        // no password
        assert_eq!(bytes[33], 0);
        assert_eq!(&bytes[34..42], &1_500_000_000_000i64.to_le_bytes());
    }

    #[test]
    fn test_name_too_long() {
        let mb = Metablock {
            name: "x".repeat(NAME_MAX + 1),
            ..sample()
        };
        assert_eq!(mb.encode(), Err(CodecError::NameTooLong(NAME_MAX + 1)));
    }

    #[test]
    fn test_inline_overflow() {
        let mut mb = sample();
        mb.inline_indices = (0..mb.inline_capacity() as u32).collect();
        assert!(mb.encode().is_ok());

        mb.inline_indices.push(1);
        assert!(matches!(
            mb.encode(),
            Err(CodecError::EncodingOverflow { .. })
        ));
    }

    #[test]
    fn test_unknown_node_type() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            Metablock::decode(&bytes),
            Err(CodecError::CorruptMetablock(_))
        ));
    }

    #[test]
    fn test_declared_lengths_past_block() {
        let mut bytes = sample().encode().unwrap();
        bytes[5..9].copy_from_slice(&200u32.to_le_bytes());
        assert!(matches!(
            Metablock::decode(&bytes),
            Err(CodecError::CorruptMetablock(_))
        ));

        let mut bytes = sample().encode().unwrap();
        // inline count lives right after the link flag
        let count_at = sample().header_len() - 8;
        bytes[count_at..count_at + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            Metablock::decode(&bytes),
            Err(CodecError::CorruptMetablock(_))
        ));
    }

    #[test]
    fn test_all_zero_block_is_corrupt() {
        assert!(matches!(
            Metablock::decode(&[0u8; BLOCK_SIZE]),
            Err(CodecError::CorruptMetablock(_))
        ));
    }

    #[test]
    fn test_overflow_chain_block() {
        let block = IndexChainBlock {
            indices: (100..100 + OVERFLOW_CAPACITY as u32).collect(),
            next: Some(5),
        };
        let bytes = block.encode().unwrap();
        assert_eq!(&bytes[BLOCK_SIZE - 4..], &5u32.to_le_bytes());
        assert_eq!(IndexChainBlock::decode(&bytes).unwrap(), block);

        let last = IndexChainBlock {
            indices: vec![1],
            next: None,
        };
        assert_eq!(
            IndexChainBlock::decode(&last.encode().unwrap()).unwrap(),
            last
        );

        let too_many = IndexChainBlock {
            indices: vec![0; OVERFLOW_CAPACITY + 1],
            next: None,
        };
        assert!(too_many.encode().is_err());
    }

    #[test]
    fn test_overflow_blocks_needed() {
        assert_eq!(overflow_blocks_needed(10, 20), 0);
        assert_eq!(overflow_blocks_needed(21, 20), 1);
        assert_eq!(overflow_blocks_needed(20 + OVERFLOW_CAPACITY, 20), 1);
        assert_eq!(overflow_blocks_needed(21 + OVERFLOW_CAPACITY, 20), 2);
    }
}
