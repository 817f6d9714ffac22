//! Fixed-width record layouts.
//!
//! All integers little-endian. Every record starts with a one-byte in-use
//! flag; pointer fields use [`NIL`] for "none". Record layouts never change
//! size: the slot number times the record size is the file offset.

use byteorder::{ByteOrder, LittleEndian};
use trellis_core::NIL;

/// Node record: `{in_use, first_rel_id, first_prop_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeRecord {
    /// Slot holds a live node.
    pub in_use: bool,
    /// Head of the node's relationship chain.
    pub first_rel: u64,
    /// Head of the node's property chain.
    pub first_prop: u64,
}

impl NodeRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 17;

    /// An unused slot.
    pub const EMPTY: NodeRecord = NodeRecord {
        in_use: false,
        first_rel: NIL,
        first_prop: NIL,
    };

    /// A fresh node with empty chains.
    pub fn new() -> NodeRecord {
        NodeRecord {
            in_use: true,
            ..NodeRecord::EMPTY
        }
    }

    /// Encode into a `SIZE`-byte buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        LittleEndian::write_u64(&mut buf[1..9], self.first_rel);
        LittleEndian::write_u64(&mut buf[9..17], self.first_prop);
    }

    /// Decode from a `SIZE`-byte buffer.
    pub fn read_from(buf: &[u8]) -> NodeRecord {
        NodeRecord {
            in_use: buf[0] != 0,
            first_rel: LittleEndian::read_u64(&buf[1..9]),
            first_prop: LittleEndian::read_u64(&buf[9..17]),
        }
    }
}

impl Default for NodeRecord {
    fn default() -> Self {
        NodeRecord::EMPTY
    }
}

/// Relationship record.
///
/// A relationship is a member of exactly two doubly linked lists, one per
/// endpoint; the four prev/next fields are the links. `type_id` indexes the
/// relationship-type token table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RelationshipRecord {
    /// Slot holds a live relationship.
    pub in_use: bool,
    /// Start node id.
    pub start_node: u64,
    /// End node id.
    pub end_node: u64,
    /// Relationship type token.
    pub type_id: u32,
    /// Previous relationship in the start node's chain.
    pub start_prev: u64,
    /// Next relationship in the start node's chain.
    pub start_next: u64,
    /// Previous relationship in the end node's chain.
    pub end_prev: u64,
    /// Next relationship in the end node's chain.
    pub end_next: u64,
    /// Head of the relationship's property chain.
    pub first_prop: u64,
}

impl RelationshipRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 61;

    /// An unused slot.
    pub const EMPTY: RelationshipRecord = RelationshipRecord {
        in_use: false,
        start_node: NIL,
        end_node: NIL,
        type_id: 0,
        start_prev: NIL,
        start_next: NIL,
        end_prev: NIL,
        end_next: NIL,
        first_prop: NIL,
    };

    /// A fresh relationship between two nodes, not yet linked into chains.
    pub fn new(start_node: u64, end_node: u64, type_id: u32) -> RelationshipRecord {
        RelationshipRecord {
            in_use: true,
            start_node,
            end_node,
            type_id,
            ..RelationshipRecord::EMPTY
        }
    }

    /// Encode into a `SIZE`-byte buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        LittleEndian::write_u64(&mut buf[1..9], self.start_node);
        LittleEndian::write_u64(&mut buf[9..17], self.end_node);
        LittleEndian::write_u32(&mut buf[17..21], self.type_id);
        LittleEndian::write_u64(&mut buf[21..29], self.start_prev);
        LittleEndian::write_u64(&mut buf[29..37], self.start_next);
        LittleEndian::write_u64(&mut buf[37..45], self.end_prev);
        LittleEndian::write_u64(&mut buf[45..53], self.end_next);
        LittleEndian::write_u64(&mut buf[53..61], self.first_prop);
    }

    /// Decode from a `SIZE`-byte buffer.
    pub fn read_from(buf: &[u8]) -> RelationshipRecord {
        RelationshipRecord {
            in_use: buf[0] != 0,
            start_node: LittleEndian::read_u64(&buf[1..9]),
            end_node: LittleEndian::read_u64(&buf[9..17]),
            type_id: LittleEndian::read_u32(&buf[17..21]),
            start_prev: LittleEndian::read_u64(&buf[21..29]),
            start_next: LittleEndian::read_u64(&buf[29..37]),
            end_prev: LittleEndian::read_u64(&buf[37..45]),
            end_next: LittleEndian::read_u64(&buf[45..53]),
            first_prop: LittleEndian::read_u64(&buf[53..61]),
        }
    }

    /// The prev/next pair for the chain anchored at `node`.
    ///
    /// Panics if `node` is neither endpoint; callers resolve the endpoint
    /// before chain surgery.
    pub fn chain(&self, node: u64) -> (u64, u64) {
        if node == self.start_node {
            (self.start_prev, self.start_next)
        } else if node == self.end_node {
            (self.end_prev, self.end_next)
        } else {
            panic!("node {} is not an endpoint of this relationship", node);
        }
    }

    /// Set the prev/next pair for the chain anchored at `node`.
    pub fn set_chain(&mut self, node: u64, prev: u64, next: u64) {
        if node == self.start_node {
            self.start_prev = prev;
            self.start_next = next;
        } else if node == self.end_node {
            self.end_prev = prev;
            self.end_next = next;
        } else {
            panic!("node {} is not an endpoint of this relationship", node);
        }
    }
}

impl Default for RelationshipRecord {
    fn default() -> Self {
        RelationshipRecord::EMPTY
    }
}

/// How a property record stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PropertyPayload {
    /// Value encoded directly in the record's 8-byte payload field.
    Inline {
        /// Raw payload bytes.
        bits: u64,
        /// Meaningful byte count for inline strings (0 for scalars).
        len: u8,
    },
    /// Value spilled to a dynamic-record chain; payload is the head block.
    Dynamic {
        /// First block of the chain.
        first_block: u64,
    },
}

/// Marker in the `inline_len` byte meaning "payload is a dynamic block id".
const DYNAMIC_MARKER: u8 = 0xFF;

/// Property record: `{in_use, key_id, type, payload, next_prop_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PropertyRecord {
    /// Slot holds a live property.
    pub in_use: bool,
    /// Property key token.
    pub key_id: u32,
    /// Value type discriminant (`PropertyValue::type_tag`).
    pub type_tag: u8,
    /// Inline value or dynamic chain head.
    pub payload: PropertyPayload,
    /// Next property in the owner's chain.
    pub next_prop: u64,
}

impl PropertyRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 23;

    /// An unused slot.
    pub const EMPTY: PropertyRecord = PropertyRecord {
        in_use: false,
        key_id: 0,
        type_tag: 0,
        payload: PropertyPayload::Inline { bits: 0, len: 0 },
        next_prop: NIL,
    };

    /// Encode into a `SIZE`-byte buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        LittleEndian::write_u32(&mut buf[1..5], self.key_id);
        buf[5] = self.type_tag;
        match self.payload {
            PropertyPayload::Inline { bits, len } => {
                debug_assert!(len < DYNAMIC_MARKER);
                buf[6] = len;
                LittleEndian::write_u64(&mut buf[7..15], bits);
            }
            PropertyPayload::Dynamic { first_block } => {
                buf[6] = DYNAMIC_MARKER;
                LittleEndian::write_u64(&mut buf[7..15], first_block);
            }
        }
        LittleEndian::write_u64(&mut buf[15..23], self.next_prop);
    }

    /// Decode from a `SIZE`-byte buffer.
    pub fn read_from(buf: &[u8]) -> PropertyRecord {
        let marker = buf[6];
        let raw = LittleEndian::read_u64(&buf[7..15]);
        let payload = if marker == DYNAMIC_MARKER {
            PropertyPayload::Dynamic { first_block: raw }
        } else {
            PropertyPayload::Inline {
                bits: raw,
                len: marker,
            }
        };
        PropertyRecord {
            in_use: buf[0] != 0,
            key_id: LittleEndian::read_u32(&buf[1..5]),
            type_tag: buf[5],
            payload,
            next_prop: LittleEndian::read_u64(&buf[15..23]),
        }
    }
}

impl Default for PropertyRecord {
    fn default() -> Self {
        PropertyRecord::EMPTY
    }
}

/// Dynamic record: one block of a spilled string or array.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DynamicRecord {
    /// Slot holds a live block.
    pub in_use: bool,
    /// Next block of the chain.
    pub next_block: u64,
    /// Block payload (at most [`DynamicRecord::DATA_SIZE`] bytes).
    pub data: Vec<u8>,
}

impl DynamicRecord {
    /// Payload capacity of one block.
    pub const DATA_SIZE: usize = 120;

    /// Encoded size in bytes: flag + next pointer + length + payload.
    pub const SIZE: usize = 1 + 8 + 2 + Self::DATA_SIZE;

    /// An unused slot.
    pub fn empty() -> DynamicRecord {
        DynamicRecord {
            in_use: false,
            next_block: NIL,
            data: Vec::new(),
        }
    }

    /// Encode into a `SIZE`-byte buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(self.data.len() <= Self::DATA_SIZE);
        buf[0] = self.in_use as u8;
        LittleEndian::write_u64(&mut buf[1..9], self.next_block);
        LittleEndian::write_u16(&mut buf[9..11], self.data.len() as u16);
        buf[11..11 + self.data.len()].copy_from_slice(&self.data);
        buf[11 + self.data.len()..Self::SIZE].fill(0);
    }

    /// Decode from a `SIZE`-byte buffer.
    pub fn read_from(buf: &[u8]) -> DynamicRecord {
        let len = LittleEndian::read_u16(&buf[9..11]) as usize;
        let len = len.min(Self::DATA_SIZE);
        DynamicRecord {
            in_use: buf[0] != 0,
            next_block: LittleEndian::read_u64(&buf[1..9]),
            data: buf[11..11 + len].to_vec(),
        }
    }

    /// Split `bytes` into a chain of blocks with allocated ids.
    ///
    /// `ids` must hold exactly `blocks_for(bytes.len())` entries; returns
    /// `(id, record)` pairs linked head to tail.
    pub fn chain_from_bytes(bytes: &[u8], ids: &[u64]) -> Vec<(u64, DynamicRecord)> {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[][..]]
        } else {
            bytes.chunks(Self::DATA_SIZE).collect()
        };
        debug_assert_eq!(chunks.len(), ids.len());
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let next = if i + 1 < ids.len() { ids[i + 1] } else { NIL };
                (
                    ids[i],
                    DynamicRecord {
                        in_use: true,
                        next_block: next,
                        data: chunk.to_vec(),
                    },
                )
            })
            .collect()
    }

    /// Number of blocks needed for `len` bytes.
    pub fn blocks_for(len: usize) -> usize {
        if len == 0 {
            1
        } else {
            (len + Self::DATA_SIZE - 1) / Self::DATA_SIZE
        }
    }
}

/// Token record for relationship types and property keys.
///
/// The token name lives in the string dynamic store; the full token table
/// is loaded and cached in memory at store open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenRecord {
    /// Slot holds a live token.
    pub in_use: bool,
    /// Head block of the token name in the string store.
    pub name_block: u64,
}

impl TokenRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 9;

    /// An unused slot.
    pub const EMPTY: TokenRecord = TokenRecord {
        in_use: false,
        name_block: NIL,
    };

    /// Encode into a `SIZE`-byte buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        LittleEndian::write_u64(&mut buf[1..9], self.name_block);
    }

    /// Decode from a `SIZE`-byte buffer.
    pub fn read_from(buf: &[u8]) -> TokenRecord {
        TokenRecord {
            in_use: buf[0] != 0,
            name_block: LittleEndian::read_u64(&buf[1..9]),
        }
    }
}

impl Default for TokenRecord {
    fn default() -> Self {
        TokenRecord::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_roundtrip() {
        let record = NodeRecord {
            in_use: true,
            first_rel: 42,
            first_prop: NIL,
        };
        let mut buf = [0u8; NodeRecord::SIZE];
        record.write_to(&mut buf);
        assert_eq!(NodeRecord::read_from(&buf), record);
    }

    #[test]
    fn relationship_roundtrip_and_chain_access() {
        let mut record = RelationshipRecord::new(1, 2, 7);
        record.set_chain(1, NIL, 9);
        record.set_chain(2, 5, NIL);

        let mut buf = [0u8; RelationshipRecord::SIZE];
        record.write_to(&mut buf);
        let parsed = RelationshipRecord::read_from(&buf);
        assert_eq!(parsed, record);
        assert_eq!(parsed.chain(1), (NIL, 9));
        assert_eq!(parsed.chain(2), (5, NIL));
    }

    #[test]
    #[should_panic]
    fn relationship_chain_rejects_non_endpoint() {
        RelationshipRecord::new(1, 2, 0).chain(3);
    }

    #[test]
    fn property_roundtrip_inline() {
        let record = PropertyRecord {
            in_use: true,
            key_id: 3,
            type_tag: 2,
            payload: PropertyPayload::Inline {
                bits: 0xDEAD_BEEF,
                len: 0,
            },
            next_prop: 11,
        };
        let mut buf = [0u8; PropertyRecord::SIZE];
        record.write_to(&mut buf);
        assert_eq!(PropertyRecord::read_from(&buf), record);
    }

    #[test]
    fn property_roundtrip_dynamic() {
        let record = PropertyRecord {
            in_use: true,
            key_id: 1,
            type_tag: 4,
            payload: PropertyPayload::Dynamic { first_block: 99 },
            next_prop: NIL,
        };
        let mut buf = [0u8; PropertyRecord::SIZE];
        record.write_to(&mut buf);
        assert_eq!(PropertyRecord::read_from(&buf), record);
    }

    #[test]
    fn dynamic_chain_split_and_link() {
        let bytes = vec![7u8; DynamicRecord::DATA_SIZE + 10];
        assert_eq!(DynamicRecord::blocks_for(bytes.len()), 2);

        let chain = DynamicRecord::chain_from_bytes(&bytes, &[4, 8]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].0, 4);
        assert_eq!(chain[0].1.next_block, 8);
        assert_eq!(chain[0].1.data.len(), DynamicRecord::DATA_SIZE);
        assert_eq!(chain[1].1.next_block, NIL);
        assert_eq!(chain[1].1.data.len(), 10);
    }

    #[test]
    fn dynamic_empty_value_still_one_block() {
        let chain = DynamicRecord::chain_from_bytes(&[], &[3]);
        assert_eq!(chain.len(), 1);
        assert!(chain[0].1.data.is_empty());
    }

    #[test]
    fn dynamic_roundtrip() {
        let record = DynamicRecord {
            in_use: true,
            next_block: 17,
            data: vec![1, 2, 3],
        };
        let mut buf = [0u8; DynamicRecord::SIZE];
        record.write_to(&mut buf);
        assert_eq!(DynamicRecord::read_from(&buf), record);
    }

    #[test]
    fn token_roundtrip() {
        let record = TokenRecord {
            in_use: true,
            name_block: 5,
        };
        let mut buf = [0u8; TokenRecord::SIZE];
        record.write_to(&mut buf);
        assert_eq!(TokenRecord::read_from(&buf), record);
    }
}
