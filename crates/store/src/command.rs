//! The command union: one entry per mutated record.
//!
//! Every write-producing kernel operation is expressed as commands carrying
//! the before and after images of the records it touches. Commands are what
//! the logical log persists and what replication ships; applying a command
//! writes the after-image at the record's id, which makes re-application a
//! no-op by construction.
//!
//! Dispatch is a plain `match` over this sealed set: there is no dynamic
//! command registration.

use crate::record::{DynamicRecord, NodeRecord, PropertyRecord, RelationshipRecord, TokenRecord};
use serde::{Deserialize, Serialize};
use trellis_core::{Result, TrellisError};

/// Which dynamic store a [`GraphCommand::Dynamic`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DynamicStoreKind {
    /// `neostore.propertystore.db.strings`
    Strings,
    /// `neostore.propertystore.db.arrays`
    Arrays,
}

/// Which token table a [`GraphCommand::Token`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStoreKind {
    /// Relationship types.
    RelationshipType,
    /// Property keys.
    PropertyKey,
}

/// One mutated record, with images sufficient to redo the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphCommand {
    /// Node record change.
    Node {
        /// Record slot.
        id: u64,
        /// Image before the transaction.
        before: NodeRecord,
        /// Image after the transaction.
        after: NodeRecord,
    },
    /// Relationship record change.
    Relationship {
        /// Record slot.
        id: u64,
        /// Image before the transaction.
        before: RelationshipRecord,
        /// Image after the transaction.
        after: RelationshipRecord,
    },
    /// Property record change.
    Property {
        /// Record slot.
        id: u64,
        /// Image before the transaction.
        before: PropertyRecord,
        /// Image after the transaction.
        after: PropertyRecord,
    },
    /// Dynamic block change in one of the spill stores.
    Dynamic {
        /// Target store.
        kind: DynamicStoreKind,
        /// Block slot.
        id: u64,
        /// Image before the transaction.
        before: DynamicRecord,
        /// Image after the transaction.
        after: DynamicRecord,
    },
    /// Token creation. Tokens are never deleted, so there is no before
    /// image; the name rides along so replicas can refresh their in-memory
    /// table without chasing the dynamic chain.
    Token {
        /// Target table.
        kind: TokenStoreKind,
        /// Record slot.
        id: u64,
        /// Image after the transaction.
        after: TokenRecord,
        /// The token's name.
        name: String,
    },
}

impl GraphCommand {
    /// The record slot this command targets.
    pub fn record_id(&self) -> u64 {
        match self {
            GraphCommand::Node { id, .. }
            | GraphCommand::Relationship { id, .. }
            | GraphCommand::Property { id, .. }
            | GraphCommand::Dynamic { id, .. }
            | GraphCommand::Token { id, .. } => *id,
        }
    }

    /// True when the command deletes its record (after-image not in use).
    pub fn is_delete(&self) -> bool {
        match self {
            GraphCommand::Node { after, .. } => !after.in_use,
            GraphCommand::Relationship { after, .. } => !after.in_use,
            GraphCommand::Property { after, .. } => !after.in_use,
            GraphCommand::Dynamic { after, .. } => !after.in_use,
            GraphCommand::Token { .. } => false,
        }
    }
}

/// Encode one command: the payload of one COMMAND log entry.
pub fn encode_command(command: &GraphCommand) -> Result<Vec<u8>> {
    bincode::serialize(command).map_err(TrellisError::serialization)
}

/// Decode one command produced by [`encode_command`].
pub fn decode_command(bytes: &[u8]) -> Result<GraphCommand> {
    bincode::deserialize(bytes).map_err(TrellisError::serialization)
}

/// Encode a command list for the wire.
pub fn encode_commands(commands: &[GraphCommand]) -> Result<Vec<u8>> {
    bincode::serialize(commands).map_err(TrellisError::serialization)
}

/// Decode a command list produced by [`encode_commands`].
pub fn decode_commands(bytes: &[u8]) -> Result<Vec<GraphCommand>> {
    bincode::deserialize(bytes).map_err(TrellisError::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::NIL;

    fn sample_commands() -> Vec<GraphCommand> {
        vec![
            GraphCommand::Node {
                id: 1,
                before: NodeRecord::EMPTY,
                after: NodeRecord::new(),
            },
            GraphCommand::Relationship {
                id: 2,
                before: RelationshipRecord::EMPTY,
                after: RelationshipRecord::new(0, 1, 0),
            },
            GraphCommand::Dynamic {
                kind: DynamicStoreKind::Strings,
                id: 3,
                before: DynamicRecord::empty(),
                after: DynamicRecord {
                    in_use: true,
                    next_block: NIL,
                    data: b"KNOWS".to_vec(),
                },
            },
            GraphCommand::Token {
                kind: TokenStoreKind::RelationshipType,
                id: 0,
                after: TokenRecord {
                    in_use: true,
                    name_block: 3,
                },
                name: "KNOWS".to_string(),
            },
        ]
    }

    #[test]
    fn encode_decode_roundtrip() {
        let commands = sample_commands();
        let bytes = encode_commands(&commands).unwrap();
        assert_eq!(decode_commands(&bytes).unwrap(), commands);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_commands(&[0xFF; 7]).is_err());
    }

    #[test]
    fn delete_detection() {
        let delete = GraphCommand::Node {
            id: 4,
            before: NodeRecord::new(),
            after: NodeRecord::EMPTY,
        };
        assert!(delete.is_delete());
        assert!(!sample_commands()[0].is_delete());
    }
}
