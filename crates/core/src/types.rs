//! Id newtypes and shared constants.
//!
//! Record ids are plain `u64` slot numbers inside the fixed-record store
//! files. `NIL` marks the absence of a pointer inside a record (empty
//! relationship chain, no first property, and so on). The public newtypes
//! wrap slot numbers so the kernel API cannot confuse a node with a
//! relationship.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for "no record" inside on-disk pointer fields.
pub const NIL: u64 = u64::MAX;

/// Name of the graph store resource in the data-source registry.
///
/// The graph store is always committed first within a transaction; secondary
/// indexes follow in registration order.
pub const RESOURCE_GRAPH: &str = "graph";

macro_rules! record_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// Raw slot number in the backing store file.
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }
    };
}

record_id!(
    /// Id of a node record.
    NodeId
);
record_id!(
    /// Id of a relationship record.
    RelationshipId
);

/// Global transaction id, assigned at commit time by the primary.
///
/// Within one resource tx ids are strictly increasing without gaps on every
/// replica; `TxId(0)` means "nothing committed yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl TxId {
    /// The id before any committed transaction.
    pub const ZERO: TxId = TxId(0);

    /// The next id in sequence.
    pub fn next(self) -> TxId {
        TxId(self.0 + 1)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one contiguous reign of a primary.
///
/// Increases on every election; at most one primary exists per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Epoch of a store that has never seen an election (standalone mode).
    pub const NONE: Epoch = Epoch(0);
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-unique id of one member, taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The id spaces managed by the store's allocators.
///
/// A follower reserves ranges of each kind from the primary instead of
/// allocating locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKind {
    /// Node records.
    Node,
    /// Relationship records.
    Relationship,
    /// Property records.
    Property,
    /// Dynamic string blocks (spilled property strings).
    PropertyString,
    /// Dynamic array blocks (spilled property arrays).
    PropertyArray,
    /// Relationship type records.
    RelationshipType,
    /// Property key records.
    PropertyKey,
}

impl IdKind {
    /// All kinds, in the order their allocators are persisted.
    pub const ALL: [IdKind; 7] = [
        IdKind::Node,
        IdKind::Relationship,
        IdKind::Property,
        IdKind::PropertyString,
        IdKind::PropertyArray,
        IdKind::RelationshipType,
        IdKind::PropertyKey,
    ];

    /// Stable name used in file names and log messages.
    pub fn as_str(self) -> &'static str {
        match self {
            IdKind::Node => "node",
            IdKind::Relationship => "relationship",
            IdKind::Property => "property",
            IdKind::PropertyString => "property.strings",
            IdKind::PropertyArray => "property.arrays",
            IdKind::RelationshipType => "relationshiptype",
            IdKind::PropertyKey => "propertykey",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_ordering_and_next() {
        assert!(TxId(1) < TxId(2));
        assert_eq!(TxId::ZERO.next(), TxId(1));
        assert_eq!(TxId(41).next(), TxId(42));
    }

    #[test]
    fn id_kind_names_are_unique() {
        let mut names: Vec<_> = IdKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), IdKind::ALL.len());
    }

    #[test]
    fn record_id_display() {
        assert_eq!(NodeId(7).to_string(), "7");
        assert_eq!(RelationshipId::from(3).raw(), 3);
    }
}
