//! Read-side graph traversal shared by transactions and the engine.
//!
//! A reader is a store plus a workspace overlay. The engine reads with an
//! empty overlay (committed state only); a transaction reads with its own
//! workspace so it observes its writes.

use crate::props::{collect_properties, decode_value, find_property};
use crate::workspace::TxWorkspace;
use trellis_core::{NodeId, PropertyValue, RelationshipId, Result, TrellisError, NIL};
use trellis_store::GraphStore;

/// What a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropOwner {
    /// A node's property.
    Node(NodeId),
    /// A relationship's property.
    Relationship(RelationshipId),
}

/// Store + overlay read view.
pub struct GraphReader<'a> {
    store: &'a GraphStore,
    ws: &'a TxWorkspace,
}

impl<'a> GraphReader<'a> {
    /// View over `store` through `ws`.
    pub fn new(store: &'a GraphStore, ws: &'a TxWorkspace) -> GraphReader<'a> {
        GraphReader { store, ws }
    }

    /// Does this node exist (in use)?
    pub fn node_exists(&self, node: NodeId) -> Result<bool> {
        Ok(self.ws.node(self.store, node.raw())?.in_use)
    }

    /// Endpoints and type name of a relationship.
    pub fn relationship(&self, rel: RelationshipId) -> Result<(NodeId, NodeId, String)> {
        let record = self.ws.relationship(self.store, rel.raw())?;
        if !record.in_use {
            return Err(TrellisError::NotFound {
                what: "relationship",
                id: rel.raw(),
            });
        }
        let type_name = self
            .ws
            .rel_type_name(self.store, record.type_id)
            .ok_or(TrellisError::NotFound {
                what: "relationship type",
                id: record.type_id as u64,
            })?;
        Ok((
            NodeId(record.start_node),
            NodeId(record.end_node),
            type_name,
        ))
    }

    /// All relationships of a node, chain order.
    pub fn relationships(&self, node: NodeId) -> Result<Vec<RelationshipId>> {
        let record = self.ws.node(self.store, node.raw())?;
        if !record.in_use {
            return Err(TrellisError::NotFound {
                what: "node",
                id: node.raw(),
            });
        }
        let mut rels = Vec::new();
        let mut rel_id = record.first_rel;
        while rel_id != NIL {
            rels.push(RelationshipId(rel_id));
            let rel = self.ws.relationship(self.store, rel_id)?;
            let (_, next) = rel.chain(node.raw());
            rel_id = next;
        }
        Ok(rels)
    }

    /// One property value, if set.
    pub fn property(&self, owner: PropOwner, key: &str) -> Result<Option<PropertyValue>> {
        let key_id = match self.ws.prop_key_id(self.store, key) {
            Some(id) => id as u32,
            None => return Ok(None),
        };
        let first_prop = self.first_prop(owner)?;
        let found = find_property(first_prop, key_id, |id| self.ws.property(self.store, id))?;
        match found {
            Some((_, record)) => Ok(Some(decode_value(self.ws, self.store, &record)?)),
            None => Ok(None),
        }
    }

    /// Every property of the owner as `(key name, value)`.
    pub fn properties(&self, owner: PropOwner) -> Result<Vec<(String, PropertyValue)>> {
        let first_prop = self.first_prop(owner)?;
        let records = collect_properties(first_prop, |id| self.ws.property(self.store, id))?;
        let mut out = Vec::with_capacity(records.len());
        for (_, record) in records {
            if !record.in_use {
                continue;
            }
            let key = self
                .ws
                .prop_key_name(self.store, record.key_id)
                .ok_or(TrellisError::NotFound {
                    what: "property key",
                    id: record.key_id as u64,
                })?;
            out.push((key, decode_value(self.ws, self.store, &record)?));
        }
        Ok(out)
    }

    /// Head of the owner's property chain; errors when the owner is gone.
    pub fn first_prop(&self, owner: PropOwner) -> Result<u64> {
        match owner {
            PropOwner::Node(node) => {
                let record = self.ws.node(self.store, node.raw())?;
                if !record.in_use {
                    return Err(TrellisError::NotFound {
                        what: "node",
                        id: node.raw(),
                    });
                }
                Ok(record.first_prop)
            }
            PropOwner::Relationship(rel) => {
                let record = self.ws.relationship(self.store, rel.raw())?;
                if !record.in_use {
                    return Err(TrellisError::NotFound {
                        what: "relationship",
                        id: rel.raw(),
                    });
                }
                Ok(record.first_prop)
            }
        }
    }
}
