//! The write transaction handle.
//!
//! All mutations stage record changes in the transaction's workspace and
//! acquire write locks through the engine's write path. Nothing becomes
//! visible to other transactions before commit turns the workspace into a
//! command stream and drives it through two-phase commit (locally on a
//! primary, via the primary's RPC on a follower).

use crate::engine::GraphEngine;
use crate::props::{encode_value, find_property, free_value, write_chain};
use crate::reader::{GraphReader, PropOwner};
use crate::workspace::TxWorkspace;
use crate::write_path::WritePath;
use std::sync::Arc;
use tracing::debug;
use trellis_core::{
    IdKind, NodeId, PropertyValue, RelationshipId, Result, TrellisError, TxId, NIL,
};
use trellis_store::{
    DynamicRecord, DynamicStoreKind, GraphStore, NodeRecord, PropertyRecord, RelationshipRecord,
    TokenRecord, TokenStoreKind,
};
use trellis_txn::{ResourceKey, Transaction};

/// One write transaction against the graph.
pub struct GraphTx<'e> {
    engine: &'e GraphEngine,
    inner: Transaction,
    ws: TxWorkspace,
    path: Arc<dyn WritePath>,
    allocated: Vec<(IdKind, u64)>,
    finished: bool,
}

impl<'e> std::fmt::Debug for GraphTx<'e> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTx").finish_non_exhaustive()
    }
}

impl<'e> GraphTx<'e> {
    pub(crate) fn new(
        engine: &'e GraphEngine,
        inner: Transaction,
        path: Arc<dyn WritePath>,
    ) -> GraphTx<'e> {
        GraphTx {
            engine,
            inner,
            ws: TxWorkspace::new(),
            path,
            allocated: Vec::new(),
            finished: false,
        }
    }

    fn store(&self) -> &GraphStore {
        self.engine.store()
    }

    fn alloc(&mut self, kind: IdKind) -> Result<u64> {
        let id = self.path.next_id(kind)?;
        self.allocated.push((kind, id));
        Ok(id)
    }

    fn lock(&mut self, key: ResourceKey) -> Result<()> {
        self.path.lock(self.inner.serial(), key)
    }

    fn check_write(&self) -> Result<()> {
        self.engine.check_open()?;
        self.engine.check_writable()?;
        self.inner.check_usable()
    }

    // === Node operations ===

    /// Create a node.
    pub fn create_node(&mut self) -> Result<NodeId> {
        self.check_write()?;
        let id = self.alloc(IdKind::Node)?;
        *self.ws.node_mut(self.engine.store(), id)? = NodeRecord::new();
        Ok(NodeId(id))
    }

    /// Delete a node. The node must have no relationships left.
    pub fn delete_node(&mut self, node: NodeId) -> Result<()> {
        self.check_write()?;
        self.lock(ResourceKey::node(node.raw()))?;

        let record = self.ws.node(self.store(), node.raw())?;
        if !record.in_use {
            return Err(TrellisError::NotFound {
                what: "node",
                id: node.raw(),
            });
        }
        if record.first_rel != NIL {
            return Err(TrellisError::InvalidOperation(format!(
                "node {} still has relationships",
                node
            )));
        }

        self.free_property_chain(record.first_prop)?;
        *self.ws.node_mut(self.engine.store(), node.raw())? = NodeRecord::EMPTY;
        Ok(())
    }

    // === Relationship operations ===

    /// Create a relationship of `type_name` between two nodes.
    ///
    /// Both endpoint nodes are write-locked; the new relationship is
    /// inserted at the head of both endpoints' chains.
    pub fn create_relationship(
        &mut self,
        type_name: &str,
        start: NodeId,
        end: NodeId,
    ) -> Result<RelationshipId> {
        self.check_write()?;
        self.lock(ResourceKey::node(start.raw()))?;
        if end != start {
            self.lock(ResourceKey::node(end.raw()))?;
        }

        for node in [start, end] {
            if !self.ws.node(self.store(), node.raw())?.in_use {
                return Err(TrellisError::NotFound {
                    what: "node",
                    id: node.raw(),
                });
            }
        }

        let type_id = self.get_or_create_rel_type(type_name)? as u32;
        let rel_id = self.alloc(IdKind::Relationship)?;
        let mut rel = RelationshipRecord::new(start.raw(), end.raw(), type_id);

        self.link_into_chain(&mut rel, start.raw(), rel_id)?;
        if end != start {
            self.link_into_chain(&mut rel, end.raw(), rel_id)?;
        }
        *self.ws.relationship_mut(self.engine.store(), rel_id)? = rel;
        Ok(RelationshipId(rel_id))
    }

    /// Delete a relationship, unlinking it from both endpoint chains.
    pub fn delete_relationship(&mut self, rel: RelationshipId) -> Result<()> {
        self.check_write()?;

        let record = self.ws.relationship(self.store(), rel.raw())?;
        if !record.in_use {
            return Err(TrellisError::NotFound {
                what: "relationship",
                id: rel.raw(),
            });
        }
        self.lock(ResourceKey::node(record.start_node))?;
        if record.end_node != record.start_node {
            self.lock(ResourceKey::node(record.end_node))?;
        }
        self.lock(ResourceKey::relationship(rel.raw()))?;

        // Re-read under locks; another transaction may have gotten here
        // first and this transaction's earlier view would be stale.
        let record = self.ws.relationship(self.store(), rel.raw())?;
        if !record.in_use {
            return Err(TrellisError::NotFound {
                what: "relationship",
                id: rel.raw(),
            });
        }

        self.unlink_from_chain(&record, record.start_node, rel.raw())?;
        if record.end_node != record.start_node {
            self.unlink_from_chain(&record, record.end_node, rel.raw())?;
        }
        self.free_property_chain(record.first_prop)?;
        *self.ws.relationship_mut(self.engine.store(), rel.raw())? = RelationshipRecord::EMPTY;
        Ok(())
    }

    fn link_into_chain(
        &mut self,
        rel: &mut RelationshipRecord,
        node_id: u64,
        rel_id: u64,
    ) -> Result<()> {
        let old_first = {
            let node = self.ws.node_mut(self.engine.store(), node_id)?;
            let old = node.first_rel;
            node.first_rel = rel_id;
            old
        };
        rel.set_chain(node_id, NIL, old_first);
        if old_first != NIL {
            let neighbor = self.ws.relationship_mut(self.engine.store(), old_first)?;
            let (_, next) = neighbor.chain(node_id);
            neighbor.set_chain(node_id, rel_id, next);
        }
        Ok(())
    }

    fn unlink_from_chain(
        &mut self,
        record: &RelationshipRecord,
        node_id: u64,
        rel_id: u64,
    ) -> Result<()> {
        let (prev, next) = record.chain(node_id);
        if prev == NIL {
            let node = self.ws.node_mut(self.engine.store(), node_id)?;
            debug_assert_eq!(node.first_rel, rel_id);
            node.first_rel = next;
        } else {
            let prev_rel = self.ws.relationship_mut(self.engine.store(), prev)?;
            let (pp, _) = prev_rel.chain(node_id);
            prev_rel.set_chain(node_id, pp, next);
        }
        if next != NIL {
            let next_rel = self.ws.relationship_mut(self.engine.store(), next)?;
            let (_, nn) = next_rel.chain(node_id);
            next_rel.set_chain(node_id, prev, nn);
        }
        Ok(())
    }

    // === Property operations ===

    /// Set a property on a node.
    pub fn set_node_property(
        &mut self,
        node: NodeId,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.set_property(PropOwner::Node(node), key, value.into())
    }

    /// Set a property on a relationship.
    pub fn set_relationship_property(
        &mut self,
        rel: RelationshipId,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.set_property(PropOwner::Relationship(rel), key, value.into())
    }

    /// Remove a property; returns whether one was removed.
    pub fn remove_property(&mut self, owner: PropOwner, key: &str) -> Result<bool> {
        self.check_write()?;
        self.lock_owner(owner)?;

        let key_id = match self.ws.prop_key_id(self.store(), key) {
            Some(id) => id as u32,
            None => return Ok(false),
        };
        let first_prop = self.reader_first_prop(owner)?;

        // Walk with an explicit predecessor so the chain can be spliced.
        let mut prev: Option<u64> = None;
        let mut id = first_prop;
        while id != NIL {
            let record = self.ws.property(self.store(), id)?;
            if record.in_use && record.key_id == key_id {
                match prev {
                    None => self.set_owner_first_prop(owner, record.next_prop)?,
                    Some(prev_id) => {
                        self.ws
                            .property_mut(self.engine.store(), prev_id)?
                            .next_prop = record.next_prop;
                    }
                }
                free_value(&mut self.ws, self.engine.store(), &record)?;
                *self.ws.property_mut(self.engine.store(), id)? = PropertyRecord::EMPTY;
                return Ok(true);
            }
            prev = Some(id);
            id = record.next_prop;
        }
        Ok(false)
    }

    fn set_property(&mut self, owner: PropOwner, key: &str, value: PropertyValue) -> Result<()> {
        self.check_write()?;
        self.lock_owner(owner)?;

        let key_id = self.get_or_create_prop_key(key)? as u32;
        let first_prop = self.reader_first_prop(owner)?;

        let existing = find_property(first_prop, key_id, |id| self.ws.property(self.store(), id))?;

        match existing {
            Some((prop_id, old)) => {
                free_value(&mut self.ws, self.engine.store(), &old)?;
                let (type_tag, payload) = encode_value(
                    &mut self.ws,
                    self.engine.store(),
                    self.path.as_ref(),
                    &mut self.allocated,
                    &value,
                )?;
                let record = self.ws.property_mut(self.engine.store(), prop_id)?;
                record.type_tag = type_tag;
                record.payload = payload;
            }
            None => {
                let prop_id = self.alloc(IdKind::Property)?;
                let (type_tag, payload) = encode_value(
                    &mut self.ws,
                    self.engine.store(),
                    self.path.as_ref(),
                    &mut self.allocated,
                    &value,
                )?;
                *self.ws.property_mut(self.engine.store(), prop_id)? = PropertyRecord {
                    in_use: true,
                    key_id,
                    type_tag,
                    payload,
                    next_prop: first_prop,
                };
                self.set_owner_first_prop(owner, prop_id)?;
            }
        }
        Ok(())
    }

    fn lock_owner(&mut self, owner: PropOwner) -> Result<()> {
        match owner {
            PropOwner::Node(node) => self.lock(ResourceKey::node(node.raw())),
            PropOwner::Relationship(rel) => self.lock(ResourceKey::relationship(rel.raw())),
        }
    }

    fn reader_first_prop(&self, owner: PropOwner) -> Result<u64> {
        GraphReader::new(self.store(), &self.ws).first_prop(owner)
    }

    fn set_owner_first_prop(&mut self, owner: PropOwner, first_prop: u64) -> Result<()> {
        match owner {
            PropOwner::Node(node) => {
                self.ws
                    .node_mut(self.engine.store(), node.raw())?
                    .first_prop = first_prop;
            }
            PropOwner::Relationship(rel) => {
                self.ws
                    .relationship_mut(self.engine.store(), rel.raw())?
                    .first_prop = first_prop;
            }
        }
        Ok(())
    }

    fn free_property_chain(&mut self, first_prop: u64) -> Result<()> {
        let mut id = first_prop;
        while id != NIL {
            let record = self.ws.property(self.store(), id)?;
            free_value(&mut self.ws, self.engine.store(), &record)?;
            *self.ws.property_mut(self.engine.store(), id)? = PropertyRecord::EMPTY;
            id = record.next_prop;
        }
        Ok(())
    }

    // === Tokens ===

    fn get_or_create_rel_type(&mut self, name: &str) -> Result<u64> {
        if let Some(id) = self.ws.rel_type_id(self.store(), name) {
            return Ok(id);
        }
        self.create_token(TokenStoreKind::RelationshipType, IdKind::RelationshipType, name)
    }

    fn get_or_create_prop_key(&mut self, name: &str) -> Result<u64> {
        if let Some(id) = self.ws.prop_key_id(self.store(), name) {
            return Ok(id);
        }
        self.create_token(TokenStoreKind::PropertyKey, IdKind::PropertyKey, name)
    }

    fn create_token(
        &mut self,
        kind: TokenStoreKind,
        id_kind: IdKind,
        name: &str,
    ) -> Result<u64> {
        if name.is_empty() || name.len() > DynamicRecord::DATA_SIZE * 4 {
            return Err(TrellisError::InvalidOperation(format!(
                "token name length {} out of range",
                name.len()
            )));
        }
        let name_block = write_chain(
            &mut self.ws,
            self.engine.store(),
            self.path.as_ref(),
            &mut self.allocated,
            DynamicStoreKind::Strings,
            name.as_bytes(),
        )?;
        let token_id = self.alloc(id_kind)?;
        self.ws.stage_token(
            kind,
            token_id,
            TokenRecord {
                in_use: true,
                name_block,
            },
            name,
        );
        Ok(token_id)
    }

    // === Reads (this transaction's view) ===

    /// Read view over this transaction's state.
    pub fn reader(&self) -> GraphReader<'_> {
        GraphReader::new(self.store(), &self.ws)
    }

    /// Does this node exist, as seen by this transaction?
    pub fn node_exists(&self, node: NodeId) -> Result<bool> {
        self.reader().node_exists(node)
    }

    /// One property value, as seen by this transaction.
    pub fn property(&self, owner: PropOwner, key: &str) -> Result<Option<PropertyValue>> {
        self.reader().property(owner, key)
    }

    // === Completion ===

    /// Commit. Returns the assigned transaction id, or `None` when the
    /// transaction wrote nothing.
    pub fn commit(mut self) -> Result<Option<TxId>> {
        self.engine.check_open()?;
        let commands = std::mem::take(&mut self.ws).into_commands();
        let result = self.path.commit(&mut self.inner, commands);
        self.finished = true;
        match result {
            Ok(tx_id) => Ok(tx_id),
            Err(e) => {
                self.return_allocated_ids();
                Err(e)
            }
        }
    }

    /// Roll back, discarding the workspace and returning allocated ids.
    pub fn rollback(mut self) -> Result<()> {
        let result = self.path.abort(&mut self.inner);
        self.finished = true;
        self.return_allocated_ids();
        result
    }

    fn return_allocated_ids(&mut self) {
        for (kind, id) in self.allocated.drain(..) {
            self.path.release_id(kind, id);
        }
    }
}

impl Drop for GraphTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(serial = self.inner.serial(), "transaction dropped; rolling back");
            let _ = self.path.abort(&mut self.inner);
            self.return_allocated_ids();
        }
    }
}
