//! Per-transaction record workspace.
//!
//! Mutations never touch the store directly: the workspace keeps, for each
//! record the transaction has written, the image it had before the
//! transaction (captured on first touch) and the image it has now. Reads
//! inside the transaction consult the workspace first, so a transaction
//! observes its own writes; sibling transactions never see any of it.
//!
//! At commit the workspace diffs into the transaction's command list: one
//! command per mutated record.

use std::collections::HashMap;
use trellis_core::{Result, TrellisError};
use trellis_store::{
    DynamicRecord, DynamicStoreKind, GraphCommand, GraphStore, NodeRecord, PropertyRecord,
    RelationshipRecord, TokenRecord, TokenStoreKind,
};

struct Entry<R: Clone> {
    before: R,
    current: R,
}

struct CreatedToken {
    kind: TokenStoreKind,
    id: u64,
    record: TokenRecord,
    name: String,
}

/// The transaction's private view of the records it has touched.
#[derive(Default)]
pub struct TxWorkspace {
    nodes: HashMap<u64, Entry<NodeRecord>>,
    relationships: HashMap<u64, Entry<RelationshipRecord>>,
    properties: HashMap<u64, Entry<PropertyRecord>>,
    dynamics: HashMap<(DynamicStoreKind, u64), Entry<DynamicRecord>>,
    tokens: Vec<CreatedToken>,
    staged_rel_types: HashMap<String, u64>,
    staged_prop_keys: HashMap<String, u64>,
}

impl TxWorkspace {
    /// Empty workspace.
    pub fn new() -> TxWorkspace {
        TxWorkspace::default()
    }

    /// True when the transaction has written nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.relationships.is_empty()
            && self.properties.is_empty()
            && self.dynamics.is_empty()
            && self.tokens.is_empty()
    }

    // === Reads (workspace first, store second; nothing is staged) ===

    /// Node image as this transaction sees it.
    pub fn node(&self, store: &GraphStore, id: u64) -> Result<NodeRecord> {
        match self.nodes.get(&id) {
            Some(entry) => Ok(entry.current),
            None => store.node(id),
        }
    }

    /// Relationship image as this transaction sees it.
    pub fn relationship(&self, store: &GraphStore, id: u64) -> Result<RelationshipRecord> {
        match self.relationships.get(&id) {
            Some(entry) => Ok(entry.current),
            None => store.relationship(id),
        }
    }

    /// Property image as this transaction sees it.
    pub fn property(&self, store: &GraphStore, id: u64) -> Result<PropertyRecord> {
        match self.properties.get(&id) {
            Some(entry) => Ok(entry.current),
            None => store.property(id),
        }
    }

    /// Dynamic block as this transaction sees it.
    pub fn dynamic(
        &self,
        store: &GraphStore,
        kind: DynamicStoreKind,
        id: u64,
    ) -> Result<DynamicRecord> {
        match self.dynamics.get(&(kind, id)) {
            Some(entry) => Ok(entry.current.clone()),
            None => store.dynamic(kind, id),
        }
    }

    /// Follow a dynamic chain through the transaction's view.
    pub fn read_dynamic_chain(
        &self,
        store: &GraphStore,
        kind: DynamicStoreKind,
        first_block: u64,
    ) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut block = first_block;
        while block != trellis_core::NIL {
            let record = self.dynamic(store, kind, block)?;
            if !record.in_use {
                return Err(TrellisError::Corruption(format!(
                    "dynamic chain points at free block {}",
                    block
                )));
            }
            bytes.extend_from_slice(&record.data);
            block = record.next_block;
        }
        Ok(bytes)
    }

    // === Writes (before-image captured on first touch) ===

    /// Mutable node image, staging the record on first touch.
    pub fn node_mut(&mut self, store: &GraphStore, id: u64) -> Result<&mut NodeRecord> {
        if !self.nodes.contains_key(&id) {
            let before = store.node(id)?;
            self.nodes.insert(
                id,
                Entry {
                    before,
                    current: before,
                },
            );
        }
        Ok(&mut self.nodes.get_mut(&id).unwrap().current)
    }

    /// Mutable relationship image.
    pub fn relationship_mut(
        &mut self,
        store: &GraphStore,
        id: u64,
    ) -> Result<&mut RelationshipRecord> {
        if !self.relationships.contains_key(&id) {
            let before = store.relationship(id)?;
            self.relationships.insert(
                id,
                Entry {
                    before,
                    current: before,
                },
            );
        }
        Ok(&mut self.relationships.get_mut(&id).unwrap().current)
    }

    /// Mutable property image.
    pub fn property_mut(&mut self, store: &GraphStore, id: u64) -> Result<&mut PropertyRecord> {
        if !self.properties.contains_key(&id) {
            let before = store.property(id)?;
            self.properties.insert(
                id,
                Entry {
                    before,
                    current: before,
                },
            );
        }
        Ok(&mut self.properties.get_mut(&id).unwrap().current)
    }

    /// Mutable dynamic block image.
    pub fn dynamic_mut(
        &mut self,
        store: &GraphStore,
        kind: DynamicStoreKind,
        id: u64,
    ) -> Result<&mut DynamicRecord> {
        if !self.dynamics.contains_key(&(kind, id)) {
            let before = store.dynamic(kind, id)?;
            self.dynamics.insert(
                (kind, id),
                Entry {
                    before: before.clone(),
                    current: before,
                },
            );
        }
        Ok(&mut self.dynamics.get_mut(&(kind, id)).unwrap().current)
    }

    /// Stage a token creation.
    pub fn stage_token(&mut self, kind: TokenStoreKind, id: u64, record: TokenRecord, name: &str) {
        match kind {
            TokenStoreKind::RelationshipType => {
                self.staged_rel_types.insert(name.to_string(), id);
            }
            TokenStoreKind::PropertyKey => {
                self.staged_prop_keys.insert(name.to_string(), id);
            }
        }
        self.tokens.push(CreatedToken {
            kind,
            id,
            record,
            name: name.to_string(),
        });
    }

    /// Token id for a relationship type, as this transaction sees it.
    pub fn rel_type_id(&self, store: &GraphStore, name: &str) -> Option<u64> {
        self.staged_rel_types
            .get(name)
            .copied()
            .or_else(|| store.rel_type_id(name).map(|id| id as u64))
    }

    /// Token id for a property key, as this transaction sees it.
    pub fn prop_key_id(&self, store: &GraphStore, name: &str) -> Option<u64> {
        self.staged_prop_keys
            .get(name)
            .copied()
            .or_else(|| store.prop_key_id(name).map(|id| id as u64))
    }

    /// Relationship type name for an id, as this transaction sees it.
    pub fn rel_type_name(&self, store: &GraphStore, id: u32) -> Option<String> {
        self.tokens
            .iter()
            .find(|t| t.kind == TokenStoreKind::RelationshipType && t.id == id as u64)
            .map(|t| t.name.clone())
            .or_else(|| store.rel_type_name(id))
    }

    /// Property key name for an id, as this transaction sees it.
    pub fn prop_key_name(&self, store: &GraphStore, id: u32) -> Option<String> {
        self.tokens
            .iter()
            .find(|t| t.kind == TokenStoreKind::PropertyKey && t.id == id as u64)
            .map(|t| t.name.clone())
            .or_else(|| store.prop_key_name(id))
    }

    /// Diff into the command list: one command per changed record.
    pub fn into_commands(self) -> Vec<GraphCommand> {
        let mut commands = Vec::new();

        for (key, entry) in self.dynamics {
            if entry.before != entry.current {
                commands.push(GraphCommand::Dynamic {
                    kind: key.0,
                    id: key.1,
                    before: entry.before,
                    after: entry.current,
                });
            }
        }
        for token in self.tokens {
            commands.push(GraphCommand::Token {
                kind: token.kind,
                id: token.id,
                after: token.record,
                name: token.name,
            });
        }
        for (id, entry) in self.properties {
            if entry.before != entry.current {
                commands.push(GraphCommand::Property {
                    id,
                    before: entry.before,
                    after: entry.current,
                });
            }
        }
        for (id, entry) in self.relationships {
            if entry.before != entry.current {
                commands.push(GraphCommand::Relationship {
                    id,
                    before: entry.before,
                    after: entry.current,
                });
            }
        }
        for (id, entry) in self.nodes {
            if entry.before != entry.current {
                commands.push(GraphCommand::Node {
                    id,
                    before: entry.before,
                    after: entry.current,
                });
            }
        }

        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trellis_core::NIL;
    use trellis_store::{PageBackend, StoreOpenOptions};

    fn store(dir: &std::path::Path) -> GraphStore {
        GraphStore::open(
            dir,
            StoreOpenOptions {
                backend: PageBackend::Direct,
                read_only: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn reads_see_own_writes_but_store_is_untouched() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut ws = TxWorkspace::new();

        let node = ws.node_mut(&store, 0).unwrap();
        node.in_use = true;
        node.first_rel = 7;

        assert!(ws.node(&store, 0).unwrap().in_use);
        assert!(!store.node(0).unwrap().in_use);
    }

    #[test]
    fn unchanged_records_produce_no_commands() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut ws = TxWorkspace::new();

        // Touch without changing
        ws.node_mut(&store, 0).unwrap();
        let commands = ws.into_commands();
        assert!(commands.is_empty());
    }

    #[test]
    fn diff_produces_before_and_after_images() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut ws = TxWorkspace::new();

        let node = ws.node_mut(&store, 4).unwrap();
        node.in_use = true;
        node.first_prop = 12;

        let commands = ws.into_commands();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            GraphCommand::Node { id, before, after } => {
                assert_eq!(*id, 4);
                assert!(!before.in_use);
                assert!(after.in_use);
                assert_eq!(after.first_prop, 12);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn staged_tokens_resolve_before_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut ws = TxWorkspace::new();

        assert_eq!(ws.rel_type_id(&store, "KNOWS"), None);
        ws.stage_token(
            TokenStoreKind::RelationshipType,
            0,
            TokenRecord {
                in_use: true,
                name_block: NIL,
            },
            "KNOWS",
        );
        assert_eq!(ws.rel_type_id(&store, "KNOWS"), Some(0));
    }
}
