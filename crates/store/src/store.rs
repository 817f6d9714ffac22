//! The graph store: all fixed-record files of one database directory.
//!
//! File set (`<dir>/`):
//!
//! | File | Records |
//! |---|---|
//! | `neostore` | store metadata (identity, log version, last committed tx) |
//! | `neostore.nodestore.db` | nodes |
//! | `neostore.relationshipstore.db` | relationships |
//! | `neostore.propertystore.db` | properties |
//! | `neostore.propertystore.db.strings` | spilled strings, token names |
//! | `neostore.propertystore.db.arrays` | spilled arrays |
//! | `neostore.relationshiptypestore.db` | relationship type tokens |
//! | `neostore.propertystore.db.index` | property key tokens |
//!
//! plus an `.id` allocator sibling per record file. Token tables are loaded
//! fully into memory at open.
//!
//! A record's in-use bit flips only through [`GraphStore::apply`], i.e.
//! inside a committed transaction; reads never observe uncommitted state
//! because uncommitted commands exist only in their transaction's buffer.

use crate::allocator::IdAllocator;
use crate::command::{DynamicStoreKind, GraphCommand, TokenStoreKind};
use crate::paging::{PageBackend, PagedFile};
use crate::record::{DynamicRecord, NodeRecord, PropertyRecord, RelationshipRecord, TokenRecord};
use crate::record_file::{RecordFile, StoreHeader, STORE_FORMAT_VERSION, STORE_HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use trellis_core::{IdKind, Result, StoreId, TrellisError, TxId, NIL};

/// Metadata file name.
pub const META_FILE: &str = "neostore";

const NODE_FILE: &str = "neostore.nodestore.db";
const REL_FILE: &str = "neostore.relationshipstore.db";
const PROP_FILE: &str = "neostore.propertystore.db";
const STRINGS_FILE: &str = "neostore.propertystore.db.strings";
const ARRAYS_FILE: &str = "neostore.propertystore.db.arrays";
const RELTYPE_FILE: &str = "neostore.relationshiptypestore.db";
const PROPKEY_FILE: &str = "neostore.propertystore.db.index";

// Metadata field offsets, after the store header.
const META_LOG_VERSION: u64 = STORE_HEADER_SIZE as u64;
const META_LAST_TX: u64 = META_LOG_VERSION + 8;
const META_CLEAN: u64 = META_LAST_TX + 8;

/// Options for opening a store directory.
#[derive(Debug, Clone, Copy)]
pub struct StoreOpenOptions {
    /// Paging backend for the record files.
    pub backend: PageBackend,
    /// Refuse all writes.
    pub read_only: bool,
}

impl Default for StoreOpenOptions {
    fn default() -> Self {
        StoreOpenOptions {
            backend: PageBackend::auto(None),
            read_only: false,
        }
    }
}

/// Mutable store metadata persisted in `neostore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Current logical log version (incremented on rotation).
    pub log_version: u64,
    /// Last committed transaction at the most recent clean close.
    pub last_committed_tx: TxId,
    /// Whether the previous close was clean.
    pub clean_shutdown: bool,
}

struct TokenTable {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl TokenTable {
    fn new() -> TokenTable {
        TokenTable {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    fn insert(&mut self, id: u32, name: String) {
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, name);
    }
}

struct Files {
    nodes: RecordFile,
    relationships: RecordFile,
    properties: RecordFile,
    strings: RecordFile,
    arrays: RecordFile,
    rel_types: RecordFile,
    prop_keys: RecordFile,
}

/// The open graph store.
pub struct GraphStore {
    dir: PathBuf,
    store_id: StoreId,
    read_only: bool,
    meta: Mutex<PagedFile>,
    files: RwLock<Files>,
    node_ids: IdAllocator,
    rel_ids: IdAllocator,
    prop_ids: IdAllocator,
    string_ids: IdAllocator,
    array_ids: IdAllocator,
    rel_type_ids: IdAllocator,
    prop_key_ids: IdAllocator,
    rel_types: RwLock<TokenTable>,
    prop_keys: RwLock<TokenTable>,
    /// Whether the store existed before this open.
    pre_existing: bool,
    /// Whether the previous close was clean, captured before this open
    /// marked the store dirty.
    opened_clean: bool,
}

impl GraphStore {
    /// Open a store directory, creating a fresh store when it is empty.
    pub fn open(dir: &Path, options: StoreOpenOptions) -> Result<GraphStore> {
        std::fs::create_dir_all(dir)?;
        let meta_path = dir.join(META_FILE);
        let pre_existing = meta_path.exists();

        let (mut meta, store_id) = if pre_existing {
            let meta = PagedFile::open(&meta_path, PageBackend::Direct, options.read_only)?;
            let mut header_bytes = [0u8; STORE_HEADER_SIZE];
            meta.read_at(0, &mut header_bytes)?;
            let header = StoreHeader::from_bytes(&header_bytes, &meta_path)?;
            (meta, header.store_id)
        } else {
            if options.read_only {
                return Err(TrellisError::Corruption(format!(
                    "no store in '{}'",
                    dir.display()
                )));
            }
            let store_id = StoreId::generate();
            let mut meta = PagedFile::open(&meta_path, PageBackend::Direct, false)?;
            let header = StoreHeader {
                version: STORE_FORMAT_VERSION,
                store_id,
            };
            meta.write_at(0, &header.to_bytes())?;
            let mut long = [0u8; 8];
            LittleEndian::write_u64(&mut long, 0);
            meta.write_at(META_LOG_VERSION, &long)?;
            meta.write_at(META_LAST_TX, &long)?;
            meta.write_at(META_CLEAN, &[1])?;
            meta.flush()?;
            info!(store_id = %store_id, dir = %dir.display(), "created new store");
            (meta, store_id)
        };

        let opened_clean = if pre_existing {
            let mut flag = [0u8; 1];
            meta.read_at(META_CLEAN, &mut flag)?;
            flag[0] == 1
        } else {
            true
        };

        // Mark the store dirty for the duration of this open.
        if !options.read_only {
            meta.write_at(META_CLEAN, &[0])?;
            meta.flush()?;
        }

        let open_file = |name: &str, record_size: usize| -> Result<RecordFile> {
            RecordFile::open(
                &dir.join(name),
                record_size,
                options.backend,
                options.read_only,
                store_id,
            )
        };

        let files = Files {
            nodes: open_file(NODE_FILE, NodeRecord::SIZE)?,
            relationships: open_file(REL_FILE, RelationshipRecord::SIZE)?,
            properties: open_file(PROP_FILE, PropertyRecord::SIZE)?,
            strings: open_file(STRINGS_FILE, DynamicRecord::SIZE)?,
            arrays: open_file(ARRAYS_FILE, DynamicRecord::SIZE)?,
            rel_types: open_file(RELTYPE_FILE, TokenRecord::SIZE)?,
            prop_keys: open_file(PROPKEY_FILE, TokenRecord::SIZE)?,
        };

        let open_allocator = |name: &str, file: &RecordFile| -> Result<IdAllocator> {
            let (allocator, needs_rebuild) =
                IdAllocator::open(&dir.join(format!("{}.id", name)), options.read_only)?;
            if needs_rebuild {
                let (high, free) = file.scan_allocator_state()?;
                debug!(file = name, high, free = free.len(), "rebuilt id allocator");
                allocator.rebuild(high, free);
            }
            Ok(allocator)
        };

        let store = GraphStore {
            node_ids: open_allocator(NODE_FILE, &files.nodes)?,
            rel_ids: open_allocator(REL_FILE, &files.relationships)?,
            prop_ids: open_allocator(PROP_FILE, &files.properties)?,
            string_ids: open_allocator(STRINGS_FILE, &files.strings)?,
            array_ids: open_allocator(ARRAYS_FILE, &files.arrays)?,
            rel_type_ids: open_allocator(RELTYPE_FILE, &files.rel_types)?,
            prop_key_ids: open_allocator(PROPKEY_FILE, &files.prop_keys)?,
            dir: dir.to_path_buf(),
            store_id,
            read_only: options.read_only,
            meta: Mutex::new(meta),
            files: RwLock::new(files),
            rel_types: RwLock::new(TokenTable::new()),
            prop_keys: RwLock::new(TokenTable::new()),
            pre_existing,
            opened_clean,
        };

        store.load_tokens()?;
        Ok(store)
    }

    /// Immutable identity of this store.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the directory already held a store before this open.
    pub fn pre_existing(&self) -> bool {
        self.pre_existing
    }

    /// Whether the previous close was clean (captured at open).
    pub fn opened_clean(&self) -> bool {
        self.opened_clean
    }

    /// Whether the store was opened read-only.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Read the persisted metadata fields.
    pub fn metadata(&self) -> Result<StoreMetadata> {
        let meta = self.meta.lock();
        let mut long = [0u8; 8];
        meta.read_at(META_LOG_VERSION, &mut long)?;
        let log_version = u64::from_le_bytes(long);
        meta.read_at(META_LAST_TX, &mut long)?;
        let last_committed_tx = TxId(u64::from_le_bytes(long));
        let mut flag = [0u8; 1];
        meta.read_at(META_CLEAN, &mut flag)?;
        Ok(StoreMetadata {
            log_version,
            last_committed_tx,
            clean_shutdown: flag[0] == 1,
        })
    }

    /// Persist the log version (called on log rotation).
    pub fn set_log_version(&self, version: u64) -> Result<()> {
        self.check_writable()?;
        let mut meta = self.meta.lock();
        let mut long = [0u8; 8];
        LittleEndian::write_u64(&mut long, version);
        meta.write_at(META_LOG_VERSION, &long)?;
        meta.flush()?;
        Ok(())
    }

    /// Persist the last committed transaction id.
    pub fn set_last_committed_tx(&self, tx_id: TxId) -> Result<()> {
        self.check_writable()?;
        let mut meta = self.meta.lock();
        let mut long = [0u8; 8];
        LittleEndian::write_u64(&mut long, tx_id.0);
        meta.write_at(META_LAST_TX, &long)?;
        meta.flush()?;
        Ok(())
    }

    // === Record reads ===

    /// Read a node record.
    pub fn node(&self, id: u64) -> Result<NodeRecord> {
        let mut buf = [0u8; NodeRecord::SIZE];
        self.files.read().nodes.read(id, &mut buf)?;
        Ok(NodeRecord::read_from(&buf))
    }

    /// Read a relationship record.
    pub fn relationship(&self, id: u64) -> Result<RelationshipRecord> {
        let mut buf = [0u8; RelationshipRecord::SIZE];
        self.files.read().relationships.read(id, &mut buf)?;
        Ok(RelationshipRecord::read_from(&buf))
    }

    /// Read a property record.
    pub fn property(&self, id: u64) -> Result<PropertyRecord> {
        let mut buf = [0u8; PropertyRecord::SIZE];
        self.files.read().properties.read(id, &mut buf)?;
        Ok(PropertyRecord::read_from(&buf))
    }

    /// Read one dynamic block.
    pub fn dynamic(&self, kind: DynamicStoreKind, id: u64) -> Result<DynamicRecord> {
        let mut buf = [0u8; DynamicRecord::SIZE];
        let files = self.files.read();
        let file = match kind {
            DynamicStoreKind::Strings => &files.strings,
            DynamicStoreKind::Arrays => &files.arrays,
        };
        file.read(id, &mut buf)?;
        Ok(DynamicRecord::read_from(&buf))
    }

    /// Follow a dynamic chain from its head block and concatenate the data.
    pub fn read_dynamic_chain(&self, kind: DynamicStoreKind, first_block: u64) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut block = first_block;
        while block != NIL {
            let record = self.dynamic(kind, block)?;
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

    /// Ids of every dynamic block in a chain.
    pub fn dynamic_chain_blocks(&self, kind: DynamicStoreKind, first_block: u64) -> Result<Vec<u64>> {
        let mut blocks = Vec::new();
        let mut block = first_block;
        while block != NIL {
            blocks.push(block);
            block = self.dynamic(kind, block)?.next_block;
        }
        Ok(blocks)
    }

    // === Token tables ===

    /// Look up a relationship type id by name.
    pub fn rel_type_id(&self, name: &str) -> Option<u32> {
        self.rel_types.read().by_name.get(name).copied()
    }

    /// Look up a relationship type name by id.
    pub fn rel_type_name(&self, id: u32) -> Option<String> {
        self.rel_types.read().by_id.get(&id).cloned()
    }

    /// Look up a property key id by name.
    pub fn prop_key_id(&self, name: &str) -> Option<u32> {
        self.prop_keys.read().by_name.get(name).copied()
    }

    /// Look up a property key name by id.
    pub fn prop_key_name(&self, id: u32) -> Option<String> {
        self.prop_keys.read().by_id.get(&id).cloned()
    }

    // === Allocation ===

    /// The allocator for one id space.
    pub fn allocator(&self, kind: IdKind) -> &IdAllocator {
        match kind {
            IdKind::Node => &self.node_ids,
            IdKind::Relationship => &self.rel_ids,
            IdKind::Property => &self.prop_ids,
            IdKind::PropertyString => &self.string_ids,
            IdKind::PropertyArray => &self.array_ids,
            IdKind::RelationshipType => &self.rel_type_ids,
            IdKind::PropertyKey => &self.prop_key_ids,
        }
    }

    // === Mutation ===

    /// Apply one command: write the after-image at the command's id.
    ///
    /// Idempotent: commands are keyed by record id, so re-applying a
    /// transaction rewrites identical bytes. Allocator high-water marks are
    /// advanced past externally assigned ids; deletes feed the free-list.
    pub fn apply(&self, command: &GraphCommand) -> Result<()> {
        self.check_writable()?;
        let mut files = self.files.write();

        fn write_record(
            file: &mut RecordFile,
            id: u64,
            buf: &[u8],
        ) -> Result<bool> {
            let mut prev = vec![0u8; buf.len()];
            file.read(id, &mut prev)?;
            file.write(id, buf)?;
            Ok(prev[0] != 0)
        }

        match command {
            GraphCommand::Node { id, after, .. } => {
                let mut buf = [0u8; NodeRecord::SIZE];
                after.write_to(&mut buf);
                let was_in_use = write_record(&mut files.nodes, *id, &buf)?;
                self.track_allocation(IdKind::Node, *id, was_in_use, after.in_use);
            }
            GraphCommand::Relationship { id, after, .. } => {
                let mut buf = [0u8; RelationshipRecord::SIZE];
                after.write_to(&mut buf);
                let was_in_use = write_record(&mut files.relationships, *id, &buf)?;
                self.track_allocation(IdKind::Relationship, *id, was_in_use, after.in_use);
            }
            GraphCommand::Property { id, after, .. } => {
                let mut buf = [0u8; PropertyRecord::SIZE];
                after.write_to(&mut buf);
                let was_in_use = write_record(&mut files.properties, *id, &buf)?;
                self.track_allocation(IdKind::Property, *id, was_in_use, after.in_use);
            }
            GraphCommand::Dynamic {
                kind, id, after, ..
            } => {
                let mut buf = [0u8; DynamicRecord::SIZE];
                after.write_to(&mut buf);
                let (file, id_kind) = match kind {
                    DynamicStoreKind::Strings => (&mut files.strings, IdKind::PropertyString),
                    DynamicStoreKind::Arrays => (&mut files.arrays, IdKind::PropertyArray),
                };
                let was_in_use = write_record(file, *id, &buf)?;
                self.track_allocation(id_kind, *id, was_in_use, after.in_use);
            }
            GraphCommand::Token {
                kind,
                id,
                after,
                name,
            } => {
                let mut buf = [0u8; TokenRecord::SIZE];
                after.write_to(&mut buf);
                let (file, id_kind, table) = match kind {
                    TokenStoreKind::RelationshipType => {
                        (&mut files.rel_types, IdKind::RelationshipType, &self.rel_types)
                    }
                    TokenStoreKind::PropertyKey => {
                        (&mut files.prop_keys, IdKind::PropertyKey, &self.prop_keys)
                    }
                };
                file.write(*id, &buf)?;
                self.allocator(id_kind).note_used(*id);
                table.write().insert(*id as u32, name.clone());
            }
        }
        Ok(())
    }

    /// Keep an allocator consistent with an applied after-image.
    ///
    /// Creation moves the high-water mark past externally assigned ids;
    /// deletion reclaims the id, but only on a live→free transition, so
    /// that re-applying a delete never double-feeds the free-list.
    fn track_allocation(&self, kind: IdKind, id: u64, was_in_use: bool, in_use: bool) {
        let allocator = self.allocator(kind);
        if in_use {
            allocator.note_used(id);
        } else if was_in_use {
            allocator.release(id);
        }
    }

    // === Lifecycle ===

    /// Flush every file to stable storage.
    pub fn flush_all(&self) -> Result<()> {
        let mut files = self.files.write();
        files.nodes.flush()?;
        files.relationships.flush()?;
        files.properties.flush()?;
        files.strings.flush()?;
        files.arrays.flush()?;
        files.rel_types.flush()?;
        files.prop_keys.flush()?;
        drop(files);
        self.meta.lock().flush()?;
        Ok(())
    }

    /// Clean close: flush, persist allocators, mark the metadata clean.
    pub fn close(&self, last_committed_tx: TxId) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        {
            let mut files = self.files.write();
            files.nodes.close()?;
            files.relationships.close()?;
            files.properties.close()?;
            files.strings.close()?;
            files.arrays.close()?;
            files.rel_types.close()?;
            files.prop_keys.close()?;
        }
        for kind in IdKind::ALL {
            self.allocator(kind).close()?;
        }
        let mut meta = self.meta.lock();
        let mut long = [0u8; 8];
        LittleEndian::write_u64(&mut long, last_committed_tx.0);
        meta.write_at(META_LAST_TX, &long)?;
        meta.write_at(META_CLEAN, &[1])?;
        meta.flush()?;
        info!(last_tx = %last_committed_tx, "store closed cleanly");
        Ok(())
    }

    /// Every file belonging to this store, relative to the directory.
    ///
    /// This is the set a full store copy streams to a joining follower.
    pub fn store_files(&self) -> Vec<String> {
        let mut names = vec![META_FILE.to_string()];
        for base in [
            NODE_FILE,
            REL_FILE,
            PROP_FILE,
            STRINGS_FILE,
            ARRAYS_FILE,
            RELTYPE_FILE,
            PROPKEY_FILE,
        ] {
            names.push(base.to_string());
            names.push(format!("{}.id", base));
        }
        names
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TrellisError::ReadOnly);
        }
        Ok(())
    }

    fn load_tokens(&self) -> Result<()> {
        let load = |file_high: u64, kind: TokenStoreKind| -> Result<Vec<(u32, String)>> {
            let mut tokens = Vec::new();
            for id in 0..file_high {
                let mut buf = [0u8; TokenRecord::SIZE];
                {
                    let files = self.files.read();
                    let file = match kind {
                        TokenStoreKind::RelationshipType => &files.rel_types,
                        TokenStoreKind::PropertyKey => &files.prop_keys,
                    };
                    file.read(id, &mut buf)?;
                }
                let record = TokenRecord::read_from(&buf);
                if !record.in_use {
                    continue;
                }
                let name_bytes =
                    self.read_dynamic_chain(DynamicStoreKind::Strings, record.name_block)?;
                let name = String::from_utf8(name_bytes).map_err(|_| {
                    TrellisError::Corruption(format!("token {} name is not UTF-8", id))
                })?;
                tokens.push((id as u32, name));
            }
            Ok(tokens)
        };

        let (rel_high, key_high) = {
            let files = self.files.read();
            (files.rel_types.high_id(), files.prop_keys.high_id())
        };

        for (id, name) in load(rel_high, TokenStoreKind::RelationshipType)? {
            self.rel_types.write().insert(id, name);
        }
        for (id, name) in load(key_high, TokenStoreKind::PropertyKey)? {
            self.prop_keys.write().insert(id, name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> GraphStore {
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
    fn create_and_reopen_preserves_identity() {
        let dir = tempdir().unwrap();
        let store_id = {
            let store = open(dir.path());
            assert!(!store.pre_existing());
            store.close(TxId::ZERO).unwrap();
            store.store_id()
        };

        let store = open(dir.path());
        assert!(store.pre_existing());
        assert_eq!(store.store_id(), store_id);
    }

    #[test]
    fn apply_node_command_and_read_back() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let id = store.allocator(IdKind::Node).next();
        store
            .apply(&GraphCommand::Node {
                id,
                before: NodeRecord::EMPTY,
                after: NodeRecord::new(),
            })
            .unwrap();

        let record = store.node(id).unwrap();
        assert!(record.in_use);
        assert_eq!(record.first_rel, NIL);
    }

    #[test]
    fn apply_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let command = GraphCommand::Node {
            id: 3,
            before: NodeRecord::EMPTY,
            after: NodeRecord::new(),
        };
        store.apply(&command).unwrap();
        let first = store.node(3).unwrap();
        store.apply(&command).unwrap();
        assert_eq!(store.node(3).unwrap(), first);
    }

    #[test]
    fn apply_tracks_remote_ids() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        // Apply a command with an id this store never allocated
        store
            .apply(&GraphCommand::Node {
                id: 9,
                before: NodeRecord::EMPTY,
                after: NodeRecord::new(),
            })
            .unwrap();

        // Local allocation must not reuse ids at or below it
        assert_eq!(store.allocator(IdKind::Node).next(), 10);
    }

    #[test]
    fn delete_feeds_free_list() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let a = store.allocator(IdKind::Node).next();
        let _b = store.allocator(IdKind::Node).next();
        store
            .apply(&GraphCommand::Node {
                id: a,
                before: NodeRecord::EMPTY,
                after: NodeRecord::new(),
            })
            .unwrap();
        store
            .apply(&GraphCommand::Node {
                id: a,
                before: NodeRecord::new(),
                after: NodeRecord::EMPTY,
            })
            .unwrap();

        assert_eq!(store.allocator(IdKind::Node).next(), a);
    }

    #[test]
    fn token_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            let block = store.allocator(IdKind::PropertyString).next();
            let token_id = store.allocator(IdKind::RelationshipType).next();
            store
                .apply(&GraphCommand::Dynamic {
                    kind: DynamicStoreKind::Strings,
                    id: block,
                    before: DynamicRecord::empty(),
                    after: DynamicRecord {
                        in_use: true,
                        next_block: NIL,
                        data: b"KNOWS".to_vec(),
                    },
                })
                .unwrap();
            store
                .apply(&GraphCommand::Token {
                    kind: TokenStoreKind::RelationshipType,
                    id: token_id,
                    after: TokenRecord {
                        in_use: true,
                        name_block: block,
                    },
                    name: "KNOWS".to_string(),
                })
                .unwrap();
            assert_eq!(store.rel_type_id("KNOWS"), Some(token_id as u32));
            store.close(TxId::ZERO).unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.rel_type_id("KNOWS"), Some(0));
        assert_eq!(store.rel_type_name(0).as_deref(), Some("KNOWS"));
    }

    #[test]
    fn metadata_roundtrip() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set_log_version(4).unwrap();
            store.close(TxId(17)).unwrap();
        }

        let store = open(dir.path());
        let meta = store.metadata().unwrap();
        assert_eq!(meta.log_version, 4);
        assert_eq!(meta.last_committed_tx, TxId(17));
        // Reopening marks the store dirty until the next clean close
        assert!(!meta.clean_shutdown);
    }

    #[test]
    fn unclean_shutdown_is_detected() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.flush_all().unwrap();
            // Dropped without close()
        }

        let store = open(dir.path());
        assert!(!store.metadata().unwrap().clean_shutdown);
    }

    #[test]
    fn dynamic_chain_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let payload = vec![0xABu8; DynamicRecord::DATA_SIZE * 2 + 5];
        let blocks: Vec<u64> = (0..DynamicRecord::blocks_for(payload.len()))
            .map(|_| store.allocator(IdKind::PropertyArray).next())
            .collect();
        for (id, record) in DynamicRecord::chain_from_bytes(&payload, &blocks) {
            store
                .apply(&GraphCommand::Dynamic {
                    kind: DynamicStoreKind::Arrays,
                    id,
                    before: DynamicRecord::empty(),
                    after: record,
                })
                .unwrap();
        }

        let read = store
            .read_dynamic_chain(DynamicStoreKind::Arrays, blocks[0])
            .unwrap();
        assert_eq!(read, payload);
        assert_eq!(
            store
                .dynamic_chain_blocks(DynamicStoreKind::Arrays, blocks[0])
                .unwrap(),
            blocks
        );
    }
}
