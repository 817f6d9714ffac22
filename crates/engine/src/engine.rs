//! The engine handle: open, recover, serve.
//!
//! `GraphEngine::open` is the only way to get an engine; there is no
//! global instance registry. Opening runs recovery: the active logical log
//! is scanned forward, every committed transaction is replayed into the
//! store (idempotent), and everything without a COMMIT is discarded.
//!
//! Shutdown poisons the handle with its cause: every later call surfaces
//! `Shutdown(cause)` instead of touching closed files.

use crate::reader::{GraphReader, PropOwner};
use crate::source::GraphDataSource;
use crate::tx::GraphTx;
use crate::workspace::TxWorkspace;
use crate::write_path::{LocalWritePath, WritePath};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use trellis_core::{
    Config, DataSource, NodeId, PropertyValue, RelationshipId, Result, StoreId, TrellisError,
    TxId,
};
use trellis_store::{decode_command, GraphCommand, GraphStore, PageBackend, StoreOpenOptions};
use trellis_txn::{DataSourceFactory, DataSourceRegistry, LockManager, TransactionManager};
use trellis_wal::{LogOptions, LogicalLog};

/// How to open the store and its log.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Store file options.
    pub store: StoreOpenOptions,
    /// Logical log options.
    pub log: LogOptions,
}

impl EngineOptions {
    /// Derive options from configuration. `ha_mode` forces log retention.
    pub fn from_config(config: &Config, ha_mode: bool) -> EngineOptions {
        EngineOptions {
            store: StoreOpenOptions {
                backend: PageBackend::auto(config.use_memory_mapped_buffers),
                read_only: config.read_only,
            },
            log: LogOptions {
                keep_logical_logs: config.effective_keep_logical_logs(ha_mode),
                ..LogOptions::default()
            },
        }
    }
}

/// An open graph engine.
pub struct GraphEngine {
    dir: PathBuf,
    store: Arc<GraphStore>,
    source: Arc<GraphDataSource>,
    registry: Arc<DataSourceRegistry>,
    manager: Arc<TransactionManager>,
    local_path: Arc<LocalWritePath>,
    write_path: RwLock<Arc<dyn WritePath>>,
    poison: Mutex<Option<String>>,
    /// Empty overlay for committed-state reads.
    empty_ws: TxWorkspace,
}

impl GraphEngine {
    /// Open a store directory with only the graph data source.
    pub fn open(dir: &Path, options: EngineOptions) -> Result<Arc<GraphEngine>> {
        GraphEngine::open_with_sources(dir, options, Vec::new())
    }

    /// Open with additional data sources (secondary indexes), built from
    /// their factories after the graph source registers.
    pub fn open_with_sources(
        dir: &Path,
        options: EngineOptions,
        extra_sources: Vec<DataSourceFactory>,
    ) -> Result<Arc<GraphEngine>> {
        std::fs::create_dir_all(dir)?;
        let store = Arc::new(GraphStore::open(dir, options.store)?);
        let meta = store.metadata()?;

        let (log, recovered, discarded) = LogicalLog::open(dir, options.log)?;

        // Replay every committed transaction found in the active half.
        // Commands are keyed by record id, so re-applying what already
        // reached the store is a no-op.
        let mut replayed = 0usize;
        for tx in &recovered {
            for frame in &tx.command_frames {
                store.apply(&decode_command(frame)?)?;
            }
            replayed += 1;
        }
        if !store.opened_clean() || discarded > 0 {
            info!(
                replayed,
                discarded,
                clean = store.opened_clean(),
                "recovery complete"
            );
        }

        let last_committed = log.max_committed().max(meta.last_committed_tx);
        if !options.store.read_only {
            store.set_last_committed_tx(last_committed)?;
            store.set_log_version(log.log_version())?;
            if replayed > 0 {
                store.flush_all()?;
            }
        }

        let source = GraphDataSource::new(Arc::clone(&store), Arc::new(log), last_committed);

        let registry = Arc::new(DataSourceRegistry::new());
        registry.register(Arc::clone(&source) as Arc<dyn DataSource>)?;
        for factory in extra_sources {
            registry.register(factory()?)?;
        }

        let locks = Arc::new(LockManager::new());
        let manager = Arc::new(TransactionManager::new(locks, Arc::clone(&registry)));
        let local_path = Arc::new(LocalWritePath::new(
            Arc::clone(&source),
            Arc::clone(&manager),
        ));

        info!(
            dir = %dir.display(),
            store_id = %store.store_id(),
            last_tx = %last_committed,
            "engine open"
        );

        Ok(Arc::new(GraphEngine {
            dir: dir.to_path_buf(),
            store,
            source,
            registry,
            manager,
            write_path: RwLock::new(Arc::clone(&local_path) as Arc<dyn WritePath>),
            local_path,
            poison: Mutex::new(None),
            empty_ws: TxWorkspace::new(),
        }))
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The store.
    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    /// Immutable store identity.
    pub fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    /// The graph data source (also registered in the registry).
    pub fn source(&self) -> &Arc<GraphDataSource> {
        &self.source
    }

    /// The data-source registry.
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    /// The transaction coordinator.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// The always-local write path (used by the primary's RPC server
    /// regardless of the engine's own role).
    pub fn local_write_path(&self) -> Arc<LocalWritePath> {
        Arc::clone(&self.local_path)
    }

    /// Swap the write path (role transitions only).
    pub fn set_write_path(&self, path: Arc<dyn WritePath>) {
        *self.write_path.write() = path;
    }

    /// Restore the local write path (promotion to primary).
    pub fn set_local_write_path(&self) {
        *self.write_path.write() = Arc::clone(&self.local_path) as Arc<dyn WritePath>;
    }

    /// Highest transaction applied to the graph store.
    pub fn last_committed_tx(&self) -> TxId {
        self.source.last_committed_tx_id()
    }

    /// Begin a write transaction bound to the calling thread.
    pub fn begin(&self) -> Result<GraphTx<'_>> {
        self.check_open()?;
        let inner = self.manager.begin();
        let path = Arc::clone(&*self.write_path.read());
        Ok(GraphTx::new(self, inner, path))
    }

    /// Commit a command stream forwarded by a follower. Runs the local
    /// two-phase commit exactly like a local client write.
    pub fn commit_forwarded(&self, commands: Vec<GraphCommand>) -> Result<TxId> {
        self.check_open()?;
        self.check_writable()?;
        if commands.is_empty() {
            return Err(TrellisError::InvalidOperation(
                "forwarded transaction is empty".to_string(),
            ));
        }
        let mut tx = self.manager.begin();
        self.local_path
            .commit(&mut tx, commands)?
            .ok_or_else(|| TrellisError::InvalidOperation("forwarded commit was empty".into()))
    }

    // === Committed-state reads ===

    /// Read view over committed state.
    pub fn reader(&self) -> GraphReader<'_> {
        GraphReader::new(&self.store, &self.empty_ws)
    }

    /// Does this node exist?
    pub fn node_exists(&self, node: NodeId) -> Result<bool> {
        self.check_open()?;
        self.reader().node_exists(node)
    }

    /// Endpoints and type name of a relationship.
    pub fn relationship(&self, rel: RelationshipId) -> Result<(NodeId, NodeId, String)> {
        self.check_open()?;
        self.reader().relationship(rel)
    }

    /// All relationships of a node.
    pub fn relationships(&self, node: NodeId) -> Result<Vec<RelationshipId>> {
        self.check_open()?;
        self.reader().relationships(node)
    }

    /// A node property.
    pub fn node_property(&self, node: NodeId, key: &str) -> Result<Option<PropertyValue>> {
        self.check_open()?;
        self.reader().property(PropOwner::Node(node), key)
    }

    /// A relationship property.
    pub fn relationship_property(
        &self,
        rel: RelationshipId,
        key: &str,
    ) -> Result<Option<PropertyValue>> {
        self.check_open()?;
        self.reader().property(PropOwner::Relationship(rel), key)
    }

    /// All properties of a node.
    pub fn node_properties(&self, node: NodeId) -> Result<Vec<(String, PropertyValue)>> {
        self.check_open()?;
        self.reader().properties(PropOwner::Node(node))
    }

    // === Lifecycle ===

    /// Fail with the recorded cause when the engine has been shut down.
    pub fn check_open(&self) -> Result<()> {
        match &*self.poison.lock() {
            Some(cause) => Err(TrellisError::Shutdown(cause.clone())),
            None => Ok(()),
        }
    }

    /// Fail when the engine is read-only.
    pub fn check_writable(&self) -> Result<()> {
        if self.store.read_only() {
            return Err(TrellisError::ReadOnly);
        }
        Ok(())
    }

    /// Close log and store cleanly, poisoning the handle.
    ///
    /// `cause` is recorded for later callers; `None` means an orderly
    /// shutdown. Idempotent: the first call wins.
    pub fn shutdown(&self, cause: Option<String>) -> Result<()> {
        {
            let mut poison = self.poison.lock();
            if poison.is_some() {
                return Ok(());
            }
            *poison = Some(cause.unwrap_or_else(|| "engine shut down".to_string()));
        }
        if let Err(e) = self.source.log().close() {
            warn!(error = %e, "log close failed during shutdown");
        }
        self.store.close(self.source.last_committed_tx_id())?;
        info!("engine shut down");
        Ok(())
    }
}
