//! The graph store as a replicated data source.
//!
//! `GraphDataSource` owns the pairing of store and logical log and
//! serializes commits: id assignment, the COMMIT record, and the store
//! apply happen under one latch, so transaction ids form a single total
//! order and apply order equals commit order on every replica.
//!
//! `GraphResourceTx` is the per-transaction participant the coordinator
//! drives through prepare → commit.

use crate::now_millis;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use trellis_core::{
    CommittedTx, DataSource, Epoch, ResourceTx, Result, TrellisError, TxId, RESOURCE_GRAPH,
};
use trellis_store::{decode_command, encode_command, GraphCommand, GraphStore};
use trellis_wal::{unpack_frames, LogicalLog};

/// The graph store's data-source implementation.
pub struct GraphDataSource {
    store: Arc<GraphStore>,
    log: Arc<LogicalLog>,
    last_committed: AtomicU64,
    /// Epoch stamped into locally committed transactions. `Epoch::NONE`
    /// in standalone mode; the supervisor sets it on every role change.
    epoch: AtomicU64,
    commit_latch: Mutex<()>,
}

impl GraphDataSource {
    /// Wrap an opened store and log; `last_committed` comes from recovery.
    pub fn new(store: Arc<GraphStore>, log: Arc<LogicalLog>, last_committed: TxId) -> Arc<Self> {
        Arc::new(GraphDataSource {
            store,
            log,
            last_committed: AtomicU64::new(last_committed.0),
            epoch: AtomicU64::new(Epoch::NONE.0),
            commit_latch: Mutex::new(()),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// The underlying logical log.
    pub fn log(&self) -> &Arc<LogicalLog> {
        &self.log
    }

    /// Epoch this source stamps into local commits.
    pub fn current_epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::SeqCst))
    }

    /// Set the commit epoch (role transitions only).
    pub fn set_current_epoch(&self, epoch: Epoch) {
        self.epoch.store(epoch.0, Ordering::SeqCst);
    }

    /// Commit a prepared transaction locally: assign the next id, write
    /// COMMIT, apply to the store, write DONE.
    fn commit_local(&self, local_id: u32, commands: &[GraphCommand]) -> Result<TxId> {
        let _latch = self.commit_latch.lock();
        let tx_id = TxId(self.last_committed.load(Ordering::SeqCst)).next();
        let epoch = self.current_epoch();

        self.log
            .append_commit(local_id, tx_id, epoch, now_millis())?;
        for command in commands {
            self.store.apply(command)?;
        }
        self.log.append_done(local_id)?;
        self.last_committed.store(tx_id.0, Ordering::SeqCst);
        debug!(tx_id = %tx_id, epoch = %epoch, commands = commands.len(), "committed");
        Ok(tx_id)
    }

    /// Run `f` with commits blocked.
    ///
    /// Store copy uses this to stream a consistent snapshot: no COMMIT can
    /// land between the flush and the end of the copy.
    pub fn with_commits_blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _latch = self.commit_latch.lock();
        f()
    }

    /// Rotate the log when due. The store is flushed first so rotated
    /// history never needs rescanning.
    pub fn housekeeping(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        if let Some(new_version) = self.log.maybe_rotate(|| store.flush_all())? {
            self.store.set_log_version(new_version)?;
        }
        Ok(())
    }

    /// Prune retained log history every follower has applied through.
    pub fn prune_history(&self, applied_through: TxId) -> Result<usize> {
        self.log.prune_retained(applied_through)
    }
}

impl DataSource for GraphDataSource {
    fn name(&self) -> &str {
        RESOURCE_GRAPH
    }

    fn last_committed_tx_id(&self) -> TxId {
        TxId(self.last_committed.load(Ordering::SeqCst))
    }

    fn apply_committed(&self, tx: &CommittedTx) -> Result<()> {
        let _latch = self.commit_latch.lock();
        let last = TxId(self.last_committed.load(Ordering::SeqCst));

        if tx.tx_id <= last {
            // Already applied; idempotent no-op.
            return Ok(());
        }
        if tx.tx_id != last.next() {
            return Err(TrellisError::TxGap {
                resource: RESOURCE_GRAPH.to_string(),
                expected: last.next(),
                got: tx.tx_id,
            });
        }

        let frames = unpack_frames(&tx.commands)?;
        let local_id = self.log.append_prepared(&frames)?;
        self.log
            .append_commit(local_id, tx.tx_id, tx.epoch, now_millis())?;
        for frame in &frames {
            let command = decode_command(frame)?;
            self.store.apply(&command)?;
        }
        self.log.append_done(local_id)?;
        self.last_committed.store(tx.tx_id.0, Ordering::SeqCst);
        debug!(tx_id = %tx.tx_id, epoch = %tx.epoch, "applied replicated transaction");
        Ok(())
    }

    fn extract(&self, from: TxId) -> Result<Vec<CommittedTx>> {
        self.log.extract(from)
    }

    fn master_epoch_for(&self, tx_id: TxId) -> Result<Epoch> {
        self.log.master_epoch_for(tx_id)
    }

    fn set_last_committed(&self, tx_id: TxId) -> Result<()> {
        self.last_committed.store(tx_id.0, Ordering::SeqCst);
        self.store.set_last_committed_tx(tx_id)?;
        info!(tx_id = %tx_id, "reset applied-through watermark");
        Ok(())
    }
}

/// Per-transaction graph participant in two-phase commit.
pub struct GraphResourceTx {
    source: Arc<GraphDataSource>,
    commands: Vec<GraphCommand>,
    local_id: Option<u32>,
}

impl GraphResourceTx {
    /// Wrap a transaction's accumulated commands.
    pub fn new(source: Arc<GraphDataSource>, commands: Vec<GraphCommand>) -> GraphResourceTx {
        GraphResourceTx {
            source,
            commands,
            local_id: None,
        }
    }
}

impl ResourceTx for GraphResourceTx {
    fn prepare(&mut self) -> Result<()> {
        let frames: Vec<Vec<u8>> = self
            .commands
            .iter()
            .map(encode_command)
            .collect::<Result<_>>()?;
        self.local_id = Some(self.source.log().append_prepared(&frames)?);
        Ok(())
    }

    fn commit(&mut self) -> Result<TxId> {
        let local_id = self.local_id.ok_or_else(|| {
            TrellisError::InvalidOperation("commit before prepare".to_string())
        })?;
        let tx_id = self.source.commit_local(local_id, &self.commands)?;
        if let Err(e) = self.source.housekeeping() {
            warn!(error = %e, "log rotation failed; will retry on a later commit");
        }
        Ok(tx_id)
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(local_id) = self.local_id.take() {
            self.source.log().append_rollback(local_id)?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.commands.is_empty()
    }
}
