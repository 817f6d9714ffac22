//! The write path seam.
//!
//! Every write-producing operation needs three things: record ids, locks,
//! and a way to commit. On a standalone engine or a primary those are the
//! local allocators, the local lock manager, and local two-phase commit.
//! On a follower all three round-trip through the primary. The engine
//! holds one `Arc<dyn WritePath>` the supervisor swaps on role
//! transitions; operations never know which configuration they run in.

use crate::source::{GraphDataSource, GraphResourceTx};
use std::sync::Arc;
use trellis_core::{IdKind, Result, TxId, RESOURCE_GRAPH};
use trellis_store::GraphCommand;
use trellis_txn::{ResourceKey, Transaction, TransactionManager};

/// Ids, locks, and commit for write transactions.
pub trait WritePath: Send + Sync {
    /// Allocate the next id of `kind`.
    fn next_id(&self, kind: IdKind) -> Result<u64>;

    /// Return an unused id after a rollback.
    fn release_id(&self, kind: IdKind, id: u64);

    /// Take a write lock on `key` for transaction `serial`.
    fn lock(&self, serial: u64, key: ResourceKey) -> Result<()>;

    /// Commit the transaction's accumulated graph commands. Returns the
    /// assigned transaction id, or `None` for a read-only transaction.
    fn commit(&self, tx: &mut Transaction, commands: Vec<GraphCommand>) -> Result<Option<TxId>>;

    /// Abort the transaction, releasing whatever it held.
    fn abort(&self, tx: &mut Transaction) -> Result<()>;
}

/// The standalone / primary write path: everything local.
pub struct LocalWritePath {
    source: Arc<GraphDataSource>,
    manager: Arc<TransactionManager>,
}

impl LocalWritePath {
    /// Build the local path over the graph source and the coordinator.
    pub fn new(source: Arc<GraphDataSource>, manager: Arc<TransactionManager>) -> LocalWritePath {
        LocalWritePath { source, manager }
    }
}

impl WritePath for LocalWritePath {
    fn next_id(&self, kind: IdKind) -> Result<u64> {
        Ok(self.source.store().allocator(kind).next())
    }

    fn release_id(&self, kind: IdKind, id: u64) {
        self.source.store().allocator(kind).release(id);
    }

    fn lock(&self, serial: u64, key: ResourceKey) -> Result<()> {
        self.manager
            .locks()
            .acquire(serial, key, trellis_txn::LockMode::Write)
    }

    fn commit(&self, tx: &mut Transaction, commands: Vec<GraphCommand>) -> Result<Option<TxId>> {
        tx.enlist(
            RESOURCE_GRAPH,
            Box::new(GraphResourceTx::new(Arc::clone(&self.source), commands)),
        )?;
        self.manager.commit(tx)
    }

    fn abort(&self, tx: &mut Transaction) -> Result<()> {
        self.manager.rollback(tx)
    }
}
