//! Seams between the kernel and the replication layer.
//!
//! A *data source* is a named recoverable resource participating in
//! transactions: the graph store always, secondary indexes optionally. The
//! replication layer only ever speaks to data sources through this trait,
//! which is what lets a follower apply a primary's command stream without
//! knowing what kind of resource produced it.

use crate::error::Result;
use crate::types::{Epoch, IdKind, TxId};

/// One committed transaction as shipped between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTx {
    /// Global transaction id assigned by the primary.
    pub tx_id: TxId,
    /// Epoch of the primary that committed it.
    pub epoch: Epoch,
    /// Encoded command stream, opaque to everything but the owning source.
    pub commands: Vec<u8>,
}

/// A named recoverable resource with transferable history.
pub trait DataSource: Send + Sync {
    /// Registry name of this resource.
    fn name(&self) -> &str;

    /// Highest transaction id applied by this source.
    fn last_committed_tx_id(&self) -> TxId;

    /// Apply a transaction committed elsewhere.
    ///
    /// Must be idempotent, and must refuse gaps: applying `N + 2` while the
    /// source is at `N` fails with `TxGap`. Re-applying an id at or below
    /// `last_committed_tx_id()` is a no-op.
    fn apply_committed(&self, tx: &CommittedTx) -> Result<()>;

    /// History strictly after `from`, in tx-id order.
    fn extract(&self, from: TxId) -> Result<Vec<CommittedTx>>;

    /// Epoch of the primary that committed `tx_id` on this source.
    fn master_epoch_for(&self, tx_id: TxId) -> Result<Epoch>;

    /// Reset the applied-through watermark (recovery and store-copy only).
    fn set_last_committed(&self, tx_id: TxId) -> Result<()>;
}

/// Per-transaction participation of one data source in two-phase commit.
///
/// The coordinator drives every enlisted resource through
/// prepare → commit (or rollback); a resource is enlisted at most once per
/// transaction.
pub trait ResourceTx: Send {
    /// Flush accumulated commands to the log and force it durable.
    fn prepare(&mut self) -> Result<()>;

    /// Write the COMMIT record and apply to the store. Returns the assigned
    /// global transaction id.
    fn commit(&mut self) -> Result<TxId>;

    /// Discard accumulated commands. Writes a rollback record when PREPARE
    /// already happened.
    fn rollback(&mut self) -> Result<()>;

    /// True when the transaction produced no commands on this source.
    fn is_read_only(&self) -> bool;
}

/// A contiguous range of reserved ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    /// First id in the range.
    pub start: u64,
    /// Number of ids reserved.
    pub length: u64,
}

impl IdRange {
    /// Iterate the ids in this range.
    pub fn iter(&self) -> impl Iterator<Item = u64> {
        self.start..self.start + self.length
    }
}

/// Where a transaction gets its record ids from.
///
/// The primary allocates locally from the store's allocators; a follower
/// reserves ranges from the primary and hands them out until exhausted.
pub trait IdSource: Send + Sync {
    /// Next free id of the given kind.
    fn next(&self, kind: IdKind) -> Result<u64>;

    /// Return an id to the free-list (local allocation only; remote ranges
    /// are simply abandoned).
    fn release(&self, kind: IdKind, id: u64);

    /// Drop any cached reservations. Called when the primary epoch changes,
    /// since ranges reserved under an old primary may be reissued by the
    /// new one.
    fn invalidate(&self);
}
