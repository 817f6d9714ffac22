//! Unified error type with kind classification.
//!
//! Errors cross several layers (store, log, coordinator, RPC), and the
//! lifecycle supervisor decides what to do purely from the error *kind*:
//! transient communication failures trigger re-election, branched data
//! triggers quarantine, fatal errors shut the engine down. `TrellisError`
//! therefore carries enough structure for that match without stringly-typed
//! inspection.

use crate::store_id::StoreId;
use crate::types::{Epoch, TxId};
use std::io;
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TrellisError>;

/// Coarse classification used by the lifecycle supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller error: invalid input, read-only store, missing entity.
    Client,
    /// The transaction failed but may be retried (deadlock abort, conflict,
    /// primary changed mid-flight).
    TransientTx,
    /// RPC or coordination-service failure; retried with backoff, then
    /// escalated to re-election.
    Communication,
    /// The elected primary is gone or unknown.
    PrimaryLost,
    /// Divergent history detected; the local store must be quarantined.
    BranchedData,
    /// Unrecoverable: corrupted header, foreign store, poisoned engine.
    Fatal,
}

/// Error type for all Trellis operations.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// I/O failure in the store or logical log.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Store file header or log entry failed validation.
    #[error("corrupted store: {0}")]
    Corruption(String),

    /// The store being opened belongs to a different cluster.
    #[error("store id mismatch: local {local}, remote {remote}")]
    ForeignStore {
        /// Identity of the local store.
        local: StoreId,
        /// Identity presented by the peer (or expected by the cluster).
        remote: StoreId,
    },

    /// A write was attempted on a read-only engine.
    #[error("store is read-only")]
    ReadOnly,

    /// Requested record does not exist or is not in use.
    #[error("{what} {id} not found")]
    NotFound {
        /// Entity class ("node", "relationship", ...).
        what: &'static str,
        /// The missing id.
        id: u64,
    },

    /// Invalid use of the API (no active transaction, double commit, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// This transaction was chosen as the deadlock victim.
    #[error("deadlock detected, transaction {victim} aborted")]
    Deadlock {
        /// Local serial number of the aborted transaction.
        victim: u64,
    },

    /// Prepare or commit failed; the transaction was rolled back.
    #[error("transaction failed: {0}")]
    TxFailure(String),

    /// Command stream could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// RPC timeout, broken connection, or coordination-service failure.
    #[error("communication failure: {0}")]
    Communication(String),

    /// No primary is currently known for the cluster.
    #[error("primary lost: {0}")]
    PrimaryLost(String),

    /// Divergent history: same tx id committed under different epochs.
    #[error(
        "branched data on resource '{resource}' at tx {tx_id}: \
         local epoch {local_epoch}, primary epoch {primary_epoch}"
    )]
    BranchedData {
        /// Resource on which the divergence was detected.
        resource: String,
        /// Highest common transaction id.
        tx_id: TxId,
        /// Epoch recorded locally for that transaction.
        local_epoch: Epoch,
        /// Epoch recorded by the primary for that transaction.
        primary_epoch: Epoch,
    },

    /// A pulled stream skipped a transaction id.
    #[error("tx id gap on resource '{resource}': expected {expected}, got {got}")]
    TxGap {
        /// Resource whose sequence was broken.
        resource: String,
        /// The next id the replica can accept.
        expected: TxId,
        /// The id that actually arrived.
        got: TxId,
    },

    /// The engine was shut down; the recorded cause poisons later calls.
    #[error("engine is shut down: {0}")]
    Shutdown(String),
}

impl TrellisError {
    /// Classify this error for the supervisor's transition logic.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrellisError::Config(_)
            | TrellisError::ReadOnly
            | TrellisError::NotFound { .. }
            | TrellisError::InvalidOperation(_) => ErrorKind::Client,
            TrellisError::Deadlock { .. } | TrellisError::TxFailure(_) => ErrorKind::TransientTx,
            TrellisError::Communication(_) | TrellisError::TxGap { .. } => ErrorKind::Communication,
            TrellisError::PrimaryLost(_) => ErrorKind::PrimaryLost,
            TrellisError::BranchedData { .. } => ErrorKind::BranchedData,
            TrellisError::Io(_)
            | TrellisError::Corruption(_)
            | TrellisError::ForeignStore { .. }
            | TrellisError::Serialization(_)
            | TrellisError::Shutdown(_) => ErrorKind::Fatal,
        }
    }

    /// True when retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientTx | ErrorKind::Communication | ErrorKind::PrimaryLost
        )
    }

    /// Shorthand for a serialization failure from any codec.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        TrellisError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_supervisor_expectations() {
        assert_eq!(
            TrellisError::Communication("timeout".into()).kind(),
            ErrorKind::Communication
        );
        assert_eq!(
            TrellisError::BranchedData {
                resource: "graph".into(),
                tx_id: TxId(9),
                local_epoch: Epoch(2),
                primary_epoch: Epoch(3),
            }
            .kind(),
            ErrorKind::BranchedData
        );
        assert_eq!(
            TrellisError::Corruption("bad magic".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(TrellisError::ReadOnly.kind(), ErrorKind::Client);
    }

    #[test]
    fn retryable_kinds() {
        assert!(TrellisError::Deadlock { victim: 3 }.is_retryable());
        assert!(TrellisError::PrimaryLost("view change".into()).is_retryable());
        assert!(!TrellisError::ReadOnly.is_retryable());
        assert!(!TrellisError::Corruption("x".into()).is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = TrellisError::TxGap {
            resource: "graph".into(),
            expected: TxId(5),
            got: TxId(7),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 5"));
        assert!(msg.contains("got 7"));
    }
}
