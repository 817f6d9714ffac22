//! Recovery scan: grouping raw entries into transactions.
//!
//! A forward pass over a log file yields entries of interleaved
//! transactions. Grouping them by file-local id gives, per transaction,
//! its command frames and its outcome:
//!
//! - COMMIT present → replay candidate (in COMMIT order, which is tx-id
//!   order: commits are serialized)
//! - ROLLBACK present, or no COMMIT → discard
//! - COMMIT present but DONE missing → replay exactly as above; applying
//!   commands is idempotent, so a half-applied transaction converges

use crate::entry::LogEntry;
use std::collections::HashMap;
use trellis_core::{Epoch, TxId};

/// One committed transaction reconstructed from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTx {
    /// File-local transaction id.
    pub local_id: u32,
    /// Assigned global transaction id.
    pub tx_id: TxId,
    /// Epoch of the committing primary.
    pub epoch: Epoch,
    /// Commit timestamp (milliseconds since the epoch).
    pub timestamp: u64,
    /// Command frames in append order.
    pub command_frames: Vec<Vec<u8>>,
    /// Whether the DONE entry was written.
    pub done: bool,
}

/// Group a file's entries into committed transactions plus a discard count.
///
/// Committed transactions are returned in COMMIT order.
pub fn collect_transactions(entries: &[LogEntry]) -> (Vec<RecoveredTx>, usize) {
    struct Pending {
        frames: Vec<Vec<u8>>,
        rolled_back: bool,
    }

    let mut pending: HashMap<u32, Pending> = HashMap::new();
    let mut committed: Vec<RecoveredTx> = Vec::new();
    let mut discarded = 0usize;

    for entry in entries {
        match entry {
            LogEntry::Start { local_id } => {
                pending.insert(
                    *local_id,
                    Pending {
                        frames: Vec::new(),
                        rolled_back: false,
                    },
                );
            }
            LogEntry::Command { local_id, bytes } => {
                if let Some(tx) = pending.get_mut(local_id) {
                    tx.frames.push(bytes.clone());
                }
            }
            LogEntry::Prepare { .. } => {}
            LogEntry::Commit {
                local_id,
                tx_id,
                epoch,
                timestamp,
            } => {
                if let Some(tx) = pending.remove(local_id) {
                    committed.push(RecoveredTx {
                        local_id: *local_id,
                        tx_id: *tx_id,
                        epoch: *epoch,
                        timestamp: *timestamp,
                        command_frames: tx.frames,
                        done: false,
                    });
                }
            }
            LogEntry::Done { local_id } => {
                if let Some(tx) = committed.iter_mut().rev().find(|t| t.local_id == *local_id) {
                    tx.done = true;
                }
            }
            LogEntry::Rollback { local_id } => {
                if pending.remove(local_id).is_some() {
                    discarded += 1;
                }
            }
        }
    }

    // Whatever is still pending never committed: crash before COMMIT.
    discarded += pending.len();

    (committed, discarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(local_id: u32, tx_id: u64) -> LogEntry {
        LogEntry::Commit {
            local_id,
            tx_id: TxId(tx_id),
            epoch: Epoch(1),
            timestamp: 0,
        }
    }

    #[test]
    fn committed_transaction_is_collected() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![1],
            },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![2],
            },
            LogEntry::Prepare { local_id: 1 },
            commit(1, 10),
            LogEntry::Done { local_id: 1 },
        ];

        let (committed, discarded) = collect_transactions(&entries);
        assert_eq!(discarded, 0);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].tx_id, TxId(10));
        assert_eq!(committed[0].command_frames, vec![vec![1], vec![2]]);
        assert!(committed[0].done);
    }

    #[test]
    fn missing_commit_is_discarded() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![1],
            },
            LogEntry::Prepare { local_id: 1 },
            // crash: no COMMIT
        ];

        let (committed, discarded) = collect_transactions(&entries);
        assert!(committed.is_empty());
        assert_eq!(discarded, 1);
    }

    #[test]
    fn rollback_is_discarded() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![1],
            },
            LogEntry::Prepare { local_id: 1 },
            LogEntry::Rollback { local_id: 1 },
        ];

        let (committed, discarded) = collect_transactions(&entries);
        assert!(committed.is_empty());
        assert_eq!(discarded, 1);
    }

    #[test]
    fn missing_done_still_replays() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![1],
            },
            LogEntry::Prepare { local_id: 1 },
            commit(1, 5),
            // crash before DONE
        ];

        let (committed, _) = collect_transactions(&entries);
        assert_eq!(committed.len(), 1);
        assert!(!committed[0].done);
    }

    #[test]
    fn interleaved_transactions_group_correctly() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            LogEntry::Start { local_id: 2 },
            LogEntry::Command {
                local_id: 2,
                bytes: vec![2],
            },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![1],
            },
            LogEntry::Prepare { local_id: 2 },
            commit(2, 7),
            LogEntry::Done { local_id: 2 },
            LogEntry::Prepare { local_id: 1 },
            commit(1, 8),
            LogEntry::Done { local_id: 1 },
        ];

        let (committed, discarded) = collect_transactions(&entries);
        assert_eq!(discarded, 0);
        assert_eq!(committed.len(), 2);
        // COMMIT order, not START order
        assert_eq!(committed[0].tx_id, TxId(7));
        assert_eq!(committed[1].tx_id, TxId(8));
    }

    #[test]
    fn local_id_reuse_after_done_resolves_to_latest() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            commit(1, 3),
            LogEntry::Done { local_id: 1 },
            LogEntry::Start { local_id: 1 },
            commit(1, 4),
            LogEntry::Done { local_id: 1 },
        ];

        let (committed, _) = collect_transactions(&entries);
        assert_eq!(committed.len(), 2);
        assert!(committed[0].done);
        assert!(committed[1].done);
    }
}
