//! The coordination-service abstraction.
//!
//! Election wants very little from the outside world: a strongly
//! consistent membership store with ephemeral registrations and sequential
//! ordering. The smallest live sequence number wins primary: ties are
//! impossible because sequence numbers are unique by construction. The
//! epoch advances exactly when the computed primary changes, so at most
//! one primary exists per epoch.
//!
//! [`LocalCoordination`] implements the contract in process memory. Every
//! engine embedded in the same process shares one handle; tests model a
//! crash by revoking a registration and a partition the same way.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_core::{Epoch, MachineId, Result, StoreId, TrellisError};

/// What a member publishes about itself when registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Configured unique machine id.
    pub machine_id: MachineId,
    /// `host:port` the member serves followers on.
    pub address: String,
    /// Identity of the member's store.
    pub store_id: StoreId,
    /// Backup slaves replicate but never stand for election.
    pub backup_only: bool,
}

/// A raw, strongly consistent view of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawView {
    /// Current epoch; advances on every primary change.
    pub epoch: Epoch,
    /// Sequence number of the elected primary, if any member is eligible.
    pub primary_seq: Option<u64>,
    /// Live registrations, ascending sequence.
    pub members: Vec<(u64, MemberInfo)>,
}

/// Callback invoked (on the mutating thread) after every view change.
pub type ViewListener = Arc<dyn Fn() + Send + Sync>;

/// A strongly consistent membership store with ephemeral, sequentially
/// ordered registrations.
pub trait CoordinationStore: Send + Sync {
    /// Register a member; returns its unique, monotonically increasing
    /// sequence number. The registration is ephemeral: it exists until
    /// revoked.
    fn register(&self, cluster: &str, member: MemberInfo) -> Result<u64>;

    /// Revoke a registration (clean leave or simulated crash/partition).
    fn revoke(&self, cluster: &str, seq: u64) -> Result<()>;

    /// The current view.
    fn view(&self, cluster: &str) -> Result<RawView>;

    /// Atomically agree on the cluster's store identity. The first
    /// proposal wins; every caller gets the winner back.
    fn propose_store_id(&self, cluster: &str, store_id: StoreId) -> Result<StoreId>;

    /// Subscribe to view changes.
    fn subscribe(&self, cluster: &str, listener: ViewListener);
}

#[derive(Default)]
struct ClusterState {
    next_seq: u64,
    members: Vec<(u64, MemberInfo)>,
    epoch: u64,
    primary_seq: Option<u64>,
    store_id: Option<StoreId>,
    listeners: Vec<ViewListener>,
}

impl ClusterState {
    /// Recompute the primary; bump the epoch when it changed.
    fn reelect(&mut self, cluster: &str) {
        let new_primary = self
            .members
            .iter()
            .filter(|(_, m)| !m.backup_only)
            .map(|(seq, _)| *seq)
            .min();
        if new_primary != self.primary_seq {
            self.primary_seq = new_primary;
            if new_primary.is_some() {
                self.epoch += 1;
                info!(
                    cluster,
                    epoch = self.epoch,
                    primary_seq = ?new_primary,
                    "elected new primary"
                );
            }
        }
    }

    fn view(&self) -> RawView {
        RawView {
            epoch: Epoch(self.epoch),
            primary_seq: self.primary_seq,
            members: self.members.clone(),
        }
    }
}

/// In-process implementation of [`CoordinationStore`].
#[derive(Default)]
pub struct LocalCoordination {
    clusters: Mutex<HashMap<String, ClusterState>>,
}

impl LocalCoordination {
    /// A fresh coordination handle, shared by every engine in the process.
    pub fn new() -> Arc<LocalCoordination> {
        Arc::new(LocalCoordination::default())
    }

    fn with_cluster<R>(
        &self,
        cluster: &str,
        f: impl FnOnce(&mut ClusterState) -> R,
    ) -> (R, Vec<ViewListener>) {
        let mut clusters = self.clusters.lock();
        let state = clusters.entry(cluster.to_string()).or_default();
        let result = f(state);
        let listeners = state.listeners.clone();
        (result, listeners)
    }
}

impl CoordinationStore for LocalCoordination {
    fn register(&self, cluster: &str, member: MemberInfo) -> Result<u64> {
        let (seq, listeners) = self.with_cluster(cluster, |state| {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.members.push((seq, member));
            state.reelect(cluster);
            seq
        });
        debug!(cluster, seq, "member registered");
        for listener in listeners {
            listener();
        }
        Ok(seq)
    }

    fn revoke(&self, cluster: &str, seq: u64) -> Result<()> {
        let (existed, listeners) = self.with_cluster(cluster, |state| {
            let before = state.members.len();
            state.members.retain(|(s, _)| *s != seq);
            let existed = state.members.len() != before;
            if existed {
                state.reelect(cluster);
            }
            existed
        });
        if !existed {
            return Err(TrellisError::InvalidOperation(format!(
                "registration {} is not live",
                seq
            )));
        }
        debug!(cluster, seq, "member revoked");
        for listener in listeners {
            listener();
        }
        Ok(())
    }

    fn view(&self, cluster: &str) -> Result<RawView> {
        let (view, _) = self.with_cluster(cluster, |state| state.view());
        Ok(view)
    }

    fn propose_store_id(&self, cluster: &str, store_id: StoreId) -> Result<StoreId> {
        let (agreed, _) = self.with_cluster(cluster, |state| {
            *state.store_id.get_or_insert(store_id)
        });
        Ok(agreed)
    }

    fn subscribe(&self, cluster: &str, listener: ViewListener) {
        self.with_cluster(cluster, |state| state.listeners.push(listener));
    }
}
