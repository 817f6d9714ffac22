//! The replication broker: this node's window onto the cluster.
//!
//! Wraps the coordination store with the node's own registration and
//! resolves raw views into machine ids and addresses. The broker holds no
//! role state: that belongs to the lifecycle supervisor.

use crate::coordination::{CoordinationStore, MemberInfo, RawView, ViewListener};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use trellis_core::{Epoch, MachineId, Result, StoreId, TrellisError};

/// A resolved cluster view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Current epoch.
    pub epoch: Epoch,
    /// The elected primary, if any.
    pub primary: Option<MachineId>,
    /// Every live member.
    pub members: Vec<MemberInfo>,
}

impl ClusterView {
    /// Address of a member, if live.
    pub fn address_of(&self, machine_id: MachineId) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.machine_id == machine_id)
            .map(|m| m.address.as_str())
    }

    /// Address of the current primary, if any.
    pub fn primary_address(&self) -> Option<&str> {
        self.primary.and_then(|p| self.address_of(p))
    }

    /// Store id of the current primary, if any.
    pub fn primary_store_id(&self) -> Option<StoreId> {
        self.primary.and_then(|p| {
            self.members
                .iter()
                .find(|m| m.machine_id == p)
                .map(|m| m.store_id)
        })
    }
}

/// Membership, election, and the address directory for one node.
pub struct ClusterBroker {
    coordination: Arc<dyn CoordinationStore>,
    cluster_name: String,
    machine_id: MachineId,
    registration: Mutex<Option<u64>>,
}

impl ClusterBroker {
    /// A broker for `machine_id` on `cluster_name`.
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        cluster_name: &str,
        machine_id: MachineId,
    ) -> ClusterBroker {
        ClusterBroker {
            coordination,
            cluster_name: cluster_name.to_string(),
            machine_id,
            registration: Mutex::new(None),
        }
    }

    /// This node's machine id.
    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    /// Agree on the cluster's store id; the first cluster member wins.
    pub fn create_cluster(&self, store_id: StoreId) -> Result<StoreId> {
        self.coordination
            .propose_store_id(&self.cluster_name, store_id)
    }

    /// Join the cluster with this node's info.
    pub fn join(&self, address: &str, store_id: StoreId, backup_only: bool) -> Result<()> {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            return Err(TrellisError::InvalidOperation(
                "already joined the cluster".to_string(),
            ));
        }
        let seq = self.coordination.register(
            &self.cluster_name,
            MemberInfo {
                machine_id: self.machine_id,
                address: address.to_string(),
                store_id,
                backup_only,
            },
        )?;
        *registration = Some(seq);
        info!(machine_id = %self.machine_id, seq, "joined cluster");
        Ok(())
    }

    /// Leave the cluster (also how tests model a crash or partition).
    pub fn leave(&self) -> Result<()> {
        if let Some(seq) = self.registration.lock().take() {
            self.coordination.revoke(&self.cluster_name, seq)?;
            info!(machine_id = %self.machine_id, "left cluster");
        }
        Ok(())
    }

    /// The current view, resolved to machine ids.
    pub fn current_view(&self) -> Result<ClusterView> {
        let raw = self.coordination.view(&self.cluster_name)?;
        Ok(resolve(raw))
    }

    /// Re-read the view after dropping a primary handle. Election is
    /// implicit in membership, so this is a fresh, strongly consistent
    /// read.
    pub fn force_reelect(&self) -> Result<ClusterView> {
        self.current_view()
    }

    /// Re-resolve the primary's address.
    pub fn rebind_primary(&self) -> Result<Option<String>> {
        Ok(self
            .current_view()?
            .primary_address()
            .map(|a| a.to_string()))
    }

    /// Is this node the primary in the current view?
    pub fn i_am_primary(&self) -> Result<bool> {
        Ok(self.current_view()?.primary == Some(self.machine_id))
    }

    /// Whether this node's registration is still live.
    pub fn is_joined(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Subscribe to view changes.
    pub fn subscribe(&self, listener: ViewListener) {
        self.coordination.subscribe(&self.cluster_name, listener);
    }
}

fn resolve(raw: RawView) -> ClusterView {
    let primary = raw.primary_seq.and_then(|seq| {
        raw.members
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(_, m)| m.machine_id)
    });
    ClusterView {
        epoch: raw.epoch,
        primary,
        members: raw.members.into_iter().map(|(_, m)| m).collect(),
    }
}
