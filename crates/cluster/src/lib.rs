//! Replication: broker, primary RPC, follower runtime, and the lifecycle
//! supervisor.
//!
//! A cluster is a set of embedded engines sharing one store identity,
//! replicating from a single elected primary. Election is externalized to
//! a coordination service behind [`CoordinationStore`]; the in-tree
//! [`LocalCoordination`] provides the semantics for engines embedded in
//! one process, which is also how the multi-node scenarios are tested.
//!
//! The [`LifecycleSupervisor`] owns role transitions: it swaps the
//! engine's write path between local (primary) and forwarding (follower)
//! configurations, verifies branch safety on every transition, and
//! quarantines divergent stores under `broken-<timestamp>/`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod client;
pub mod coordination;
pub mod copy;
pub mod follower;
pub mod server;
pub mod supervisor;
pub mod wire;

pub use broker::{ClusterBroker, ClusterView};
pub use client::PrimaryClient;
pub use coordination::{CoordinationStore, LocalCoordination, MemberInfo};
pub use follower::{Puller, RemoteIds, SlaveWritePath};
pub use server::PrimaryServer;
pub use supervisor::{HaOptions, LifecycleSupervisor, Role};
pub use wire::FollowerContext;
