//! Transaction layer: two-phase commit, locks, and the data-source
//! registry.
//!
//! A transaction is bound to the thread that began it and carries one
//! enlisted [`ResourceTx`](trellis_core::ResourceTx) per data source it
//! touched. Commit drives every enlisted resource through
//! prepare → commit with the graph store pinned first, so recovery can
//! rebuild a secondary index from the graph when the index's commit record
//! is missing.
//!
//! Locks are record-granularity read/write locks with deadlock detection
//! by wait-for-graph cycle search; the youngest transaction in a cycle is
//! the victim.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod locks;
pub mod manager;
pub mod registry;
pub mod transaction;

pub use locks::{LockManager, LockMode, LockSpace, ResourceKey};
pub use manager::TransactionManager;
pub use registry::{DataSourceFactory, DataSourceRegistry};
pub use transaction::{Transaction, TxState};
