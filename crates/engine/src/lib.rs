//! The single-node graph kernel.
//!
//! `GraphEngine` binds the store, the logical log, and the transaction
//! layer into one embedded engine: open a directory, recover, begin
//! transactions, read and mutate the graph. The engine is also where the
//! replication seams live: a follower swaps the [`WritePath`] so that
//! ids, locks, and commits round-trip through the primary while reads stay
//! local.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod props;
pub mod reader;
pub mod source;
pub mod tx;
pub mod workspace;
pub mod write_path;

pub use engine::{EngineOptions, GraphEngine};
pub use reader::{GraphReader, PropOwner};
pub use source::{GraphDataSource, GraphResourceTx};
pub use tx::GraphTx;
pub use write_path::{LocalWritePath, WritePath};

/// Milliseconds since the Unix epoch, for commit timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
