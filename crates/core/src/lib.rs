//! Shared foundation for the Trellis graph database
//!
//! This crate holds everything the other layers agree on:
//!
//! - Numeric id newtypes for graph entities, transactions, and epochs
//! - The unified error type with kind classification for the lifecycle
//!   supervisor's re-elect vs shutdown decisions
//! - Configuration loading (`trellis.toml` or programmatic)
//! - Store identity (creation time + random id, immutable after creation)
//! - The `DataSource` trait every replicated resource implements
//! - The `IdSource` seam that lets a follower allocate ids from the primary

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod store_id;
pub mod traits;
pub mod types;
pub mod value;

pub use config::Config;
pub use error::{ErrorKind, Result, TrellisError};
pub use store_id::StoreId;
pub use traits::{CommittedTx, DataSource, IdSource, ResourceTx};
pub use types::{Epoch, IdKind, MachineId, NodeId, RelationshipId, TxId, NIL, RESOURCE_GRAPH};
pub use value::PropertyValue;
