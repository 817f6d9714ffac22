//! Store engine: fixed-record files for the graph.
//!
//! Each entity class (nodes, relationships, properties, dynamic blocks,
//! tokens) lives in its own file of fixed-width records addressed by slot
//! number. Every file carries a version header with the store identity;
//! every record starts with an in-use flag; unused slots are tracked by a
//! free-list persisted in the `.id` sibling file.
//!
//! Mutation never goes through this crate directly: the kernel turns every
//! write into a [`GraphCommand`] carrying before/after record images, the
//! logical log makes the command durable, and only then is the after-image
//! applied here. Applying is idempotent because commands are keyed by
//! record id.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod command;
pub mod paging;
pub mod record;
pub mod record_file;
pub mod store;

pub use allocator::IdAllocator;
pub use command::{
    decode_command, decode_commands, encode_command, encode_commands, DynamicStoreKind,
    GraphCommand, TokenStoreKind,
};
pub use paging::{PageBackend, PagedFile};
pub use record::{
    DynamicRecord, NodeRecord, PropertyPayload, PropertyRecord, RelationshipRecord, TokenRecord,
};
pub use record_file::{RecordFile, StoreHeader, STORE_HEADER_SIZE};
pub use store::{GraphStore, StoreMetadata, StoreOpenOptions, META_FILE};
