//! The logical log: write-ahead command log for recovery and replication.
//!
//! Each transaction appears in the log as
//! `START, COMMAND*, PREPARE, COMMIT(tx_id, primary_epoch), DONE`, or
//! `ROLLBACK` in place of COMMIT when a prepared transaction aborts. The
//! writer forces the file on PREPARE and again on COMMIT, which is what
//! makes a reported commit durable.
//!
//! Two halves, `nioneo_logical.log.0` and `.1`, alternate on rotation; an
//! `.active` marker byte records which half is live. Rotated halves are
//! deleted unless log retention is on (always the case in replicated mode),
//! in which case they are renamed to `nioneo_logical.log.v{N}` and serve
//! history extraction for lagging followers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod log;
pub mod recovery;

pub use entry::{pack_frames, unpack_frames, EntryKind, LogEntry};
pub use log::{LogOptions, LogicalLog, ACTIVE_MARKER_FILE, LOG_BASE_NAME};
pub use recovery::RecoveredTx;
