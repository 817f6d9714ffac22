//! # TrellisDB
//!
//! An embeddable replicated graph database: a fixed-record transactional
//! store with a write-ahead logical log, two-phase commit over pluggable
//! data sources, and leader/follower replication around a single elected
//! primary.
//!
//! # Quick start (standalone)
//!
//! ```no_run
//! use trellisdb::{PropertyValue, Trellis};
//!
//! fn main() -> trellisdb::Result<()> {
//!     let db = Trellis::open("./graph-data")?;
//!     let engine = db.engine();
//!
//!     let mut tx = engine.begin()?;
//!     let alice = tx.create_node()?;
//!     let bob = tx.create_node()?;
//!     tx.create_relationship("KNOWS", alice, bob)?;
//!     tx.set_node_property(alice, "name", "Alice")?;
//!     tx.commit()?;
//!
//!     assert_eq!(
//!         engine.node_property(alice, "name")?,
//!         Some(PropertyValue::String("Alice".into()))
//!     );
//!     db.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! # Replicated mode
//!
//! Give each node a unique `machine_id`, an `ha_server` address, and a
//! shared coordination handle; the first node to bootstrap becomes the
//! primary and everyone else copies its store and follows. Writes on a
//! follower transparently round-trip through the primary; reads are
//! local.
//!
//! Internal crates (store, wal, txn, engine, cluster) are not stable API;
//! only this facade is.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use trellis_cluster::{CoordinationStore, LifecycleSupervisor, LocalCoordination, Role};
pub use trellis_core::{
    Config, Epoch, ErrorKind, MachineId, NodeId, PropertyValue, RelationshipId, Result, StoreId,
    TrellisError, TxId,
};
pub use trellis_engine::{EngineOptions, GraphEngine, GraphTx, PropOwner};

use trellis_cluster::HaOptions;

enum Mode {
    Standalone(Arc<GraphEngine>),
    Replicated(Arc<LifecycleSupervisor>),
}

/// An open database, standalone or cluster member.
pub struct Trellis {
    mode: Mode,
    /// Keeps the `messages.log` writer alive.
    _log_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Trellis {
    /// Open a standalone database in `dir`.
    ///
    /// Reads `trellis.toml` from the directory when present.
    pub fn open(dir: impl AsRef<Path>) -> Result<Trellis> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let guard = init_logging(dir);
        let config = Config::load_or_default(dir)?;
        let engine = GraphEngine::open(dir, EngineOptions::from_config(&config, false))?;
        info!(dir = %dir.display(), "standalone database open");
        Ok(Trellis {
            mode: Mode::Standalone(engine),
            _log_guard: guard,
        })
    }

    /// Open a replicated database in `dir`, joining the cluster through
    /// `coordination`.
    ///
    /// The config must carry `machine_id` and `ha_server`. An empty
    /// directory is seeded from the current primary, or bootstraps the
    /// cluster when `allow_init_cluster` is set and no primary exists.
    pub fn open_ha(
        dir: impl AsRef<Path>,
        config: Config,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Result<Trellis> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let guard = init_logging(dir);
        let options = HaOptions::from_config(&config)?;
        let engine_options = EngineOptions::from_config(&config, true);
        let supervisor = LifecycleSupervisor::start(dir, options, engine_options, coordination)?;
        info!(dir = %dir.display(), machine_id = %supervisor.machine_id(), "replicated database open");
        Ok(Trellis {
            mode: Mode::Replicated(supervisor),
            _log_guard: guard,
        })
    }

    /// The engine currently serving.
    ///
    /// In replicated mode the engine can be replaced after a
    /// branched-data quarantine: fetch it fresh rather than caching it
    /// across role transitions.
    pub fn engine(&self) -> Arc<GraphEngine> {
        match &self.mode {
            Mode::Standalone(engine) => Arc::clone(engine),
            Mode::Replicated(supervisor) => supervisor.engine(),
        }
    }

    /// Does this node currently hold the primary role?
    ///
    /// Always true standalone.
    pub fn is_primary(&self) -> bool {
        match &self.mode {
            Mode::Standalone(_) => true,
            Mode::Replicated(supervisor) => supervisor.i_am_primary(),
        }
    }

    /// The supervisor, in replicated mode.
    pub fn supervisor(&self) -> Option<&Arc<LifecycleSupervisor>> {
        match &self.mode {
            Mode::Standalone(_) => None,
            Mode::Replicated(supervisor) => Some(supervisor),
        }
    }

    /// Shut down cleanly.
    pub fn shutdown(&self) -> Result<()> {
        match &self.mode {
            Mode::Standalone(engine) => engine.shutdown(None),
            Mode::Replicated(supervisor) => supervisor.shutdown(),
        }
    }
}

impl Drop for Trellis {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Install the human log: `<dir>/messages.log` plus env-filtered stderr.
///
/// The subscriber is process-global; the first database opened in a
/// process wins, later opens keep their own file guard unset.
fn init_logging(dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    // The file exists even when another database in this process already
    // owns the subscriber.
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("messages.log"));

    let appender = tracing_appender::rolling::never(dir, "messages.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let result = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();

    match result {
        Ok(()) => Some(guard),
        Err(_) => None, // another database already owns the subscriber
    }
}
