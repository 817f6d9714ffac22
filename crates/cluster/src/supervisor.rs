//! The lifecycle supervisor.
//!
//! One supervisor per node owns the role state machine. On every cluster
//! view change it re-evaluates under a singleton latch:
//!
//! - promoted → tear down follower plumbing, restore the local write
//!   path, start the primary RPC server
//! - demoted → stop serving, verify branch safety, swap in the
//!   forwarding write path and the background puller
//! - same role, new epoch → drop cached id reservations and re-verify
//!   branch safety (the conservative rule)
//!
//! Branch verification is one `pull_updates` round trip: the primary
//! compares the follower's `(resource, tx_id, epoch)` marks against its
//! own history and refuses divergence. A refused store is moved aside to
//! `broken-<timestamp>/` and replaced with a fresh copy from the primary.
//!
//! A watchdog aborts the process when a role transition wedges: a node
//! stuck halfway between roles is worse than a dead one.

use crate::broker::ClusterBroker;
use crate::client::{PrimaryClient, DEFAULT_RPC_TIMEOUT};
use crate::coordination::CoordinationStore;
use crate::copy::decode_snapshot_into;
use crate::follower::{pull_once, ContextSource, Puller, RemoteIds, SlaveWritePath};
use crate::server::PrimaryServer;
use crate::wire::{FollowerContext, Request, ResponsePayload};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use trellis_core::{Config, Epoch, ErrorKind, IdSource, MachineId, Result, TrellisError};
use trellis_engine::{EngineOptions, GraphEngine, WritePath};

/// The node's current role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No primary is known; writes fail retryably.
    Pending,
    /// This node accepts writes and serves followers.
    Primary,
    /// This node forwards writes to the primary.
    Follower,
}

/// Replication options, validated out of [`Config`].
#[derive(Debug, Clone)]
pub struct HaOptions {
    /// This node's unique id.
    pub machine_id: MachineId,
    /// Address the primary RPC server binds.
    pub ha_server: String,
    /// Cluster to join.
    pub cluster_name: String,
    /// Background pull interval; `None` disables the puller.
    pub pull_interval: Option<Duration>,
    /// May this node bootstrap an empty cluster.
    pub allow_init_cluster: bool,
    /// Replicate only; never stand for election.
    pub backup_slave: bool,
    /// Per-RPC deadline.
    pub rpc_timeout: Duration,
    /// Watchdog bound on one role transition.
    pub transition_timeout: Duration,
}

impl HaOptions {
    /// Validate a config for replicated operation.
    pub fn from_config(config: &Config) -> Result<HaOptions> {
        let (machine_id, ha_server) = config.validate_ha()?;
        Ok(HaOptions {
            machine_id: MachineId(machine_id),
            ha_server,
            cluster_name: config.cluster_name.clone(),
            pull_interval: config.pull_interval_duration(),
            allow_init_cluster: config.allow_init_cluster,
            backup_slave: config.backup_slave,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            transition_timeout: Duration::from_secs(120),
        })
    }
}

struct RoleState {
    role: Role,
    epoch: Epoch,
    engine: Arc<GraphEngine>,
    server: Option<PrimaryServer>,
    puller: Option<Puller>,
    client: Option<Arc<PrimaryClient>>,
    remote_ids: Option<Arc<RemoteIds>>,
}

/// Swaps the engine between primary and follower configurations.
pub struct LifecycleSupervisor {
    options: HaOptions,
    dir: PathBuf,
    engine_options: EngineOptions,
    broker: ClusterBroker,
    state: Mutex<RoleState>,
    /// Detached nodes keep their current configuration through view
    /// changes (maintenance, and how tests model a partitioned node that
    /// wrongly believes it is still primary).
    detached: AtomicBool,
    shutdown: AtomicBool,
    trigger: Arc<(Mutex<bool>, Condvar)>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LifecycleSupervisor {
    /// Boot a replicated node in `dir` and join the cluster.
    ///
    /// An empty directory is seeded either by copying the store from the
    /// current primary or, when allowed and no primary exists, by minting
    /// a fresh store and proposing it as the cluster's.
    pub fn start(
        dir: &Path,
        options: HaOptions,
        engine_options: EngineOptions,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Result<Arc<LifecycleSupervisor>> {
        std::fs::create_dir_all(dir)?;
        let broker = ClusterBroker::new(coordination, &options.cluster_name, options.machine_id);

        let engine = seed_store(dir, &options, &engine_options, &broker)?;
        let store_id = engine.store_id();

        let agreed = broker.create_cluster(store_id)?;
        if agreed != store_id {
            engine.shutdown(Some(format!(
                "store {} is foreign to cluster (expected {})",
                store_id, agreed
            )))?;
            return Err(TrellisError::ForeignStore {
                local: store_id,
                remote: agreed,
            });
        }

        let supervisor = Arc::new(LifecycleSupervisor {
            dir: dir.to_path_buf(),
            engine_options,
            broker,
            state: Mutex::new(RoleState {
                role: Role::Pending,
                epoch: Epoch::NONE,
                engine,
                server: None,
                puller: None,
                client: None,
                remote_ids: None,
            }),
            detached: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            trigger: Arc::new((Mutex::new(false), Condvar::new())),
            worker: Mutex::new(None),
            options,
        });

        // Re-evaluation worker: view-change listeners only set a flag, so
        // coordination callbacks never run transitions re-entrantly.
        let weak = Arc::downgrade(&supervisor);
        let trigger = Arc::clone(&supervisor.trigger);
        let worker = std::thread::Builder::new()
            .name("trellis-supervisor".to_string())
            .spawn(move || loop {
                {
                    let (flag, condvar) = &*trigger;
                    let mut pending = flag.lock();
                    while !*pending {
                        condvar.wait(&mut pending);
                    }
                    *pending = false;
                }
                let supervisor = match weak.upgrade() {
                    Some(supervisor) => supervisor,
                    None => return,
                };
                if supervisor.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = supervisor.evaluate() {
                    error!(error = %e, "role transition failed");
                    if !e.is_retryable() {
                        let state = supervisor.state.lock();
                        let _ = state.engine.shutdown(Some(format!(
                            "role transition failed: {}",
                            e
                        )));
                    }
                }
            })
            .expect("failed to spawn supervisor thread");
        *supervisor.worker.lock() = Some(worker);

        let listener_weak = Arc::downgrade(&supervisor);
        supervisor.broker.subscribe(Arc::new(move || {
            if let Some(supervisor) = listener_weak.upgrade() {
                supervisor.schedule_evaluate();
            }
        }));

        supervisor.broker.join(
            &supervisor.options.ha_server,
            store_id,
            supervisor.options.backup_slave,
        )?;
        supervisor.evaluate()?;

        Ok(supervisor)
    }

    /// This node's machine id.
    pub fn machine_id(&self) -> MachineId {
        self.options.machine_id
    }

    /// The engine currently serving (replaced after a quarantine).
    pub fn engine(&self) -> Arc<GraphEngine> {
        Arc::clone(&self.state.lock().engine)
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Does this node currently hold the primary role?
    pub fn i_am_primary(&self) -> bool {
        self.state.lock().role == Role::Primary
    }

    /// Epoch of the current configuration.
    pub fn current_epoch(&self) -> Epoch {
        self.state.lock().epoch
    }

    /// The broker (membership and views).
    pub fn broker(&self) -> &ClusterBroker {
        &self.broker
    }

    /// Queue a re-evaluation on the supervisor thread.
    pub fn schedule_evaluate(&self) {
        let (flag, condvar) = &*self.trigger;
        *flag.lock() = true;
        condvar.notify_one();
    }

    /// Leave the cluster but keep the current configuration frozen.
    ///
    /// The node keeps serving with its last-known role: which is exactly
    /// the "wrongly believes it is primary" half of a partition.
    pub fn detach(&self) -> Result<()> {
        self.detached.store(true, Ordering::SeqCst);
        self.broker.leave()
    }

    /// Rejoin the cluster after [`LifecycleSupervisor::detach`] and submit
    /// to whatever the view says now.
    pub fn reattach(&self) -> Result<()> {
        let store_id = self.engine().store_id();
        self.detached.store(false, Ordering::SeqCst);
        self.broker
            .join(&self.options.ha_server, store_id, self.options.backup_slave)?;
        self.evaluate()
    }

    /// Evaluate the current view and transition if needed.
    pub fn evaluate(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) || self.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.state.lock();
        let view = self.broker.force_reelect()?;

        self.with_watchdog(|| match view.primary {
            Some(primary) if primary == self.options.machine_id => {
                self.become_primary(&mut state, view.epoch)
            }
            Some(primary) => {
                let address = view
                    .address_of(primary)
                    .ok_or_else(|| {
                        TrellisError::PrimaryLost(format!("no address for primary {}", primary))
                    })?
                    .to_string();
                let primary_store = view.primary_store_id();
                self.become_follower(&mut state, view.epoch, primary, &address, primary_store)
            }
            None => {
                info!("no primary elected; holding");
                if let Some(puller) = state.puller.take() {
                    puller.stop();
                }
                state.role = Role::Pending;
                Ok(())
            }
        })
    }

    fn become_primary(&self, state: &mut RoleState, epoch: Epoch) -> Result<()> {
        if state.role == Role::Primary && state.epoch == epoch {
            return Ok(());
        }
        info!(epoch = %epoch, "becoming primary");

        if let Some(puller) = state.puller.take() {
            puller.stop();
        }
        state.client = None;
        state.remote_ids = None;

        state.engine.source().set_current_epoch(epoch);
        state.engine.set_local_write_path();
        if state.server.is_none() {
            state.server = Some(PrimaryServer::start(
                Arc::clone(&state.engine),
                &self.options.ha_server,
            )?);
        }

        state.role = Role::Primary;
        state.epoch = epoch;
        info!(epoch = %epoch, "primary configuration active");
        Ok(())
    }

    fn become_follower(
        &self,
        state: &mut RoleState,
        epoch: Epoch,
        primary: MachineId,
        address: &str,
        primary_store: Option<trellis_core::StoreId>,
    ) -> Result<()> {
        let unchanged = state.role == Role::Follower
            && state.epoch == epoch
            && state
                .client
                .as_ref()
                .map(|c| c.addr() == address)
                .unwrap_or(false);
        if unchanged {
            return Ok(());
        }

        // Epoch changed with the role intact: reservations made under the
        // old primary are dead.
        if let Some(remote_ids) = &state.remote_ids {
            remote_ids.invalidate();
        }

        info!(epoch = %epoch, primary = %primary, address, "becoming follower");

        if let Some(server) = state.server.take() {
            server.stop_serving();
            server.shutdown();
        }
        if let Some(puller) = state.puller.take() {
            puller.stop();
        }

        // A primary with a different store id is a different database.
        if let Some(primary_store) = primary_store {
            if primary_store != state.engine.store_id() {
                let cause = format!(
                    "primary store {} does not match local store {}",
                    primary_store,
                    state.engine.store_id()
                );
                state.engine.shutdown(Some(cause))?;
                return Err(TrellisError::ForeignStore {
                    local: state.engine.store_id(),
                    remote: primary_store,
                });
            }
        }

        let client = Arc::new(PrimaryClient::new(address, self.options.rpc_timeout)?);

        // Conservative branch rule: verify on every transition by letting
        // the primary check our marks; a clean pull doubles as catch-up.
        let ctx = ContextSource::new(self.options.machine_id, Arc::clone(state.engine.registry()));
        match pull_once(&client, &ctx, state.engine.registry()) {
            Ok(_) => {}
            Err(TrellisError::BranchedData {
                resource,
                tx_id,
                local_epoch,
                primary_epoch,
            }) => {
                warn!(
                    resource = %resource,
                    tx_id = %tx_id,
                    local_epoch = %local_epoch,
                    primary_epoch = %primary_epoch,
                    "branched data detected; quarantining store"
                );
                self.quarantine_and_refetch(state, &client)?;
            }
            Err(e) => return Err(e),
        }

        let ctx = ContextSource::new(self.options.machine_id, Arc::clone(state.engine.registry()));
        let remote_ids = RemoteIds::new(Arc::clone(&client), Arc::clone(&ctx));

        // Re-elect on communication failure, off the failing thread.
        let reelect_hook: crate::follower::CommFailureHook = {
            let trigger = Arc::clone(&self.trigger);
            Arc::new(move || {
                let (flag, condvar) = &*trigger;
                *flag.lock() = true;
                condvar.notify_one();
            })
        };

        let slave_path = SlaveWritePath::new(
            Arc::clone(&client),
            Arc::clone(&remote_ids),
            Arc::clone(&ctx),
            Arc::clone(state.engine.manager()),
            Arc::clone(state.engine.registry()),
            Arc::clone(&reelect_hook),
        );
        state.engine.set_write_path(Arc::new(slave_path) as Arc<dyn WritePath>);
        state.engine.source().set_current_epoch(epoch);

        if let Some(interval) = self.options.pull_interval {
            state.puller = Some(Puller::start(
                Arc::clone(&client),
                ctx,
                Arc::clone(state.engine.registry()),
                interval,
                reelect_hook,
            ));
        }

        state.client = Some(client);
        state.remote_ids = Some(remote_ids);
        state.role = Role::Follower;
        state.epoch = epoch;
        info!(epoch = %epoch, "follower configuration active");
        Ok(())
    }

    /// Move the divergent store aside and fetch a fresh copy.
    fn quarantine_and_refetch(
        &self,
        state: &mut RoleState,
        client: &Arc<PrimaryClient>,
    ) -> Result<()> {
        state
            .engine
            .shutdown(Some("branched data; store quarantined".to_string()))?;

        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let quarantine = self.dir.join(format!("broken-{}", stamp));
        std::fs::create_dir_all(&quarantine)?;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("neostore") || name.starts_with(trellis_wal::LOG_BASE_NAME) {
                std::fs::rename(entry.path(), quarantine.join(&name))?;
            }
        }
        info!(quarantine = %quarantine.display(), "store moved aside");

        let ctx = FollowerContext {
            follower_id: self.options.machine_id,
            event_id: 0,
            marks: Vec::new(),
        };
        let (payload, _) = client.call_ok(&ctx, &Request::CopyStore)?;
        let snapshot = match payload {
            ResponsePayload::Snapshot(bytes) => bytes,
            other => {
                return Err(TrellisError::Communication(format!(
                    "unexpected copy response: {:?}",
                    other
                )))
            }
        };
        decode_snapshot_into(&self.dir, &snapshot)?;

        state.engine = GraphEngine::open(&self.dir, self.engine_options)?;
        info!(
            last_tx = %state.engine.last_committed_tx(),
            "store refetched from primary"
        );
        Ok(())
    }

    fn with_watchdog<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let bound = self.options.transition_timeout;
        let watchdog = std::thread::Builder::new()
            .name("trellis-watchdog".to_string())
            .spawn(move || {
                let deadline = Instant::now() + bound;
                while Instant::now() < deadline {
                    if flag.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                // A node wedged mid-transition must not keep answering.
                eprintln!("role transition exceeded {:?}; aborting", bound);
                std::process::abort();
            })
            .expect("failed to spawn watchdog thread");

        let result = f();
        done.store(true, Ordering::Release);
        let _ = watchdog.join();
        result
    }

    /// Leave the cluster and shut everything down.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.broker.leave();

        let mut state = self.state.lock();
        if let Some(puller) = state.puller.take() {
            puller.stop();
        }
        if let Some(server) = state.server.take() {
            server.shutdown();
        }
        state.client = None;
        state.engine.shutdown(None)?;

        // Wake the worker so it can observe shutdown and exit.
        self.schedule_evaluate();
        if let Some(worker) = self.worker.lock().take() {
            drop(state);
            let _ = worker.join();
        }
        info!("supervisor shut down");
        Ok(())
    }
}

/// Open (or seed) the store for a joining node.
fn seed_store(
    dir: &Path,
    options: &HaOptions,
    engine_options: &EngineOptions,
    broker: &ClusterBroker,
) -> Result<Arc<GraphEngine>> {
    let store_exists = dir.join(trellis_store::META_FILE).exists();
    if store_exists {
        return GraphEngine::open(dir, *engine_options);
    }

    // Empty directory: copy from a live primary when there is one.
    let view = broker.current_view()?;
    if let Some(address) = view.primary_address() {
        info!(address, "empty store; copying from primary");
        let client = PrimaryClient::new(address, options.rpc_timeout)?;
        let ctx = FollowerContext {
            follower_id: options.machine_id,
            event_id: 0,
            marks: Vec::new(),
        };
        let (payload, _) = client.call_ok(&ctx, &Request::CopyStore)?;
        match payload {
            ResponsePayload::Snapshot(bytes) => {
                decode_snapshot_into(dir, &bytes)?;
            }
            other => {
                return Err(TrellisError::Communication(format!(
                    "unexpected copy response: {:?}",
                    other
                )))
            }
        }
        return GraphEngine::open(dir, *engine_options);
    }

    if !options.allow_init_cluster {
        return Err(TrellisError::Config(
            "store is empty, no primary exists, and cluster initialization is not allowed"
                .to_string(),
        ));
    }

    // Bootstrap: mint a store and race to propose its identity.
    info!("empty store; bootstrapping a new cluster store");
    let engine = GraphEngine::open(dir, *engine_options)?;
    let agreed = broker.create_cluster(engine.store_id())?;
    if agreed == engine.store_id() {
        return Ok(engine);
    }

    // Lost the race to another fresh node: discard and copy from the
    // winner once it serves.
    engine.shutdown(Some("lost cluster-initialization race".to_string()))?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("neostore") || name.starts_with(trellis_wal::LOG_BASE_NAME) {
            std::fs::remove_file(entry.path())?;
        }
    }

    let mut last_error: Option<TrellisError> = None;
    for _ in 0..20 {
        let view = broker.current_view()?;
        if let Some(address) = view.primary_address() {
            let client = PrimaryClient::new(address, options.rpc_timeout)?;
            let ctx = FollowerContext {
                follower_id: options.machine_id,
                event_id: 0,
                marks: Vec::new(),
            };
            match client.call_ok(&ctx, &Request::CopyStore) {
                Ok((ResponsePayload::Snapshot(bytes), _)) => {
                    decode_snapshot_into(dir, &bytes)?;
                    return GraphEngine::open(dir, *engine_options);
                }
                Ok((other, _)) => {
                    last_error = Some(TrellisError::Communication(format!(
                        "unexpected copy response: {:?}",
                        other
                    )));
                }
                Err(e) if e.kind() == ErrorKind::Communication => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    Err(last_error.unwrap_or_else(|| {
        TrellisError::PrimaryLost("no primary appeared after losing the init race".to_string())
    }))
}
