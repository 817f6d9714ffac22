//! The follower runtime.
//!
//! On a follower every write becomes a call to the primary: record ids
//! come from reserved ranges, write locks are taken on the primary before
//! the local lock manager, and commit forwards the command stream. The
//! returned apply stream (the follower's own transaction plus anything
//! it was missing) is applied through the local data sources in order.
//!
//! A background puller optionally polls `pull_updates` so reads on the
//! follower see recent writes without waiting for the next local commit.

use crate::client::PrimaryClient;
use crate::wire::{FollowerContext, Request, ResourceMark, ResponsePayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use trellis_core::{
    CommittedTx, Epoch, IdKind, IdSource, MachineId, Result, TrellisError, TxId,
    RESOURCE_GRAPH,
};
use trellis_store::{encode_commands, GraphCommand};
use trellis_txn::{DataSourceRegistry, LockMode, LockSpace, ResourceKey, Transaction,
    TransactionManager};
use trellis_engine::WritePath;

/// Ids reserved from the primary per round trip.
const ID_CHUNK: u64 = 128;

/// Called when the primary stops answering; the supervisor re-elects.
pub type CommFailureHook = Arc<dyn Fn() + Send + Sync>;

/// Builds the follower context sent with every request.
pub struct ContextSource {
    machine_id: MachineId,
    registry: Arc<DataSourceRegistry>,
    event_counter: AtomicU64,
}

impl ContextSource {
    /// Context factory for this follower.
    pub fn new(machine_id: MachineId, registry: Arc<DataSourceRegistry>) -> Arc<ContextSource> {
        Arc::new(ContextSource {
            machine_id,
            registry,
            event_counter: AtomicU64::new(1),
        })
    }

    /// Snapshot what this follower has applied, per resource.
    pub fn context(&self) -> Result<FollowerContext> {
        let mut marks = Vec::new();
        for source in self.registry.in_commit_order() {
            let last_tx = source.last_committed_tx_id();
            let epoch = if last_tx == TxId::ZERO {
                Epoch::NONE
            } else {
                source.master_epoch_for(last_tx)?
            };
            marks.push(ResourceMark {
                resource: source.name().to_string(),
                last_tx,
                epoch,
            });
        }
        Ok(FollowerContext {
            follower_id: self.machine_id,
            event_id: self.event_counter.fetch_add(1, Ordering::Relaxed),
            marks,
        })
    }
}

/// Apply piggy-backed transaction streams through the local sources.
pub fn apply_streams(
    registry: &DataSourceRegistry,
    streams: &[(String, Vec<CommittedTx>)],
) -> Result<()> {
    for (resource, txs) in streams {
        let source = match registry.get(resource) {
            Some(source) => source,
            None => {
                warn!(resource = %resource, "stream for unknown resource dropped");
                continue;
            }
        };
        for tx in txs {
            source.apply_committed(tx)?;
        }
    }
    Ok(())
}

/// Remote id allocation with per-kind range caching.
///
/// Ranges are discarded wholesale on epoch change: a range reserved
/// under a dead primary may be reissued by its successor.
pub struct RemoteIds {
    client: Arc<PrimaryClient>,
    ctx: Arc<ContextSource>,
    cache: Mutex<HashMap<IdKind, (u64, u64)>>,
}

impl RemoteIds {
    /// Remote allocator over `client`.
    pub fn new(client: Arc<PrimaryClient>, ctx: Arc<ContextSource>) -> Arc<RemoteIds> {
        Arc::new(RemoteIds {
            client,
            ctx,
            cache: Mutex::new(HashMap::new()),
        })
    }
}

impl IdSource for RemoteIds {
    fn next(&self, kind: IdKind) -> Result<u64> {
        let mut cache = self.cache.lock();
        if let Some((next, end)) = cache.get_mut(&kind) {
            if next < end {
                let id = *next;
                *next += 1;
                return Ok(id);
            }
        }

        let (payload, _) = self.client.call_ok(
            &self.ctx.context()?,
            &Request::AllocateIds {
                kind,
                count: ID_CHUNK,
            },
        )?;
        let ranges = match payload {
            ResponsePayload::Ranges(ranges) if !ranges.is_empty() => ranges,
            other => {
                return Err(TrellisError::Communication(format!(
                    "unexpected allocate response: {:?}",
                    other
                )))
            }
        };
        let range = ranges[0];
        debug!(kind = %kind, start = range.start, length = range.length, "reserved id range");
        cache.insert(kind, (range.start + 1, range.start + range.length));
        Ok(range.start)
    }

    fn release(&self, _kind: IdKind, _id: u64) {
        // Remote ranges are abandoned, never returned.
    }

    fn invalidate(&self) {
        self.cache.lock().clear();
    }
}

/// The follower's write path: locks and commits round-trip through the
/// primary, reads stay local.
pub struct SlaveWritePath {
    client: Arc<PrimaryClient>,
    ids: Arc<RemoteIds>,
    ctx: Arc<ContextSource>,
    manager: Arc<TransactionManager>,
    registry: Arc<DataSourceRegistry>,
    lock_tokens: Mutex<HashMap<u64, u64>>,
    on_comm_failure: CommFailureHook,
}

impl SlaveWritePath {
    /// Build the forwarding path for one primary.
    pub fn new(
        client: Arc<PrimaryClient>,
        ids: Arc<RemoteIds>,
        ctx: Arc<ContextSource>,
        manager: Arc<TransactionManager>,
        registry: Arc<DataSourceRegistry>,
        on_comm_failure: CommFailureHook,
    ) -> SlaveWritePath {
        SlaveWritePath {
            client,
            ids,
            ctx,
            manager,
            registry,
            lock_tokens: Mutex::new(HashMap::new()),
            on_comm_failure,
        }
    }

    /// The remote id cache (for epoch-change invalidation).
    pub fn ids(&self) -> &Arc<RemoteIds> {
        &self.ids
    }

    fn note_error(&self, e: &TrellisError) {
        if matches!(
            e.kind(),
            trellis_core::ErrorKind::Communication | trellis_core::ErrorKind::PrimaryLost
        ) {
            (self.on_comm_failure)();
        }
    }

    fn release_remote_locks(&self, serial: u64) {
        let token = self.lock_tokens.lock().remove(&serial);
        if let Some(token) = token {
            let ctx = match self.ctx.context() {
                Ok(ctx) => ctx,
                Err(_) => return,
            };
            if let Err(e) = self
                .client
                .call_ok(&ctx, &Request::ReleaseLocks { token })
            {
                debug!(error = %e, "remote lock release failed; primary will reap the session");
            }
        }
    }
}

impl WritePath for SlaveWritePath {
    fn next_id(&self, kind: IdKind) -> Result<u64> {
        self.ids.next(kind).map_err(|e| {
            self.note_error(&e);
            e
        })
    }

    fn release_id(&self, kind: IdKind, id: u64) {
        self.ids.release(kind, id);
    }

    fn lock(&self, serial: u64, key: ResourceKey) -> Result<()> {
        let space_tag = match key.space {
            LockSpace::Node => 1,
            LockSpace::Relationship => 2,
        };
        let token = self.lock_tokens.lock().get(&serial).copied().unwrap_or(0);

        let result = self.client.call_ok(
            &self.ctx.context()?,
            &Request::AcquireLocks {
                token,
                keys: vec![(space_tag, key.id)],
            },
        );
        match result {
            Ok((ResponsePayload::LockToken(token), _)) => {
                self.lock_tokens.lock().insert(serial, token);
            }
            Ok(other) => {
                return Err(TrellisError::Communication(format!(
                    "unexpected lock response: {:?}",
                    other.0
                )))
            }
            Err(e) => {
                self.note_error(&e);
                return Err(e);
            }
        }

        // Cluster-wide exclusion is the primary's; the local lock keeps
        // this follower's own transactions honest.
        self.manager.locks().acquire(serial, key, LockMode::Write)
    }

    fn commit(&self, tx: &mut Transaction, commands: Vec<GraphCommand>) -> Result<Option<TxId>> {
        if commands.is_empty() {
            self.release_remote_locks(tx.serial());
            self.manager.rollback(tx)?;
            return Ok(None);
        }

        let encoded = encode_commands(&commands)?;
        let ctx = self.ctx.context()?;
        let result = self.client.call_ok(
            &ctx,
            &Request::Commit {
                resource: RESOURCE_GRAPH.to_string(),
                commands: encoded,
            },
        );

        match result {
            Ok((ResponsePayload::Committed { tx_id, epoch }, streams)) => {
                apply_streams(&self.registry, &streams)?;
                debug!(tx_id = %tx_id, epoch = %epoch, "commit round-tripped through primary");
                self.release_remote_locks(tx.serial());
                // Nothing was enlisted locally; this releases local locks.
                self.manager.rollback(tx)?;
                Ok(Some(tx_id))
            }
            Ok((other, _)) => Err(TrellisError::Communication(format!(
                "unexpected commit response: {:?}",
                other
            ))),
            Err(e) => {
                self.note_error(&e);
                self.lock_tokens.lock().remove(&tx.serial());
                let _ = self.manager.rollback(tx);
                Err(e)
            }
        }
    }

    fn abort(&self, tx: &mut Transaction) -> Result<()> {
        self.release_remote_locks(tx.serial());
        self.manager.rollback(tx)
    }
}

/// Background update puller.
pub struct Puller {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Puller {
    /// Start pulling every `interval`.
    pub fn start(
        client: Arc<PrimaryClient>,
        ctx: Arc<ContextSource>,
        registry: Arc<DataSourceRegistry>,
        interval: Duration,
        on_comm_failure: CommFailureHook,
    ) -> Puller {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("trellis-puller".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match pull_once(&client, &ctx, &registry) {
                        Ok(applied) if applied > 0 => {
                            debug!(applied, "pulled updates");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "pull failed");
                            if matches!(
                                e.kind(),
                                trellis_core::ErrorKind::Communication
                                    | trellis_core::ErrorKind::PrimaryLost
                            ) {
                                on_comm_failure();
                            }
                        }
                    }
                    std::thread::park_timeout(interval);
                }
            })
            .expect("failed to spawn puller thread");
        Puller {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the puller and join its thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Puller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// One pull round trip; returns how many transactions were applied.
pub fn pull_once(
    client: &PrimaryClient,
    ctx: &ContextSource,
    registry: &DataSourceRegistry,
) -> Result<usize> {
    let (_, streams) = client.call_ok(&ctx.context()?, &Request::PullUpdates)?;
    let applied = streams.iter().map(|(_, txs)| txs.len()).sum();
    apply_streams(registry, &streams)?;
    Ok(applied)
}
