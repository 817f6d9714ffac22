//! The primary's RPC server.
//!
//! A tokio listener owned by its own runtime thread; each connection reads
//! length-prefixed frames and dispatches onto the blocking pool, because
//! every operation ends in the synchronous kernel (locks block, commits
//! force the log).
//!
//! Every request carries the follower's context. The server verifies
//! branch safety on commit and pull (a follower whose
//! `(resource, tx_id, epoch)` mark disagrees with this node's history is
//! refused with `BranchedData`) and piggybacks missing transactions onto
//! commit responses.

use crate::wire::{
    self, decode_request, encode_response, FollowerContext, Request, Response, ResponsePayload,
    WireError,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use trellis_core::{
    DataSource, MachineId, Result, TrellisError, TxId, RESOURCE_GRAPH,
};
use trellis_engine::GraphEngine;
use trellis_store::decode_commands;
use trellis_txn::{LockMode, LockSpace, ResourceKey};

/// Server half of the primary RPC protocol.
pub struct PrimaryServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    runtime: Option<tokio::runtime::Runtime>,
}

struct ServerState {
    engine: Arc<GraphEngine>,
    serving: AtomicBool,
    shutdown: tokio::sync::Notify,
    /// Lock-session token → serial (identical; the map records liveness).
    lock_sessions: DashMap<u64, u64>,
    /// Follower → applied-through, for history pruning.
    follower_progress: DashMap<MachineId, TxId>,
}

impl PrimaryServer {
    /// Bind `addr` and start serving.
    pub fn start(engine: Arc<GraphEngine>, addr: &str) -> Result<PrimaryServer> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let state = Arc::new(ServerState {
            engine,
            serving: AtomicBool::new(true),
            shutdown: tokio::sync::Notify::new(),
            lock_sessions: DashMap::new(),
            follower_progress: DashMap::new(),
        });

        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "primary RPC server listening");

        let accept_state = Arc::clone(&state);
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_state.shutdown.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "follower connected");
                            let conn_state = Arc::clone(&accept_state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(conn_state, stream).await {
                                    debug!(peer = %peer, error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(PrimaryServer {
            addr: bound,
            state,
            runtime: Some(runtime),
        })
    }

    /// The bound address (useful with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop answering with results; every request gets `NotPrimary`.
    /// Used in the demotion window before the server is torn down.
    pub fn stop_serving(&self) {
        self.state.serving.store(false, Ordering::SeqCst);
    }

    /// Lowest applied-through transaction across the followers seen so
    /// far.
    pub fn slowest_follower(&self) -> Option<TxId> {
        self.state
            .follower_progress
            .iter()
            .map(|entry| *entry.value())
            .min()
    }

    /// Shut the server down and join its runtime.
    pub fn shutdown(mut self) {
        self.state.serving.store(false, Ordering::SeqCst);
        self.state.shutdown.notify_waiters();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("primary RPC server stopped");
    }
}

impl Drop for PrimaryServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.state.shutdown.notify_waiters();
            runtime.shutdown_background();
        }
    }
}

async fn serve_connection(state: Arc<ServerState>, mut stream: TcpStream) -> std::io::Result<()> {
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > wire::MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized frame",
            ));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        let handler_state = Arc::clone(&state);
        let response = tokio::task::spawn_blocking(move || handle_frame(&handler_state, &body))
            .await
            .unwrap_or_else(|e| Response {
                result: Err(WireError::TxFailure(format!("handler panicked: {}", e))),
                transactions_to_apply: Vec::new(),
            });

        let encoded = encode_response(&response);
        stream
            .write_all(&(encoded.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;
    }
}

fn handle_frame(state: &ServerState, body: &[u8]) -> Response {
    let (ctx, request) = match decode_request(body) {
        Ok(decoded) => decoded,
        Err(e) => {
            return Response {
                result: Err(WireError::TxFailure(format!("bad request: {}", e))),
                transactions_to_apply: Vec::new(),
            }
        }
    };

    if !state.serving.load(Ordering::SeqCst) {
        return Response {
            result: Err(WireError::NotPrimary(
                "this node is no longer the primary".to_string(),
            )),
            transactions_to_apply: Vec::new(),
        };
    }

    match handle_request(state, &ctx, request) {
        Ok(response) => response,
        Err(e) => Response {
            result: Err(WireError::from(&e)),
            transactions_to_apply: Vec::new(),
        },
    }
}

fn handle_request(
    state: &ServerState,
    ctx: &FollowerContext,
    request: Request,
) -> Result<Response> {
    let engine = &state.engine;

    // Track follower progress for history pruning.
    if let Some(mark) = ctx.mark_for(RESOURCE_GRAPH) {
        state.follower_progress.insert(ctx.follower_id, mark.last_tx);
    }

    match request {
        Request::AllocateIds { kind, count } => {
            let range = engine.store().allocator(kind).reserve_range(count);
            debug!(follower = %ctx.follower_id, kind = %kind, count, start = range.start, "ids reserved");
            Ok(ok(ResponsePayload::Ranges(vec![range])))
        }

        Request::AcquireLocks { token, keys } => {
            let serial = if token == 0 {
                let serial = engine.manager().begin().serial();
                state.lock_sessions.insert(serial, serial);
                serial
            } else {
                if !state.lock_sessions.contains_key(&token) {
                    return Err(TrellisError::InvalidOperation(format!(
                        "unknown lock session {}",
                        token
                    )));
                }
                token
            };
            for (space_tag, id) in keys {
                let space = match space_tag {
                    1 => LockSpace::Node,
                    2 => LockSpace::Relationship,
                    other => {
                        return Err(TrellisError::Serialization(format!(
                            "bad lock space {}",
                            other
                        )))
                    }
                };
                if let Err(e) =
                    engine
                        .manager()
                        .locks()
                        .acquire(serial, ResourceKey { space, id }, LockMode::Write)
                {
                    engine.manager().locks().release_all(serial);
                    state.lock_sessions.remove(&serial);
                    return Err(e);
                }
            }
            Ok(ok(ResponsePayload::LockToken(serial)))
        }

        Request::ReleaseLocks { token } => {
            engine.manager().locks().release_all(token);
            state.lock_sessions.remove(&token);
            Ok(ok(ResponsePayload::LockToken(token)))
        }

        Request::Commit { resource, commands } => {
            if resource != RESOURCE_GRAPH {
                return Err(TrellisError::InvalidOperation(format!(
                    "commits are forwarded for the graph resource only, got '{}'",
                    resource
                )));
            }
            verify_branch_safety(state, ctx)?;

            let from = ctx
                .mark_for(RESOURCE_GRAPH)
                .map(|m| m.last_tx)
                .unwrap_or(TxId::ZERO);
            let decoded = decode_commands(&commands)?;
            let tx_id = engine.commit_forwarded(decoded)?;

            // Ship the follower everything it is missing, its own
            // transaction included, tagged with assigned ids.
            let missing = engine.source().extract(from)?;
            Ok(Response {
                result: Ok(ResponsePayload::Committed {
                    tx_id,
                    epoch: engine.source().current_epoch(),
                }),
                transactions_to_apply: vec![(RESOURCE_GRAPH.to_string(), missing)],
            })
        }

        Request::PullUpdates => {
            verify_branch_safety(state, ctx)?;
            let mut streams = Vec::new();
            for source in engine.registry().in_commit_order() {
                let from = ctx
                    .mark_for(source.name())
                    .map(|m| m.last_tx)
                    .unwrap_or(TxId::ZERO);
                streams.push((source.name().to_string(), source.extract(from)?));
            }

            // Retained history behind the slowest follower is dead weight.
            if let Some(slowest) = state
                .follower_progress
                .iter()
                .map(|entry| *entry.value())
                .min()
            {
                if let Err(e) = engine.source().prune_history(slowest) {
                    warn!(error = %e, "history pruning failed");
                }
            }

            Ok(Response {
                result: Ok(ResponsePayload::Pulled),
                transactions_to_apply: streams,
            })
        }

        Request::CopyStore => {
            let snapshot = state.engine.source().with_commits_blocked(|| -> Result<Vec<u8>> {
                let store = engine.store();
                store.flush_all()?;
                // The log files ride along so the follower inherits epoch
                // history; commits are blocked, so the tail produced
                // during the copy is empty by construction.
                let mut files = store.store_files();
                for entry in std::fs::read_dir(store.dir())? {
                    let name = entry?.file_name().to_string_lossy().to_string();
                    if name.starts_with(trellis_wal::LOG_BASE_NAME) {
                        files.push(name);
                    }
                }
                crate::copy::encode_snapshot(store.dir(), &files, &[])
            })?;
            info!(follower = %ctx.follower_id, bytes = snapshot.len(), "store copy served");
            Ok(ok(ResponsePayload::Snapshot(snapshot)))
        }

        Request::MasterEpochFor { resource, tx_id } => {
            let source = engine
                .registry()
                .get(&resource)
                .ok_or_else(|| TrellisError::InvalidOperation(format!(
                    "unknown resource '{}'",
                    resource
                )))?;
            Ok(ok(ResponsePayload::EpochOf(source.master_epoch_for(tx_id)?)))
        }
    }
}

/// Refuse followers whose history disagrees with ours.
///
/// For each context mark, the epoch the follower recorded for its last
/// applied transaction must equal the epoch this node's history recorded
/// for the same transaction id. A transaction we have never seen means
/// the follower committed under a dead primary.
fn verify_branch_safety(state: &ServerState, ctx: &FollowerContext) -> Result<()> {
    for mark in &ctx.marks {
        if mark.last_tx == TxId::ZERO {
            continue;
        }
        let source = match state.engine.registry().get(&mark.resource) {
            Some(source) => source,
            None => continue,
        };
        match source.master_epoch_for(mark.last_tx) {
            Ok(epoch) if epoch == mark.epoch => {}
            Ok(epoch) => {
                return Err(TrellisError::BranchedData {
                    resource: mark.resource.clone(),
                    tx_id: mark.last_tx,
                    local_epoch: mark.epoch,
                    primary_epoch: epoch,
                })
            }
            Err(TrellisError::NotFound { .. }) => {
                return Err(TrellisError::BranchedData {
                    resource: mark.resource.clone(),
                    tx_id: mark.last_tx,
                    local_epoch: mark.epoch,
                    primary_epoch: trellis_core::Epoch::NONE,
                })
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn ok(payload: ResponsePayload) -> Response {
    Response {
        result: Ok(payload),
        transactions_to_apply: Vec::new(),
    }
}
