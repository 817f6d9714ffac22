//! Blocking client for the primary's RPC server.
//!
//! The kernel is synchronous, so the client owns a small tokio runtime
//! and blocks on each call with a deadline. Deadline expiry and every
//! transport error surface as `Communication`, which is the signal the
//! follower runtime escalates into re-election.

use crate::wire::{self, encode_request, FollowerContext, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use trellis_core::{Result, TrellisError};

/// Default per-call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);

/// Transport attempts for idempotent requests before giving up.
const RETRY_BUDGET: u32 = 3;

/// Base backoff between transport retries; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// One follower's handle to the primary.
pub struct PrimaryClient {
    addr: String,
    timeout: Duration,
    runtime: tokio::runtime::Runtime,
}

impl PrimaryClient {
    /// A client for the primary at `addr` (`host:port`).
    pub fn new(addr: &str, timeout: Duration) -> Result<PrimaryClient> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(PrimaryClient {
            addr: addr.to_string(),
            timeout,
            runtime,
        })
    }

    /// The primary address this client talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One request/response round trip under the deadline.
    ///
    /// Idempotent requests (pulls, reads, id reservations) are retried
    /// with backoff inside a bounded budget; a commit is attempted exactly
    /// once, because a lost response does not mean the commit was lost.
    /// The returned `Response` still carries a per-request error in
    /// `result`; transport-level failures become `Communication`.
    pub fn call(&self, ctx: &FollowerContext, request: &Request) -> Result<Response> {
        let idempotent = matches!(
            request,
            Request::PullUpdates
                | Request::CopyStore
                | Request::MasterEpochFor { .. }
                | Request::AllocateIds { .. }
        );
        let attempts = if idempotent { RETRY_BUDGET } else { 1 };

        let body = encode_request(ctx, request);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(RETRY_BACKOFF * 2u32.pow(attempt - 1));
            }
            match self.round_trip(&body) {
                Ok(bytes) => return wire::decode_response(&bytes),
                Err(e) => {
                    debug!(addr = %self.addr, attempt, error = %e, "rpc transport failure");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one attempt"))
    }

    fn round_trip(&self, body: &[u8]) -> Result<Vec<u8>> {
        let addr = self.addr.clone();
        let body = body.to_vec();
        let attempt = async move {
            let mut stream = TcpStream::connect(&addr).await?;
            stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
            stream.write_all(&body).await?;
            stream.flush().await?;

            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if len > wire::MAX_FRAME {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "oversized response frame",
                ));
            }
            let mut response = vec![0u8; len];
            stream.read_exact(&mut response).await?;
            Ok::<Vec<u8>, std::io::Error>(response)
        };

        match self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, attempt).await })
        {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(TrellisError::Communication(format!(
                "rpc to {} failed: {}",
                self.addr, e
            ))),
            Err(_) => Err(TrellisError::Communication(format!(
                "rpc to {} timed out after {:?}",
                self.addr, self.timeout
            ))),
        }
    }

    /// Like [`PrimaryClient::call`], but converts a per-request error into
    /// `Err` and hands back the payload with the piggy-backed stream.
    pub fn call_ok(
        &self,
        ctx: &FollowerContext,
        request: &Request,
    ) -> Result<(wire::ResponsePayload, Vec<(String, Vec<trellis_core::CommittedTx>)>)> {
        let response = self.call(ctx, request)?;
        match response.result {
            Ok(payload) => Ok((payload, response.transactions_to_apply)),
            Err(e) => Err(e.into()),
        }
    }
}
