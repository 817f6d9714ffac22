//! RPC wire format.
//!
//! Frames are a 4-byte big-endian length followed by the body; all
//! integers on the wire are big-endian. A request is
//! `{opcode, follower_context, args}`; a response is
//! `{status, transactions_to_apply, result}`. Every response can carry
//! piggy-backed transactions the follower is missing, not just
//! `pull_updates`.
//!
//! Command payloads inside transactions are opaque byte strings owned by
//! their data source.

use bytes::{Buf, BufMut, BytesMut};
use trellis_core::traits::IdRange;
use trellis_core::{CommittedTx, Epoch, IdKind, MachineId, Result, TrellisError, TxId};

/// Hard cap on a single frame, as a corruption guard.
pub const MAX_FRAME: usize = 256 * 1024 * 1024;

/// What a follower has applied, per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMark {
    /// Resource name in the registry.
    pub resource: String,
    /// Highest transaction applied on the follower.
    pub last_tx: TxId,
    /// Epoch the follower recorded for that transaction.
    pub epoch: Epoch,
}

/// The tuple a follower sends with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerContext {
    /// The follower's machine id.
    pub follower_id: MachineId,
    /// Client-side sequence number, for tracing.
    pub event_id: u64,
    /// Applied-through marks, one per resource.
    pub marks: Vec<ResourceMark>,
}

impl FollowerContext {
    /// The mark for one resource, if present.
    pub fn mark_for(&self, resource: &str) -> Option<&ResourceMark> {
        self.marks.iter().find(|m| m.resource == resource)
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Reserve id ranges of one kind.
    AllocateIds {
        /// Which id space.
        kind: IdKind,
        /// How many ids.
        count: u64,
    },
    /// Acquire write locks; `token` 0 opens a new lock session.
    AcquireLocks {
        /// Existing lock session, or 0.
        token: u64,
        /// `(space tag, record id)` pairs.
        keys: Vec<(u8, u64)>,
    },
    /// Release a lock session.
    ReleaseLocks {
        /// The session to release.
        token: u64,
    },
    /// Commit a forwarded transaction on one resource.
    Commit {
        /// Resource the commands belong to.
        resource: String,
        /// Encoded command stream.
        commands: Vec<u8>,
    },
    /// Stream everything past the context's marks.
    PullUpdates,
    /// Stream a consistent snapshot of the store files.
    CopyStore,
    /// Which epoch committed `tx_id` on `resource`.
    MasterEpochFor {
        /// Resource name.
        resource: String,
        /// Transaction in question.
        tx_id: TxId,
    },
}

impl Request {
    fn opcode(&self) -> u8 {
        match self {
            Request::AllocateIds { .. } => 1,
            Request::AcquireLocks { .. } => 2,
            Request::ReleaseLocks { .. } => 3,
            Request::Commit { .. } => 4,
            Request::PullUpdates => 5,
            Request::CopyStore => 6,
            Request::MasterEpochFor { .. } => 7,
        }
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// Reserved ranges.
    Ranges(Vec<IdRange>),
    /// Lock session token.
    LockToken(u64),
    /// Assigned id and epoch of a forwarded commit.
    Committed {
        /// Assigned transaction id.
        tx_id: TxId,
        /// Epoch of the committing primary.
        epoch: Epoch,
    },
    /// Pull served; everything is in `transactions_to_apply`.
    Pulled,
    /// Encoded snapshot (see [`crate::copy`]).
    Snapshot(Vec<u8>),
    /// Answer to `MasterEpochFor`.
    EpochOf(Epoch),
}

impl ResponsePayload {
    fn tag(&self) -> u8 {
        match self {
            ResponsePayload::Ranges(_) => 1,
            ResponsePayload::LockToken(_) => 2,
            ResponsePayload::Committed { .. } => 3,
            ResponsePayload::Pulled => 4,
            ResponsePayload::Snapshot(_) => 5,
            ResponsePayload::EpochOf(_) => 6,
        }
    }
}

/// A full response: result plus piggy-backed transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The request's outcome.
    pub result: std::result::Result<ResponsePayload, WireError>,
    /// Transactions the follower is missing, per resource, in apply
    /// order.
    pub transactions_to_apply: Vec<(String, Vec<CommittedTx>)>,
}

/// Errors that survive the wire with their structure intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Transaction-level failure; retryable on the client.
    TxFailure(String),
    /// Divergent history detected by the primary.
    BranchedData {
        /// Resource concerned.
        resource: String,
        /// Highest common transaction.
        tx_id: TxId,
        /// The follower's recorded epoch.
        local_epoch: Epoch,
        /// The primary's recorded epoch.
        primary_epoch: Epoch,
    },
    /// The follower asked for history with a gap.
    TxGap {
        /// Resource concerned.
        resource: String,
        /// Next acceptable id.
        expected: TxId,
        /// Offending id.
        got: TxId,
    },
    /// The serving node is not (or no longer) the primary.
    NotPrimary(String),
}

impl From<WireError> for TrellisError {
    fn from(e: WireError) -> TrellisError {
        match e {
            WireError::TxFailure(msg) => TrellisError::TxFailure(msg),
            WireError::BranchedData {
                resource,
                tx_id,
                local_epoch,
                primary_epoch,
            } => TrellisError::BranchedData {
                resource,
                tx_id,
                local_epoch,
                primary_epoch,
            },
            WireError::TxGap {
                resource,
                expected,
                got,
            } => TrellisError::TxGap {
                resource,
                expected,
                got,
            },
            WireError::NotPrimary(msg) => TrellisError::PrimaryLost(msg),
        }
    }
}

impl From<&TrellisError> for WireError {
    fn from(e: &TrellisError) -> WireError {
        match e {
            TrellisError::BranchedData {
                resource,
                tx_id,
                local_epoch,
                primary_epoch,
            } => WireError::BranchedData {
                resource: resource.clone(),
                tx_id: *tx_id,
                local_epoch: *local_epoch,
                primary_epoch: *primary_epoch,
            },
            TrellisError::TxGap {
                resource,
                expected,
                got,
            } => WireError::TxGap {
                resource: resource.clone(),
                expected: *expected,
                got: *got,
            },
            TrellisError::PrimaryLost(msg) => WireError::NotPrimary(msg.clone()),
            other => WireError::TxFailure(other.to_string()),
        }
    }
}

/// Id-kind tags on the wire.
pub fn kind_tag(kind: IdKind) -> u8 {
    match kind {
        IdKind::Node => 1,
        IdKind::Relationship => 2,
        IdKind::Property => 3,
        IdKind::PropertyString => 4,
        IdKind::PropertyArray => 5,
        IdKind::RelationshipType => 6,
        IdKind::PropertyKey => 7,
    }
}

/// Inverse of [`kind_tag`].
pub fn kind_from_tag(tag: u8) -> Result<IdKind> {
    Ok(match tag {
        1 => IdKind::Node,
        2 => IdKind::Relationship,
        3 => IdKind::Property,
        4 => IdKind::PropertyString,
        5 => IdKind::PropertyArray,
        6 => IdKind::RelationshipType,
        7 => IdKind::PropertyKey,
        other => {
            return Err(TrellisError::Serialization(format!(
                "bad id-kind tag {}",
                other
            )))
        }
    })
}

// === Primitive helpers ===

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn need(buf: &impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(TrellisError::Serialization(
            "truncated wire message".to_string(),
        ));
    }
    Ok(())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    if len > MAX_FRAME {
        return Err(TrellisError::Serialization(format!(
            "wire blob of {} bytes exceeds limit",
            len
        )));
    }
    need(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn get_string(buf: &mut impl Buf) -> Result<String> {
    String::from_utf8(get_bytes(buf)?)
        .map_err(|_| TrellisError::Serialization("non-UTF-8 wire string".to_string()))
}

fn put_context(buf: &mut BytesMut, ctx: &FollowerContext) {
    buf.put_u32(ctx.follower_id.0);
    buf.put_u64(ctx.event_id);
    buf.put_u32(ctx.marks.len() as u32);
    for mark in &ctx.marks {
        put_string(buf, &mark.resource);
        buf.put_u64(mark.last_tx.0);
        buf.put_u64(mark.epoch.0);
    }
}

fn get_context(buf: &mut impl Buf) -> Result<FollowerContext> {
    let follower_id = MachineId(get_u32(buf)?);
    let event_id = get_u64(buf)?;
    let count = get_u32(buf)? as usize;
    let mut marks = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        marks.push(ResourceMark {
            resource: get_string(buf)?,
            last_tx: TxId(get_u64(buf)?),
            epoch: Epoch(get_u64(buf)?),
        });
    }
    Ok(FollowerContext {
        follower_id,
        event_id,
        marks,
    })
}

pub(crate) fn put_tx_stream(buf: &mut BytesMut, streams: &[(String, Vec<CommittedTx>)]) {
    buf.put_u32(streams.len() as u32);
    for (resource, txs) in streams {
        put_string(buf, resource);
        buf.put_u32(txs.len() as u32);
        for tx in txs {
            buf.put_u64(tx.tx_id.0);
            buf.put_u64(tx.epoch.0);
            put_bytes(buf, &tx.commands);
        }
    }
}

pub(crate) fn get_tx_stream(buf: &mut impl Buf) -> Result<Vec<(String, Vec<CommittedTx>)>> {
    let resources = get_u32(buf)? as usize;
    let mut streams = Vec::with_capacity(resources.min(64));
    for _ in 0..resources {
        let resource = get_string(buf)?;
        let count = get_u32(buf)? as usize;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(CommittedTx {
                tx_id: TxId(get_u64(buf)?),
                epoch: Epoch(get_u64(buf)?),
                commands: get_bytes(buf)?,
            });
        }
        streams.push((resource, txs));
    }
    Ok(streams)
}

// === Requests ===

/// Encode a request body (no frame length).
pub fn encode_request(ctx: &FollowerContext, request: &Request) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(request.opcode());
    put_context(&mut buf, ctx);
    match request {
        Request::AllocateIds { kind, count } => {
            buf.put_u8(kind_tag(*kind));
            buf.put_u64(*count);
        }
        Request::AcquireLocks { token, keys } => {
            buf.put_u64(*token);
            buf.put_u32(keys.len() as u32);
            for (space, id) in keys {
                buf.put_u8(*space);
                buf.put_u64(*id);
            }
        }
        Request::ReleaseLocks { token } => {
            buf.put_u64(*token);
        }
        Request::Commit { resource, commands } => {
            put_string(&mut buf, resource);
            put_bytes(&mut buf, commands);
        }
        Request::PullUpdates | Request::CopyStore => {}
        Request::MasterEpochFor { resource, tx_id } => {
            put_string(&mut buf, resource);
            buf.put_u64(tx_id.0);
        }
    }
    buf.to_vec()
}

/// Decode a request body.
pub fn decode_request(mut buf: &[u8]) -> Result<(FollowerContext, Request)> {
    let opcode = get_u8(&mut buf)?;
    let ctx = get_context(&mut buf)?;
    let request = match opcode {
        1 => Request::AllocateIds {
            kind: kind_from_tag(get_u8(&mut buf)?)?,
            count: get_u64(&mut buf)?,
        },
        2 => {
            let token = get_u64(&mut buf)?;
            let count = get_u32(&mut buf)? as usize;
            let mut keys = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                keys.push((get_u8(&mut buf)?, get_u64(&mut buf)?));
            }
            Request::AcquireLocks { token, keys }
        }
        3 => Request::ReleaseLocks {
            token: get_u64(&mut buf)?,
        },
        4 => Request::Commit {
            resource: get_string(&mut buf)?,
            commands: get_bytes(&mut buf)?,
        },
        5 => Request::PullUpdates,
        6 => Request::CopyStore,
        7 => Request::MasterEpochFor {
            resource: get_string(&mut buf)?,
            tx_id: TxId(get_u64(&mut buf)?),
        },
        other => {
            return Err(TrellisError::Serialization(format!(
                "unknown opcode {}",
                other
            )))
        }
    };
    Ok((ctx, request))
}

// === Responses ===

/// Encode a response body (no frame length).
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut buf = BytesMut::new();
    match &response.result {
        Ok(payload) => {
            buf.put_u8(0);
            put_tx_stream(&mut buf, &response.transactions_to_apply);
            buf.put_u8(payload.tag());
            match payload {
                ResponsePayload::Ranges(ranges) => {
                    buf.put_u32(ranges.len() as u32);
                    for range in ranges {
                        buf.put_u64(range.start);
                        buf.put_u64(range.length);
                    }
                }
                ResponsePayload::LockToken(token) => buf.put_u64(*token),
                ResponsePayload::Committed { tx_id, epoch } => {
                    buf.put_u64(tx_id.0);
                    buf.put_u64(epoch.0);
                }
                ResponsePayload::Pulled => {}
                ResponsePayload::Snapshot(bytes) => put_bytes(&mut buf, bytes),
                ResponsePayload::EpochOf(epoch) => buf.put_u64(epoch.0),
            }
        }
        Err(error) => {
            buf.put_u8(1);
            put_tx_stream(&mut buf, &response.transactions_to_apply);
            match error {
                WireError::TxFailure(msg) => {
                    buf.put_u8(1);
                    put_string(&mut buf, msg);
                }
                WireError::BranchedData {
                    resource,
                    tx_id,
                    local_epoch,
                    primary_epoch,
                } => {
                    buf.put_u8(2);
                    put_string(&mut buf, resource);
                    buf.put_u64(tx_id.0);
                    buf.put_u64(local_epoch.0);
                    buf.put_u64(primary_epoch.0);
                }
                WireError::TxGap {
                    resource,
                    expected,
                    got,
                } => {
                    buf.put_u8(3);
                    put_string(&mut buf, resource);
                    buf.put_u64(expected.0);
                    buf.put_u64(got.0);
                }
                WireError::NotPrimary(msg) => {
                    buf.put_u8(4);
                    put_string(&mut buf, msg);
                }
            }
        }
    }
    buf.to_vec()
}

/// Decode a response body.
pub fn decode_response(mut buf: &[u8]) -> Result<Response> {
    let status = get_u8(&mut buf)?;
    let transactions_to_apply = get_tx_stream(&mut buf)?;
    let result = match status {
        0 => {
            let tag = get_u8(&mut buf)?;
            Ok(match tag {
                1 => {
                    let count = get_u32(&mut buf)? as usize;
                    let mut ranges = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        ranges.push(IdRange {
                            start: get_u64(&mut buf)?,
                            length: get_u64(&mut buf)?,
                        });
                    }
                    ResponsePayload::Ranges(ranges)
                }
                2 => ResponsePayload::LockToken(get_u64(&mut buf)?),
                3 => ResponsePayload::Committed {
                    tx_id: TxId(get_u64(&mut buf)?),
                    epoch: Epoch(get_u64(&mut buf)?),
                },
                4 => ResponsePayload::Pulled,
                5 => ResponsePayload::Snapshot(get_bytes(&mut buf)?),
                6 => ResponsePayload::EpochOf(Epoch(get_u64(&mut buf)?)),
                other => {
                    return Err(TrellisError::Serialization(format!(
                        "unknown payload tag {}",
                        other
                    )))
                }
            })
        }
        1 => {
            let tag = get_u8(&mut buf)?;
            Err(match tag {
                1 => WireError::TxFailure(get_string(&mut buf)?),
                2 => WireError::BranchedData {
                    resource: get_string(&mut buf)?,
                    tx_id: TxId(get_u64(&mut buf)?),
                    local_epoch: Epoch(get_u64(&mut buf)?),
                    primary_epoch: Epoch(get_u64(&mut buf)?),
                },
                3 => WireError::TxGap {
                    resource: get_string(&mut buf)?,
                    expected: TxId(get_u64(&mut buf)?),
                    got: TxId(get_u64(&mut buf)?),
                },
                4 => WireError::NotPrimary(get_string(&mut buf)?),
                other => {
                    return Err(TrellisError::Serialization(format!(
                        "unknown error tag {}",
                        other
                    )))
                }
            })
        }
        other => {
            return Err(TrellisError::Serialization(format!(
                "unknown status {}",
                other
            )))
        }
    };
    Ok(Response {
        result,
        transactions_to_apply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FollowerContext {
        FollowerContext {
            follower_id: MachineId(3),
            event_id: 77,
            marks: vec![ResourceMark {
                resource: "graph".to_string(),
                last_tx: TxId(12),
                epoch: Epoch(2),
            }],
        }
    }

    #[test]
    fn request_roundtrip_all_opcodes() {
        let requests = vec![
            Request::AllocateIds {
                kind: IdKind::Node,
                count: 128,
            },
            Request::AcquireLocks {
                token: 0,
                keys: vec![(1, 5), (2, 9)],
            },
            Request::ReleaseLocks { token: 42 },
            Request::Commit {
                resource: "graph".to_string(),
                commands: vec![1, 2, 3],
            },
            Request::PullUpdates,
            Request::CopyStore,
            Request::MasterEpochFor {
                resource: "graph".to_string(),
                tx_id: TxId(7),
            },
        ];

        for request in requests {
            let bytes = encode_request(&ctx(), &request);
            let (decoded_ctx, decoded) = decode_request(&bytes).unwrap();
            assert_eq!(decoded_ctx, ctx());
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn response_roundtrip_with_piggyback() {
        let response = Response {
            result: Ok(ResponsePayload::Committed {
                tx_id: TxId(9),
                epoch: Epoch(3),
            }),
            transactions_to_apply: vec![(
                "graph".to_string(),
                vec![
                    CommittedTx {
                        tx_id: TxId(8),
                        epoch: Epoch(2),
                        commands: vec![4, 5],
                    },
                    CommittedTx {
                        tx_id: TxId(9),
                        epoch: Epoch(3),
                        commands: vec![6],
                    },
                ],
            )],
        };

        let bytes = encode_response(&response);
        assert_eq!(decode_response(&bytes).unwrap(), response);
    }

    #[test]
    fn error_responses_keep_structure() {
        let response = Response {
            result: Err(WireError::BranchedData {
                resource: "graph".to_string(),
                tx_id: TxId(5),
                local_epoch: Epoch(1),
                primary_epoch: Epoch(2),
            }),
            transactions_to_apply: Vec::new(),
        };

        let decoded = decode_response(&encode_response(&response)).unwrap();
        let err: TrellisError = decoded.result.unwrap_err().into();
        assert!(matches!(err, TrellisError::BranchedData { tx_id: TxId(5), .. }));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode_request(&ctx(), &Request::PullUpdates);
        assert!(decode_request(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn kind_tags_roundtrip() {
        for kind in IdKind::ALL {
            assert_eq!(kind_from_tag(kind_tag(kind)).unwrap(), kind);
        }
        assert!(kind_from_tag(99).is_err());
    }
}
