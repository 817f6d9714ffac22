//! The logical log writer and its history.
//!
//! Append path (one transaction): `append_prepared` writes
//! `START, COMMAND*, PREPARE` and forces the file; `append_commit` writes
//! `COMMIT` and forces again; `append_done` writes `DONE` after the store
//! has been updated. A prepared transaction that aborts instead writes
//! `ROLLBACK` via `append_rollback`.
//!
//! Commands are buffered in their transaction until PREPARE, so a
//! transaction that rolls back before preparing leaves no trace in the log.

use crate::entry::{pack_frames, LogEntry};
use crate::recovery::{collect_transactions, RecoveredTx};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use trellis_core::{CommittedTx, Epoch, Result, TrellisError, TxId};

/// Base name of the logical log; halves append `.0` / `.1`.
pub const LOG_BASE_NAME: &str = "nioneo_logical.log";

/// Marker file holding which half is live (one byte, `'0'` or `'1'`).
pub const ACTIVE_MARKER_FILE: &str = "nioneo_logical.log.active";

const LOG_MAGIC: [u8; 4] = *b"TRLG";
const LOG_FORMAT_VERSION: u32 = 1;
const LOG_HEADER_SIZE: usize = 24;

/// Default rotation threshold.
const DEFAULT_ROTATE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Logical log options.
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Rotate when the active half passes this size.
    pub rotate_threshold: u64,
    /// Rename retired halves to `nioneo_logical.log.v{N}` instead of
    /// deleting them. Forced on in replicated mode.
    pub keep_logical_logs: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            rotate_threshold: DEFAULT_ROTATE_THRESHOLD,
            keep_logical_logs: false,
        }
    }
}

struct Inner {
    file: File,
    half: u8,
    log_version: u64,
    size: u64,
    next_local_id: u32,
    /// Transactions between PREPARE and DONE/ROLLBACK; rotation waits for
    /// this to drain.
    active: HashSet<u32>,
    /// Committed tx → epoch, covering retained history plus the live half.
    epochs: BTreeMap<TxId, Epoch>,
    max_committed: TxId,
}

/// The write-ahead logical log of one store directory.
pub struct LogicalLog {
    dir: PathBuf,
    options: LogOptions,
    inner: Mutex<Inner>,
}

impl LogicalLog {
    /// Open the log, scanning the active half for recovery.
    ///
    /// A torn entry at the tail (crash mid-append) is truncated away.
    /// Returns the log, the committed transactions found in the active
    /// half (for replay), and the count of discarded danglers.
    pub fn open(dir: &Path, options: LogOptions) -> Result<(LogicalLog, Vec<RecoveredTx>, usize)> {
        let marker_path = dir.join(ACTIVE_MARKER_FILE);

        let (half, fresh) = if marker_path.exists() {
            let mut byte = [0u8; 1];
            File::open(&marker_path)?.read_exact(&mut byte)?;
            match byte[0] {
                b'0' => (0u8, false),
                b'1' => (1u8, false),
                other => {
                    return Err(TrellisError::Corruption(format!(
                        "bad active log marker {:#x}",
                        other
                    )))
                }
            }
        } else {
            (0u8, true)
        };

        let path = half_path(dir, half);
        let (file, header, entries, truncated_at) = if fresh || !path.exists() {
            let (file, header) = create_log_file(&path, 0, TxId::ZERO)?;
            write_marker(&marker_path, half)?;
            (file, header, Vec::new(), None)
        } else {
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            let header = read_log_header(&mut file, &path)?;
            let (entries, good_end) = scan_entries(&mut file)?;
            let file_len = file.metadata()?.len();
            let truncated_at = if good_end < file_len {
                file.set_len(good_end)?;
                Some(good_end)
            } else {
                None
            };
            file.seek(SeekFrom::End(0))?;
            (file, header, entries, truncated_at)
        };

        if let Some(at) = truncated_at {
            warn!(offset = at, "truncated torn tail of logical log");
        }

        let (committed, discarded) = collect_transactions(&entries);

        let mut epochs = BTreeMap::new();
        // Retained history first, then the live half on top.
        for version in retained_versions(dir)? {
            for tx in scan_committed(&retained_path(dir, version))? {
                epochs.insert(tx.tx_id, tx.epoch);
            }
        }
        for tx in &committed {
            epochs.insert(tx.tx_id, tx.epoch);
        }

        let max_committed = epochs.keys().next_back().copied().unwrap_or(TxId::ZERO);
        let next_local_id = entries.iter().map(|e| e.local_id() + 1).max().unwrap_or(1);
        let size = file.metadata()?.len();

        debug!(
            half,
            log_version = header.log_version,
            committed = committed.len(),
            discarded,
            "opened logical log"
        );

        let log = LogicalLog {
            dir: dir.to_path_buf(),
            options,
            inner: Mutex::new(Inner {
                file,
                half,
                log_version: header.log_version,
                size,
                next_local_id,
                active: HashSet::new(),
                epochs,
                max_committed,
            }),
        };
        Ok((log, committed, discarded))
    }

    /// Current log version (advances on rotation).
    pub fn log_version(&self) -> u64 {
        self.inner.lock().log_version
    }

    /// Highest committed transaction id the log has seen.
    pub fn max_committed(&self) -> TxId {
        self.inner.lock().max_committed
    }

    /// Write `START, COMMAND*, PREPARE` for one transaction and force.
    ///
    /// Returns the file-local id used by the follow-up commit/rollback.
    pub fn append_prepared(&self, frames: &[Vec<u8>]) -> Result<u32> {
        let mut inner = self.inner.lock();
        let local_id = inner.next_local_id;
        inner.next_local_id += 1;

        let mut bytes = LogEntry::Start { local_id }.to_bytes();
        for frame in frames {
            bytes.extend_from_slice(
                &LogEntry::Command {
                    local_id,
                    bytes: frame.clone(),
                }
                .to_bytes(),
            );
        }
        bytes.extend_from_slice(&LogEntry::Prepare { local_id }.to_bytes());

        inner.file.write_all(&bytes)?;
        inner.file.sync_data()?;
        inner.size += bytes.len() as u64;
        inner.active.insert(local_id);
        Ok(local_id)
    }

    /// Write `COMMIT` with the assigned global id and force.
    ///
    /// After this returns the commit is durable: this is the point a
    /// client may be told its transaction succeeded.
    pub fn append_commit(
        &self,
        local_id: u32,
        tx_id: TxId,
        epoch: Epoch,
        timestamp: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.active.contains(&local_id) {
            return Err(TrellisError::InvalidOperation(format!(
                "commit of unknown log transaction {}",
                local_id
            )));
        }
        let bytes = LogEntry::Commit {
            local_id,
            tx_id,
            epoch,
            timestamp,
        }
        .to_bytes();
        inner.file.write_all(&bytes)?;
        inner.file.sync_data()?;
        inner.size += bytes.len() as u64;
        inner.epochs.insert(tx_id, epoch);
        if tx_id > inner.max_committed {
            inner.max_committed = tx_id;
        }
        Ok(())
    }

    /// Write `DONE` after the store has been updated. Not forced: a lost
    /// DONE only means one extra idempotent replay at recovery.
    pub fn append_done(&self, local_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let bytes = LogEntry::Done { local_id }.to_bytes();
        inner.file.write_all(&bytes)?;
        inner.size += bytes.len() as u64;
        inner.active.remove(&local_id);
        Ok(())
    }

    /// Write `ROLLBACK` for a prepared transaction that aborted.
    pub fn append_rollback(&self, local_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let bytes = LogEntry::Rollback { local_id }.to_bytes();
        inner.file.write_all(&bytes)?;
        inner.size += bytes.len() as u64;
        inner.active.remove(&local_id);
        Ok(())
    }

    /// Rotate when past the size threshold and no transaction is in
    /// flight.
    ///
    /// `flush_store` runs before the old half is retired: every logged
    /// transaction must be durable in the store files, because rotated
    /// history is not rescanned by recovery. Returns the new log version
    /// when rotation happened.
    pub fn maybe_rotate(&self, flush_store: impl FnOnce() -> Result<()>) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();
        if inner.size < self.options.rotate_threshold || !inner.active.is_empty() {
            return Ok(None);
        }

        flush_store()?;

        inner.file.sync_all()?;
        let old_half = inner.half;
        let old_version = inner.log_version;
        let old_path = half_path(&self.dir, old_half);

        if self.options.keep_logical_logs {
            std::fs::rename(&old_path, retained_path(&self.dir, old_version))?;
        } else {
            std::fs::remove_file(&old_path)?;
        }

        let new_half = 1 - old_half;
        let new_version = old_version + 1;
        let new_path = half_path(&self.dir, new_half);
        if new_path.exists() {
            // Leftover from two rotations ago; its transactions are long
            // since flushed.
            std::fs::remove_file(&new_path)?;
        }
        let (file, _) = create_log_file(&new_path, new_version, inner.max_committed)?;
        write_marker(&self.dir.join(ACTIVE_MARKER_FILE), new_half)?;

        inner.file = file;
        inner.half = new_half;
        inner.log_version = new_version;
        inner.size = LOG_HEADER_SIZE as u64;
        inner.next_local_id = 1;

        info!(
            version = new_version,
            retained = self.options.keep_logical_logs,
            "rotated logical log"
        );
        Ok(Some(new_version))
    }

    /// Committed history strictly after `from`, in tx-id order.
    ///
    /// Walks retained halves and then the live one. Returns an error when
    /// `from` predates retained history (the caller must fall back to a
    /// full store copy).
    pub fn extract(&self, from: TxId) -> Result<Vec<CommittedTx>> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;

        // If the oldest id we still have is > from + 1, history is gone.
        if let Some((&oldest, _)) = inner.epochs.iter().next() {
            if from.next() < oldest {
                return Err(TrellisError::InvalidOperation(format!(
                    "history before tx {} is no longer retained",
                    oldest
                )));
            }
        }

        let mut txs: Vec<CommittedTx> = Vec::new();
        for version in retained_versions(&self.dir)? {
            for tx in scan_committed(&retained_path(&self.dir, version))? {
                if tx.tx_id > from {
                    txs.push(to_committed(tx));
                }
            }
        }
        for tx in scan_committed(&half_path(&self.dir, inner.half))? {
            if tx.tx_id > from {
                txs.push(to_committed(tx));
            }
        }

        txs.sort_by_key(|tx| tx.tx_id);
        txs.dedup_by_key(|tx| tx.tx_id);
        Ok(txs)
    }

    /// Delete retained halves fully covered by `applied_through`.
    ///
    /// Called once every follower is known to have applied through that
    /// id; a retained half survives while any of its transactions might
    /// still be pulled. Returns the number of files removed.
    pub fn prune_retained(&self, applied_through: TxId) -> Result<usize> {
        let _inner = self.inner.lock();
        let mut removed = 0;
        for version in retained_versions(&self.dir)? {
            let path = retained_path(&self.dir, version);
            let max = scan_committed(&path)?
                .iter()
                .map(|tx| tx.tx_id)
                .max()
                .unwrap_or(TxId::ZERO);
            if max <= applied_through {
                std::fs::remove_file(&path)?;
                removed += 1;
                debug!(version, "pruned retained logical log");
            }
        }
        Ok(removed)
    }

    /// Epoch recorded in the COMMIT entry of `tx_id`.
    pub fn master_epoch_for(&self, tx_id: TxId) -> Result<Epoch> {
        if tx_id == TxId::ZERO {
            // The empty store predates every election.
            return Ok(Epoch::NONE);
        }
        self.inner
            .lock()
            .epochs
            .get(&tx_id)
            .copied()
            .ok_or(TrellisError::NotFound {
                what: "transaction",
                id: tx_id.0,
            })
    }

    /// Force and close the active half.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct LogHeader {
    log_version: u64,
    #[allow(dead_code)]
    prev_committed: TxId,
}

fn half_path(dir: &Path, half: u8) -> PathBuf {
    dir.join(format!("{}.{}", LOG_BASE_NAME, half))
}

fn retained_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{}.v{}", LOG_BASE_NAME, version))
}

/// Versions of retained log halves present in `dir`, ascending.
fn retained_versions(dir: &Path) -> Result<Vec<u64>> {
    let prefix = format!("{}.v", LOG_BASE_NAME);
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Ok(version) = rest.parse::<u64>() {
                versions.push(version);
            }
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

fn write_marker(path: &Path, half: u8) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&[b'0' + half])?;
    file.sync_all()?;
    Ok(())
}

fn create_log_file(path: &Path, log_version: u64, prev_committed: TxId) -> Result<(File, LogHeader)> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)?;
    let mut header = [0u8; LOG_HEADER_SIZE];
    header[0..4].copy_from_slice(&LOG_MAGIC);
    LittleEndian::write_u32(&mut header[4..8], LOG_FORMAT_VERSION);
    LittleEndian::write_u64(&mut header[8..16], log_version);
    LittleEndian::write_u64(&mut header[16..24], prev_committed.0);
    file.write_all(&header)?;
    file.sync_all()?;
    Ok((
        file,
        LogHeader {
            log_version,
            prev_committed,
        },
    ))
}

fn read_log_header(file: &mut File, path: &Path) -> Result<LogHeader> {
    let mut header = [0u8; LOG_HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).map_err(|_| {
        TrellisError::Corruption(format!("short log header in '{}'", path.display()))
    })?;
    if header[0..4] != LOG_MAGIC {
        return Err(TrellisError::Corruption(format!(
            "bad log magic in '{}'",
            path.display()
        )));
    }
    let format = LittleEndian::read_u32(&header[4..8]);
    if format != LOG_FORMAT_VERSION {
        return Err(TrellisError::Corruption(format!(
            "unsupported log format {} in '{}'",
            format,
            path.display()
        )));
    }
    Ok(LogHeader {
        log_version: LittleEndian::read_u64(&header[8..16]),
        prev_committed: TxId(LittleEndian::read_u64(&header[16..24])),
    })
}

/// Scan entries from the current position, stopping at a clean EOF or a
/// torn tail. Returns the entries and the offset of the last good byte.
fn scan_entries(file: &mut File) -> io::Result<(Vec<LogEntry>, u64)> {
    let mut reader = BufReader::new(&mut *file);
    let mut entries = Vec::new();
    let mut good_end = LOG_HEADER_SIZE as u64;

    loop {
        match LogEntry::read_from(&mut reader) {
            Ok(Some(entry)) => {
                good_end += entry.to_bytes().len() as u64;
                entries.push(entry);
            }
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok((entries, good_end))
}

/// Committed transactions of one log file, tolerant of a torn tail.
fn scan_committed(path: &Path) -> Result<Vec<RecoveredTx>> {
    let mut file = File::open(path)?;
    read_log_header(&mut file, path)?;
    let (entries, _) = scan_entries(&mut file)?;
    let (committed, _) = collect_transactions(&entries);
    Ok(committed)
}

fn to_committed(tx: RecoveredTx) -> CommittedTx {
    CommittedTx {
        tx_id: tx.tx_id,
        epoch: tx.epoch,
        commands: pack_frames(&tx.command_frames),
    }
}
