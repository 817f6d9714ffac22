//! Log entry codec.
//!
//! Wire format of one entry: `{type_tag (1), tx_local_id (4), payload_len
//! (4), payload}`, integers little-endian like the store files. The
//! `tx_local_id` scopes interleaved transactions within one log file; the
//! global transaction id only exists once COMMIT assigns it.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{self, Read};
use trellis_core::{Epoch, TxId};

/// Entry type tags as written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Transaction opened.
    Start = 1,
    /// One mutated record's command.
    Command = 2,
    /// All commands flushed; log forced.
    Prepare = 3,
    /// Transaction committed with its assigned global id.
    Commit = 4,
    /// Store updated; transaction complete.
    Done = 5,
    /// Prepared transaction aborted.
    Rollback = 6,
}

impl EntryKind {
    fn from_tag(tag: u8) -> Option<EntryKind> {
        match tag {
            1 => Some(EntryKind::Start),
            2 => Some(EntryKind::Command),
            3 => Some(EntryKind::Prepare),
            4 => Some(EntryKind::Commit),
            5 => Some(EntryKind::Done),
            6 => Some(EntryKind::Rollback),
            _ => None,
        }
    }
}

/// One decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Transaction opened.
    Start {
        /// File-local transaction id.
        local_id: u32,
    },
    /// One command's encoded bytes.
    Command {
        /// File-local transaction id.
        local_id: u32,
        /// Encoded command (opaque to the log).
        bytes: Vec<u8>,
    },
    /// Commands flushed and forced.
    Prepare {
        /// File-local transaction id.
        local_id: u32,
    },
    /// Commit with the assigned global id.
    Commit {
        /// File-local transaction id.
        local_id: u32,
        /// Assigned global transaction id.
        tx_id: TxId,
        /// Epoch of the committing primary.
        epoch: Epoch,
        /// Commit wall-clock time, milliseconds since the epoch.
        timestamp: u64,
    },
    /// Store updated.
    Done {
        /// File-local transaction id.
        local_id: u32,
    },
    /// Prepared transaction aborted.
    Rollback {
        /// File-local transaction id.
        local_id: u32,
    },
}

/// Size of the COMMIT payload: tx id, epoch, timestamp.
const COMMIT_PAYLOAD_LEN: usize = 24;

impl LogEntry {
    /// The entry's file-local transaction id.
    pub fn local_id(&self) -> u32 {
        match self {
            LogEntry::Start { local_id }
            | LogEntry::Command { local_id, .. }
            | LogEntry::Prepare { local_id }
            | LogEntry::Commit { local_id, .. }
            | LogEntry::Done { local_id }
            | LogEntry::Rollback { local_id } => *local_id,
        }
    }

    /// Serialize for appending to the log.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, local_id, payload): (EntryKind, u32, Vec<u8>) = match self {
            LogEntry::Start { local_id } => (EntryKind::Start, *local_id, Vec::new()),
            LogEntry::Command { local_id, bytes } => {
                (EntryKind::Command, *local_id, bytes.clone())
            }
            LogEntry::Prepare { local_id } => (EntryKind::Prepare, *local_id, Vec::new()),
            LogEntry::Commit {
                local_id,
                tx_id,
                epoch,
                timestamp,
            } => {
                let mut payload = vec![0u8; COMMIT_PAYLOAD_LEN];
                LittleEndian::write_u64(&mut payload[0..8], tx_id.0);
                LittleEndian::write_u64(&mut payload[8..16], epoch.0);
                LittleEndian::write_u64(&mut payload[16..24], *timestamp);
                (EntryKind::Commit, *local_id, payload)
            }
            LogEntry::Done { local_id } => (EntryKind::Done, *local_id, Vec::new()),
            LogEntry::Rollback { local_id } => (EntryKind::Rollback, *local_id, Vec::new()),
        };

        let mut bytes = Vec::with_capacity(9 + payload.len());
        bytes.push(kind as u8);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, local_id);
        bytes.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, payload.len() as u32);
        bytes.extend_from_slice(&word);
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Read the next entry from a stream.
    ///
    /// Returns `Ok(None)` at a clean end of file, and
    /// `Err(io::ErrorKind::UnexpectedEof)` for a torn entry at the tail
    /// (crash mid-append): the caller truncates there.
    pub fn read_from(reader: &mut impl Read) -> io::Result<Option<LogEntry>> {
        let tag = match reader.read_u8() {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let kind = EntryKind::from_tag(tag).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad entry tag {}", tag))
        })?;
        let local_id = reader.read_u32::<LittleEndian>()?;
        let payload_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        let entry = match kind {
            EntryKind::Start => LogEntry::Start { local_id },
            EntryKind::Command => LogEntry::Command {
                local_id,
                bytes: payload,
            },
            EntryKind::Prepare => LogEntry::Prepare { local_id },
            EntryKind::Commit => {
                if payload.len() != COMMIT_PAYLOAD_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "short COMMIT payload",
                    ));
                }
                LogEntry::Commit {
                    local_id,
                    tx_id: TxId(LittleEndian::read_u64(&payload[0..8])),
                    epoch: Epoch(LittleEndian::read_u64(&payload[8..16])),
                    timestamp: LittleEndian::read_u64(&payload[16..24]),
                }
            }
            EntryKind::Done => LogEntry::Done { local_id },
            EntryKind::Rollback => LogEntry::Rollback { local_id },
        };
        Ok(Some(entry))
    }
}

/// Pack a transaction's command entries into one opaque stream.
///
/// Format: repeated `{len (4), bytes}` frames: one frame per COMMAND
/// entry, preserving order. This is the `commands` payload carried by
/// `CommittedTx` across the wire and through `apply_committed`.
pub fn pack_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut bytes = Vec::with_capacity(total);
    let mut word = [0u8; 4];
    for frame in frames {
        LittleEndian::write_u32(&mut word, frame.len() as u32);
        bytes.extend_from_slice(&word);
        bytes.extend_from_slice(frame);
    }
    bytes
}

/// Unpack a stream produced by [`pack_frames`].
pub fn unpack_frames(mut bytes: &[u8]) -> io::Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated frame header",
            ));
        }
        let len = LittleEndian::read_u32(&bytes[0..4]) as usize;
        if bytes.len() < 4 + len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated frame body",
            ));
        }
        frames.push(bytes[4..4 + len].to_vec());
        bytes = &bytes[4 + len..];
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_all_kinds() {
        let entries = vec![
            LogEntry::Start { local_id: 1 },
            LogEntry::Command {
                local_id: 1,
                bytes: vec![9, 8, 7],
            },
            LogEntry::Prepare { local_id: 1 },
            LogEntry::Commit {
                local_id: 1,
                tx_id: TxId(42),
                epoch: Epoch(3),
                timestamp: 1_700_000_000_000,
            },
            LogEntry::Done { local_id: 1 },
            LogEntry::Rollback { local_id: 2 },
        ];

        let mut bytes = Vec::new();
        for entry in &entries {
            bytes.extend_from_slice(&entry.to_bytes());
        }

        let mut cursor = Cursor::new(bytes);
        for expected in &entries {
            let entry = LogEntry::read_from(&mut cursor).unwrap().unwrap();
            assert_eq!(&entry, expected);
        }
        assert_eq!(LogEntry::read_from(&mut cursor).unwrap(), None);
    }

    #[test]
    fn torn_tail_is_unexpected_eof() {
        let full = LogEntry::Command {
            local_id: 7,
            bytes: vec![1; 100],
        }
        .to_bytes();

        // Cut the entry mid-payload
        let mut cursor = Cursor::new(full[..20].to_vec());
        let err = LogEntry::read_from(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn bad_tag_is_invalid_data() {
        let mut cursor = Cursor::new(vec![99u8, 0, 0, 0, 0, 0, 0, 0, 0]);
        let err = LogEntry::read_from(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frames_roundtrip() {
        let frames = vec![vec![1, 2, 3], vec![], vec![42; 300]];
        let packed = pack_frames(&frames);
        assert_eq!(unpack_frames(&packed).unwrap(), frames);
    }

    #[test]
    fn frames_reject_truncation() {
        let packed = pack_frames(&[vec![1, 2, 3]]);
        assert!(unpack_frames(&packed[..packed.len() - 1]).is_err());
    }
}
