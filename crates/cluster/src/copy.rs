//! Full store copy for joining followers.
//!
//! Wire format: a sequence of `{path_len, relative_path, length, bytes}`
//! records terminated by `{path = "", length = 0}`, followed by the tail
//! of the logical log produced during the snapshot (empty when the
//! primary blocks commits for the duration of the copy, which this
//! implementation does). Integers big-endian like the rest of the wire.

use crate::wire::{get_tx_stream, put_tx_stream};
use bytes::{Buf, BufMut, BytesMut};
use std::path::Path;
use tracing::{debug, info};
use trellis_core::{CommittedTx, Result, TrellisError};

/// Encode the named store files (relative to `dir`) plus the log tail.
pub fn encode_snapshot(
    dir: &Path,
    files: &[String],
    tail: &[(String, Vec<CommittedTx>)],
) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    for name in files {
        let path = dir.join(name);
        let bytes = std::fs::read(&path)?;
        buf.put_u32(name.len() as u32);
        buf.put_slice(name.as_bytes());
        buf.put_u64(bytes.len() as u64);
        buf.put_slice(&bytes);
        debug!(file = %name, bytes = bytes.len(), "snapshot file");
    }
    // Terminator
    buf.put_u32(0);
    buf.put_u64(0);
    put_tx_stream(&mut buf, tail);
    Ok(buf.to_vec())
}

/// Unpack a snapshot into `dir`; returns the log tail to apply.
pub fn decode_snapshot_into(
    dir: &Path,
    snapshot: &[u8],
) -> Result<Vec<(String, Vec<CommittedTx>)>> {
    std::fs::create_dir_all(dir)?;
    let mut buf = snapshot;
    let mut files = 0usize;
    loop {
        if buf.remaining() < 4 {
            return Err(TrellisError::Serialization(
                "truncated snapshot header".to_string(),
            ));
        }
        let name_len = buf.get_u32() as usize;
        if buf.remaining() < name_len {
            return Err(TrellisError::Serialization(
                "truncated snapshot path".to_string(),
            ));
        }
        let mut name_bytes = vec![0u8; name_len];
        buf.copy_to_slice(&mut name_bytes);
        let name = String::from_utf8(name_bytes)
            .map_err(|_| TrellisError::Serialization("non-UTF-8 snapshot path".to_string()))?;

        if buf.remaining() < 8 {
            return Err(TrellisError::Serialization(
                "truncated snapshot length".to_string(),
            ));
        }
        let length = buf.get_u64() as usize;
        if name.is_empty() && length == 0 {
            break;
        }
        // Refuse anything that would escape the target directory.
        if name.contains("..") || name.starts_with('/') {
            return Err(TrellisError::Serialization(format!(
                "snapshot path '{}' is not relative",
                name
            )));
        }
        if buf.remaining() < length {
            return Err(TrellisError::Serialization(
                "truncated snapshot body".to_string(),
            ));
        }
        let mut bytes = vec![0u8; length];
        buf.copy_to_slice(&mut bytes);
        std::fs::write(dir.join(&name), &bytes)?;
        files += 1;
    }
    let tail = get_tx_stream(&mut buf)?;
    info!(files, "store copy unpacked");
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trellis_core::{Epoch, TxId};

    #[test]
    fn snapshot_roundtrip() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("neostore"), b"meta").unwrap();
        std::fs::write(src.path().join("neostore.nodestore.db"), vec![7u8; 300]).unwrap();

        let tail = vec![(
            "graph".to_string(),
            vec![CommittedTx {
                tx_id: TxId(3),
                epoch: Epoch(1),
                commands: vec![1, 2],
            }],
        )];
        let snapshot = encode_snapshot(
            src.path(),
            &["neostore".to_string(), "neostore.nodestore.db".to_string()],
            &tail,
        )
        .unwrap();

        let dst = tempdir().unwrap();
        let decoded_tail = decode_snapshot_into(dst.path(), &snapshot).unwrap();
        assert_eq!(decoded_tail, tail);
        assert_eq!(std::fs::read(dst.path().join("neostore")).unwrap(), b"meta");
        assert_eq!(
            std::fs::read(dst.path().join("neostore.nodestore.db")).unwrap(),
            vec![7u8; 300]
        );
    }

    #[test]
    fn hostile_paths_rejected() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("ok"), b"x").unwrap();

        let mut snapshot = Vec::new();
        let name = b"../escape";
        snapshot.extend_from_slice(&(name.len() as u32).to_be_bytes());
        snapshot.extend_from_slice(name);
        snapshot.extend_from_slice(&1u64.to_be_bytes());
        snapshot.push(0);

        let dst = tempdir().unwrap();
        assert!(decode_snapshot_into(dst.path(), &snapshot).is_err());
    }

    #[test]
    fn truncated_snapshot_rejected() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("f"), vec![1u8; 64]).unwrap();
        let snapshot = encode_snapshot(src.path(), &["f".to_string()], &[]).unwrap();

        let dst = tempdir().unwrap();
        assert!(decode_snapshot_into(dst.path(), &snapshot[..snapshot.len() - 4]).is_err());
    }
}
