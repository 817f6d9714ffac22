//! A single fixed-record store file.
//!
//! Layout: a 32-byte version header `{magic, version, store_id}` followed
//! by records of one fixed size. Slot `id` lives at
//! `HEADER + id * record_size`; reading a slot past the end of the file
//! yields an all-zero (not in use) record.

use crate::paging::{PageBackend, PagedFile};
use byteorder::{ByteOrder, LittleEndian};
use std::path::{Path, PathBuf};
use trellis_core::{Result, StoreId, TrellisError};

/// Magic bytes identifying a Trellis store file.
pub const STORE_MAGIC: [u8; 4] = *b"TRLS";

/// Current store format version.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Size of the version header at the start of every store file.
pub const STORE_HEADER_SIZE: usize = 32;

/// The version header shared by all store files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    /// Format version.
    pub version: u32,
    /// Identity of the store this file belongs to.
    pub store_id: StoreId,
}

impl StoreHeader {
    /// Encode as the 32-byte on-disk header.
    pub fn to_bytes(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut bytes = [0u8; STORE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&STORE_MAGIC);
        LittleEndian::write_u32(&mut bytes[4..8], self.version);
        bytes[8..24].copy_from_slice(&self.store_id.to_bytes());
        bytes
    }

    /// Parse and validate the on-disk header.
    pub fn from_bytes(bytes: &[u8; STORE_HEADER_SIZE], path: &Path) -> Result<StoreHeader> {
        if bytes[0..4] != STORE_MAGIC {
            return Err(TrellisError::Corruption(format!(
                "bad magic in '{}'",
                path.display()
            )));
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != STORE_FORMAT_VERSION {
            return Err(TrellisError::Corruption(format!(
                "unsupported store version {} in '{}'",
                version,
                path.display()
            )));
        }
        let store_id = StoreId::from_bytes(bytes[8..24].try_into().unwrap());
        Ok(StoreHeader { version, store_id })
    }
}

/// A fixed-record file with a validated header.
pub struct RecordFile {
    paged: PagedFile,
    record_size: usize,
    header: StoreHeader,
    path: PathBuf,
}

impl RecordFile {
    /// Open a store file, creating it with the given identity when absent.
    ///
    /// An existing file must carry a valid header; when `expect_id` is set
    /// the header's store id must match it.
    pub fn open(
        path: &Path,
        record_size: usize,
        backend: PageBackend,
        read_only: bool,
        store_id: StoreId,
    ) -> Result<RecordFile> {
        let exists = path.exists();
        if !exists && read_only {
            return Err(TrellisError::Corruption(format!(
                "store file '{}' missing",
                path.display()
            )));
        }

        let mut paged = PagedFile::open(path, backend, read_only)?;

        let header = if !exists || paged.is_empty() {
            let header = StoreHeader {
                version: STORE_FORMAT_VERSION,
                store_id,
            };
            paged.write_at(0, &header.to_bytes())?;
            header
        } else {
            let mut bytes = [0u8; STORE_HEADER_SIZE];
            paged.read_at(0, &mut bytes)?;
            let header = StoreHeader::from_bytes(&bytes, path)?;
            if header.store_id != store_id {
                return Err(TrellisError::Corruption(format!(
                    "store file '{}' belongs to store {}, expected {}",
                    path.display(),
                    header.store_id,
                    store_id
                )));
            }
            header
        };

        Ok(RecordFile {
            paged,
            record_size,
            header,
            path: path.to_path_buf(),
        })
    }

    /// The file's validated header.
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    /// File path (for log messages).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record at `id` into `buf` (`buf.len() == record_size`).
    pub fn read(&self, id: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.record_size);
        self.paged.read_at(self.offset(id), buf)?;
        Ok(())
    }

    /// Write the record at `id` from `buf` (`buf.len() == record_size`).
    pub fn write(&mut self, id: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.record_size);
        self.paged.write_at(self.offset(id), buf)?;
        Ok(())
    }

    /// One past the highest slot the file has ever stored.
    pub fn high_id(&self) -> u64 {
        let data_len = self.paged.len().saturating_sub(STORE_HEADER_SIZE as u64);
        // Round up: a partially written trailing record still occupies a slot.
        (data_len + self.record_size as u64 - 1) / self.record_size as u64
    }

    /// Rebuild allocator state by scanning the in-use flags.
    ///
    /// Returns `(high, free)`: one past the highest in-use slot, and the
    /// unused slots below it. Trailing free slots (mapping slack after an
    /// unclean shutdown) are excluded entirely.
    pub fn scan_allocator_state(&self) -> Result<(u64, Vec<u64>)> {
        let mut free = Vec::new();
        let mut high = 0u64;
        let mut buf = vec![0u8; self.record_size];
        for id in 0..self.high_id() {
            self.read(id, &mut buf)?;
            if buf[0] == 0 {
                free.push(id);
            } else {
                high = id + 1;
            }
        }
        free.retain(|&id| id < high);
        Ok((high, free))
    }

    /// Flush dirty pages to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.paged.flush()?;
        Ok(())
    }

    /// Trim mapping slack; part of clean close.
    pub fn close(&mut self) -> Result<()> {
        self.paged.truncate_to_len()?;
        Ok(())
    }

    fn offset(&self, id: u64) -> u64 {
        STORE_HEADER_SIZE as u64 + id * self.record_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_write_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        let store_id = StoreId::generate();

        {
            let mut file =
                RecordFile::open(&path, 8, PageBackend::Direct, false, store_id).unwrap();
            file.write(0, &[1u8; 8]).unwrap();
            file.write(5, &[2u8; 8]).unwrap();
            assert_eq!(file.high_id(), 6);
            file.flush().unwrap();
        }

        let file = RecordFile::open(&path, 8, PageBackend::Direct, false, store_id).unwrap();
        let mut buf = [0u8; 8];
        file.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 8]);
        file.read(5, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 8]);
        // Unwritten slots read as zeroes
        file.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn rejects_foreign_store_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");

        let original = StoreId::generate();
        RecordFile::open(&path, 8, PageBackend::Direct, false, original).unwrap();

        let other = StoreId::generate();
        let result = RecordFile::open(&path, 8, PageBackend::Direct, false, other);
        assert!(matches!(result, Err(TrellisError::Corruption(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        std::fs::write(&path, [0xAAu8; 64]).unwrap();

        let result = RecordFile::open(&path, 8, PageBackend::Direct, false, StoreId::generate());
        assert!(matches!(result, Err(TrellisError::Corruption(_))));
    }

    #[test]
    fn allocator_scan_finds_unused_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        let store_id = StoreId::generate();

        let mut file = RecordFile::open(&path, 4, PageBackend::Direct, false, store_id).unwrap();
        file.write(0, &[1, 0, 0, 0]).unwrap();
        file.write(1, &[0, 0, 0, 0]).unwrap();
        file.write(2, &[1, 0, 0, 0]).unwrap();
        // Trailing zero slots are slack, not reclaimable ids
        file.write(5, &[0, 0, 0, 0]).unwrap();

        let (high, free) = file.scan_allocator_state().unwrap();
        assert_eq!(high, 3);
        assert_eq!(free, vec![1]);
    }
}
