//! Id allocation with persisted high-water mark and free-list.
//!
//! Each store file has an `.id` sibling holding the allocator state: the
//! high-water mark and the ids reclaimed from deleted records. The file
//! carries a clean-shutdown flag; when it is missing or dirty the free-list
//! is rebuilt by scanning the store file for unused slots.
//!
//! Ids are handed out from the free-list first, then from the high-water
//! mark, so ids are monotonically increasing except when reclaimed.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use trellis_core::traits::IdRange;
use trellis_core::{Result, TrellisError};

const ID_FILE_MAGIC: [u8; 4] = *b"TRID";
const ID_FILE_VERSION: u32 = 1;
const ID_HEADER_SIZE: usize = 17; // magic + version + clean flag + high water

struct AllocatorState {
    high: u64,
    free: Vec<u64>,
}

/// Allocator for one id space.
pub struct IdAllocator {
    state: Mutex<AllocatorState>,
    path: PathBuf,
    read_only: bool,
}

impl IdAllocator {
    /// Open the `.id` file at `path`.
    ///
    /// Returns the allocator and whether the caller must rebuild the
    /// free-list (file missing, dirty, or malformed). After a successful
    /// load the file is re-marked dirty until [`IdAllocator::close`].
    pub fn open(path: &Path, read_only: bool) -> Result<(IdAllocator, bool)> {
        let (state, needs_rebuild) = match Self::load(path) {
            Ok(Some(state)) => (state, false),
            Ok(None) => (
                AllocatorState {
                    high: 0,
                    free: Vec::new(),
                },
                true,
            ),
            Err(_) => (
                AllocatorState {
                    high: 0,
                    free: Vec::new(),
                },
                true,
            ),
        };

        let allocator = IdAllocator {
            state: Mutex::new(state),
            path: path.to_path_buf(),
            read_only,
        };

        if !read_only {
            // Mark dirty while open; a crash before close() forces a rebuild.
            allocator.persist(false)?;
        }

        Ok((allocator, needs_rebuild))
    }

    fn load(path: &Path) -> Result<Option<AllocatorState>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = std::fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < ID_HEADER_SIZE || bytes[0..4] != ID_FILE_MAGIC {
            return Err(TrellisError::Corruption(format!(
                "malformed id file '{}'",
                path.display()
            )));
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != ID_FILE_VERSION {
            return Err(TrellisError::Corruption(format!(
                "unsupported id file version {} in '{}'",
                version,
                path.display()
            )));
        }
        let clean = bytes[8] == 1;
        if !clean {
            return Ok(None);
        }
        let high = LittleEndian::read_u64(&bytes[9..17]);

        let tail = &bytes[ID_HEADER_SIZE..];
        if tail.len() % 8 != 0 {
            return Err(TrellisError::Corruption(format!(
                "truncated free-list in '{}'",
                path.display()
            )));
        }
        let free = tail.chunks(8).map(LittleEndian::read_u64).collect();

        Ok(Some(AllocatorState { high, free }))
    }

    fn persist(&self, clean: bool) -> Result<()> {
        let state = self.state.lock();
        let mut bytes = Vec::with_capacity(ID_HEADER_SIZE + state.free.len() * 8);
        bytes.extend_from_slice(&ID_FILE_MAGIC);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, ID_FILE_VERSION);
        bytes.extend_from_slice(&word);
        bytes.push(clean as u8);
        let mut long = [0u8; 8];
        LittleEndian::write_u64(&mut long, state.high);
        bytes.extend_from_slice(&long);
        if clean {
            for id in &state.free {
                LittleEndian::write_u64(&mut long, *id);
                bytes.extend_from_slice(&long);
            }
        }
        drop(state);

        let mut file = std::fs::File::create(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Next free id: reclaimed ids first, then the high-water mark.
    pub fn next(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return id;
        }
        let id = state.high;
        state.high += 1;
        id
    }

    /// Reserve `length` sequential ids from the high-water mark.
    ///
    /// Ranges skip the free-list so a follower's reservation is contiguous.
    pub fn reserve_range(&self, length: u64) -> IdRange {
        let mut state = self.state.lock();
        let start = state.high;
        state.high += length;
        IdRange { start, length }
    }

    /// Return a reclaimed id to the free-list.
    pub fn release(&self, id: u64) {
        let mut state = self.state.lock();
        if id + 1 == state.high {
            state.high -= 1;
        } else {
            state.free.push(id);
        }
    }

    /// Current high-water mark.
    pub fn high_id(&self) -> u64 {
        self.state.lock().high
    }

    /// Raise the high-water mark to cover an externally assigned id.
    ///
    /// A follower applying a primary's command stream sees ids it never
    /// allocated; the mark must move past them.
    pub fn note_used(&self, id: u64) {
        let mut state = self.state.lock();
        if id >= state.high {
            state.high = id + 1;
        }
    }

    /// Replace the allocator state after a store scan.
    pub fn rebuild(&self, high: u64, free: Vec<u64>) {
        let mut state = self.state.lock();
        state.high = high;
        state.free = free;
    }

    /// Number of reclaimed ids currently available.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Persist state with the clean flag set.
    pub fn close(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.persist(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_allocator_counts_up() {
        let dir = tempdir().unwrap();
        let (alloc, needs_rebuild) = IdAllocator::open(&dir.path().join("n.id"), false).unwrap();
        assert!(needs_rebuild);
        assert_eq!(alloc.next(), 0);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
    }

    #[test]
    fn release_and_reuse() {
        let dir = tempdir().unwrap();
        let (alloc, _) = IdAllocator::open(&dir.path().join("n.id"), false).unwrap();
        for _ in 0..5 {
            alloc.next();
        }
        alloc.release(2);
        assert_eq!(alloc.next(), 2);
        assert_eq!(alloc.next(), 5);
    }

    #[test]
    fn release_of_highest_id_shrinks_mark() {
        let dir = tempdir().unwrap();
        let (alloc, _) = IdAllocator::open(&dir.path().join("n.id"), false).unwrap();
        alloc.next();
        alloc.next();
        alloc.release(1);
        assert_eq!(alloc.high_id(), 1);
    }

    #[test]
    fn clean_close_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("n.id");

        {
            let (alloc, _) = IdAllocator::open(&path, false).unwrap();
            for _ in 0..10 {
                alloc.next();
            }
            alloc.release(3);
            alloc.release(7);
            alloc.close().unwrap();
        }

        let (alloc, needs_rebuild) = IdAllocator::open(&path, false).unwrap();
        assert!(!needs_rebuild);
        assert_eq!(alloc.high_id(), 10);
        assert_eq!(alloc.free_count(), 2);
    }

    #[test]
    fn unclean_shutdown_forces_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("n.id");

        {
            let (alloc, _) = IdAllocator::open(&path, false).unwrap();
            alloc.next();
            // No close(): file stays marked dirty
        }

        let (_, needs_rebuild) = IdAllocator::open(&path, false).unwrap();
        assert!(needs_rebuild);
    }

    #[test]
    fn note_used_moves_mark() {
        let dir = tempdir().unwrap();
        let (alloc, _) = IdAllocator::open(&dir.path().join("n.id"), false).unwrap();
        alloc.note_used(41);
        assert_eq!(alloc.next(), 42);
    }

    #[test]
    fn range_reservation_is_contiguous() {
        let dir = tempdir().unwrap();
        let (alloc, _) = IdAllocator::open(&dir.path().join("n.id"), false).unwrap();
        alloc.next();
        alloc.release(0);

        let range = alloc.reserve_range(100);
        assert_eq!(range.start, 1);
        assert_eq!(range.length, 100);
        assert_eq!(alloc.high_id(), 101);
    }
}
