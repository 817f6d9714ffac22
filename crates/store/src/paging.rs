//! Paging backends for store files.
//!
//! Records are read and written through a [`PagedFile`], which is either a
//! memory mapping (`memmap2`) or positional I/O on the raw file. The
//! backend is chosen at open time: memory mapping by default on 64-bit
//! targets, positional I/O where address space is scarce, and either can be
//! forced by configuration.
//!
//! The mapping grows in fixed increments; growing remaps, which is safe
//! because every access goes through the owning file's latch.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Growth increment for mapped files.
const GROW_CHUNK: u64 = 1024 * 1024;

/// Which backend a store file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBackend {
    /// Memory-mapped access.
    Mapped,
    /// Positional read/write on the file descriptor.
    Direct,
}

impl PageBackend {
    /// Pick a backend from configuration, falling back to an
    /// address-space-based default.
    pub fn auto(use_memory_mapped: Option<bool>) -> PageBackend {
        match use_memory_mapped {
            Some(true) => PageBackend::Mapped,
            Some(false) => PageBackend::Direct,
            // Mapping every store file is only safe when address space is
            // effectively unlimited.
            None if cfg!(target_pointer_width = "64") => PageBackend::Mapped,
            None => PageBackend::Direct,
        }
    }
}

enum Pages {
    Mapped { map: memmap2::MmapMut, mapped_len: u64 },
    Direct,
}

/// A store file with offset-addressed reads and writes.
pub struct PagedFile {
    file: File,
    len: u64,
    pages: Pages,
}

impl PagedFile {
    /// Open (creating if necessary) a file with the given backend.
    ///
    /// Read-only opens always use positional I/O: a writable mapping needs
    /// write access, and a read-only store has no throughput to gain.
    pub fn open(path: &Path, backend: PageBackend, read_only: bool) -> io::Result<PagedFile> {
        let backend = if read_only {
            PageBackend::Direct
        } else {
            backend
        };
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();

        let pages = match backend {
            PageBackend::Mapped => {
                let mapped_len = len.max(GROW_CHUNK);
                if !read_only && len < mapped_len {
                    file.set_len(mapped_len)?;
                }
                // Safety: the file is only accessed through this handle,
                // behind the owning store's latch.
                let map = unsafe { memmap2::MmapMut::map_mut(&file)? };
                Pages::Mapped { map, mapped_len }
            }
            PageBackend::Direct => Pages::Direct,
        };

        Ok(PagedFile { file, len, pages })
    }

    /// Logical length in bytes (excludes mapping slack).
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when no bytes have been written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read `buf.len()` bytes at `offset`. Reads past the logical length
    /// yield zeroes (an unused record slot).
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset >= self.len {
            buf.fill(0);
            return Ok(());
        }
        let available = (self.len - offset).min(buf.len() as u64) as usize;
        match &self.pages {
            Pages::Mapped { map, .. } => {
                let start = offset as usize;
                buf[..available].copy_from_slice(&map[start..start + available]);
            }
            Pages::Direct => {
                read_exact_at(&self.file, &mut buf[..available], offset)?;
            }
        }
        buf[available..].fill(0);
        Ok(())
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset + data.len() as u64;
        self.ensure_capacity(end)?;
        match &mut self.pages {
            Pages::Mapped { map, .. } => {
                let start = offset as usize;
                map[start..start + data.len()].copy_from_slice(data);
            }
            Pages::Direct => {
                write_all_at(&self.file, data, offset)?;
            }
        }
        if end > self.len {
            self.len = end;
        }
        Ok(())
    }

    /// Flush dirty pages and file metadata to stable storage.
    pub fn flush(&mut self) -> io::Result<()> {
        if let Pages::Mapped { map, .. } = &self.pages {
            map.flush()?;
        }
        self.file.sync_all()
    }

    /// Trim mapping slack down to the logical length. Called on clean close
    /// so record counts derived from file size stay exact.
    pub fn truncate_to_len(&mut self) -> io::Result<()> {
        if let Pages::Mapped { map, .. } = &self.pages {
            map.flush()?;
        }
        // Drop the mapping before shrinking the file underneath it.
        if matches!(self.pages, Pages::Mapped { .. }) {
            self.pages = Pages::Direct;
        }
        self.file.set_len(self.len)?;
        self.file.sync_all()
    }

    fn ensure_capacity(&mut self, required: u64) -> io::Result<()> {
        match &mut self.pages {
            Pages::Mapped { map, mapped_len } => {
                if required > *mapped_len {
                    let new_len = required.max(*mapped_len + GROW_CHUNK);
                    map.flush()?;
                    self.file.set_len(new_len)?;
                    *map = unsafe { memmap2::MmapMut::map_mut(&self.file)? };
                    *mapped_len = new_len;
                }
            }
            Pages::Direct => {}
        }
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn roundtrip(backend: PageBackend) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        let mut paged = PagedFile::open(&path, backend, false).unwrap();
        paged.write_at(0, b"hello").unwrap();
        paged.write_at(100, b"world").unwrap();
        assert_eq!(paged.len(), 105);

        let mut buf = [0u8; 5];
        paged.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        paged.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // Reads past the end are zeroes
        let mut buf = [1u8; 8];
        paged.read_at(1000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);

        paged.flush().unwrap();
    }

    #[test]
    fn direct_roundtrip() {
        roundtrip(PageBackend::Direct);
    }

    #[test]
    fn mapped_roundtrip() {
        roundtrip(PageBackend::Mapped);
    }

    #[test]
    fn mapped_grows_past_initial_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        let mut paged = PagedFile::open(&path, PageBackend::Mapped, false).unwrap();
        let offset = 3 * GROW_CHUNK;
        paged.write_at(offset, &[42u8; 16]).unwrap();

        let mut buf = [0u8; 16];
        paged.read_at(offset, &mut buf).unwrap();
        assert_eq!(buf, [42u8; 16]);
    }

    #[test]
    fn truncate_restores_logical_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        {
            let mut paged = PagedFile::open(&path, PageBackend::Mapped, false).unwrap();
            paged.write_at(0, &[7u8; 64]).unwrap();
            paged.truncate_to_len().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);

        // Reopen direct and verify contents survived
        let paged = PagedFile::open(&path, PageBackend::Direct, false).unwrap();
        let mut buf = [0u8; 64];
        paged.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 64]);
    }

    #[test]
    fn backend_auto_selection() {
        assert_eq!(PageBackend::auto(Some(true)), PageBackend::Mapped);
        assert_eq!(PageBackend::auto(Some(false)), PageBackend::Direct);
    }
}
