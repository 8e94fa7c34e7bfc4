use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// A read-write mapping that backs one shared region.
///
/// Regions are either anonymous (shared by every thread of the process that
/// holds the handle) or backed by a file so that another process can map the
/// same bytes. The mapping is page aligned, which is what lets callers view
/// its start as any `#[repr(C)]` header with alignment up to a page.
pub struct SharedMap {
    _file: Option<File>,
    mmap: MmapMut,
}

impl SharedMap {
    /// Map `size_bytes` of zeroed anonymous memory.
    pub fn anonymous(size_bytes: usize) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(size_bytes.max(1))?;
        Ok(Self { _file: None, mmap })
    }

    /// Create (or truncate) a file of `size_bytes` and map it read-write
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size_bytes as u64)?;

        // SAFETY: the file was just created and sized by us; nobody else has
        // it mapped with a different length.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: Some(file),
            mmap,
        })
    }

    /// Open an existing file and map it to read and write
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the region is only ever accessed through atomics or under
        // the protocol of the structure laid over it.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            _file: Some(file),
            mmap,
        })
    }

    /// Raw pointer to start of the mapped bytes.
    ///
    /// Shared regions are written concurrently through interior mutability
    /// (atomics laid over the bytes), so handing out a `*mut` from `&self` is
    /// the intended use.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn is_file_backed(&self) -> bool {
        self._file.is_some()
    }

    /// Flush a file-backed mapping; no-op for anonymous ones.
    pub fn flush(&self) -> io::Result<()> {
        if self._file.is_some() {
            self.mmap.flush()?;
        }
        Ok(())
    }
}

// SAFETY: the mapping itself is plain memory; what is laid over it decides the
// synchronization, and every such structure uses atomics or external locks.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_maps_are_zeroed_and_page_aligned() {
        let m = SharedMap::anonymous(100).unwrap();
        assert!(m.len() >= 100);
        assert_eq!(m.as_ptr() as usize % 4096, 0);
        // SAFETY: within the mapping we own.
        let first = unsafe { std::slice::from_raw_parts(m.as_ptr(), 100) };
        assert!(first.iter().all(|b| *b == 0));
        assert!(!m.is_file_backed());
    }

    #[test]
    fn file_maps_share_bytes_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let writer = SharedMap::create_rw(&path, 64).unwrap();
        // SAFETY: in bounds of a 64 byte mapping.
        unsafe { writer.as_ptr().add(10).write(0xAB) };
        writer.flush().unwrap();

        let reader = SharedMap::open_rw(&path).unwrap();
        assert_eq!(reader.len(), 64);
        // SAFETY: in bounds.
        assert_eq!(unsafe { reader.as_ptr().add(10).read() }, 0xAB);
    }
}
