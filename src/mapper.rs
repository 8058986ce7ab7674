use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr;

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{ChainMapError, Result};

/// A growable memory-mapped file with positional reads and writes.
///
/// Every access takes the read half of the mapping lock for its duration, so
/// `grow` can safely replace the mapping under the write half without any
/// outstanding pointers into the old region. The mapper does not serialize
/// writers against each other or against readers of the same offsets; the
/// engine's stripe locks do that for all shared locations.
pub(crate) struct FileMapper {
    file: File,
    map: RwLock<Mapping>,
}

struct Mapping {
    ptr: *mut u8,
    len: u64,
    mmap: MmapMut,
}

// The raw pointer targets the owned mapping and is only dereferenced while
// the enclosing RwLock is held.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl FileMapper {
    /// Opens or creates the file at `path`, extending it to at least
    /// `min_len` bytes before mapping.
    pub fn open(path: &Path, min_len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < min_len {
            file.set_len(min_len)?;
        }
        let mapping = Self::map(&file)?;
        Ok(FileMapper {
            file,
            map: RwLock::new(mapping),
        })
    }

    fn map(file: &File) -> Result<Mapping> {
        let len = file.metadata()?.len();
        // Safety: the mapping is owned by the returned struct and replaced
        // only under the write lock, with no reader holding a pointer into it.
        let mut mmap = unsafe { MmapMut::map_mut(file)? };
        let ptr = mmap.as_mut_ptr();
        Ok(Mapping { ptr, len, mmap })
    }

    /// Currently mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.map.read().len
    }

    pub fn get_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn put_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn get_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn put_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let map = self.map.read();
        map.check_range(offset, data.len() as u64)?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), map.ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let map = self.map.read();
        map.check_range(offset, buf.len() as u64)?;
        unsafe {
            ptr::copy_nonoverlapping(map.ptr.add(offset as usize), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Extends the file to `new_len` bytes and remaps it. The extension is
    /// zero-filled by the filesystem. No-op when the file already covers
    /// `new_len`, so concurrent growers settle on the largest request.
    pub fn grow(&self, new_len: u64) -> Result<()> {
        let mut map = self.map.write();
        if new_len <= map.len {
            return Ok(());
        }
        self.file.set_len(new_len)?;
        *map = Self::map(&self.file)?;
        Ok(())
    }

    /// Syncs the mapped region to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.read().mmap.flush()?;
        Ok(())
    }
}

impl Mapping {
    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| end <= self.len);
        if !in_bounds {
            return Err(ChainMapError::Corruption(format!(
                "access [{offset}, +{len}) outside mapped length {}",
                self.len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = FileMapper::open(&dir.path().join("data"), 4096).unwrap();
        mapper.put_u64(0, u64::MAX).unwrap();
        mapper.put_u64(8, 0x0123_4567_89ab_cdef).unwrap();
        mapper.put_u64(4088, 42).unwrap();
        assert_eq!(mapper.get_u64(0).unwrap(), u64::MAX);
        assert_eq!(mapper.get_u64(8).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(mapper.get_u64(4088).unwrap(), 42);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = FileMapper::open(&dir.path().join("data"), 4096).unwrap();
        mapper.put_bytes(100, b"hello world").unwrap();
        assert_eq!(mapper.get_bytes(100, 11).unwrap(), b"hello world");
        assert_eq!(mapper.get_bytes(200, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = FileMapper::open(&dir.path().join("data"), 64).unwrap();
        assert!(mapper.get_u64(60).is_err());
        assert!(mapper.put_bytes(64, b"x").is_err());
        assert!(mapper.get_bytes(u64::MAX, 8).is_err());
    }

    #[test]
    fn test_grow_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = FileMapper::open(&dir.path().join("data"), 64).unwrap();
        mapper.put_bytes(0, b"persistent").unwrap();
        mapper.grow(1 << 16).unwrap();
        assert_eq!(mapper.len(), 1 << 16);
        assert_eq!(mapper.get_bytes(0, 10).unwrap(), b"persistent");
        // Extension is zero-filled.
        assert_eq!(mapper.get_u64(1 << 15).unwrap(), 0);
        // Shrinking requests are ignored.
        mapper.grow(128).unwrap();
        assert_eq!(mapper.len(), 1 << 16);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let mapper = FileMapper::open(&path, 4096).unwrap();
            mapper.put_u64(16, 7777).unwrap();
            mapper.flush().unwrap();
        }
        let mapper = FileMapper::open(&path, 4096).unwrap();
        assert_eq!(mapper.get_u64(16).unwrap(), 7777);
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = FileMapper::open(&dir.path().join("data"), 1 << 16).unwrap();
        std::thread::scope(|scope| {
            for t in 0..8u64 {
                let mapper = &mapper;
                scope.spawn(move || {
                    for i in 0..100 {
                        mapper.put_u64((t * 100 + i) * 8, t * 1000 + i).unwrap();
                    }
                });
            }
        });
        for t in 0..8u64 {
            for i in 0..100 {
                assert_eq!(mapper.get_u64((t * 100 + i) * 8).unwrap(), t * 1000 + i);
            }
        }
    }
}
