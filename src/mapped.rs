//! Memory-mapped column files.
//!
//! A [`MemoryFile`] presents a file as an addressable byte region through a
//! sequence of fixed-size mapped windows of `2^bit_hint` bytes. Windows are
//! mapped on demand and cached; the file is grown in window multiples so a
//! writable window can always cover its full span.
//!
//! The logical size (append offset) is tracked in memory and set by the
//! owning column from transaction state; the physical file length is an
//! upper bound rounded up to the window size. Writers map windows writable,
//! readers map them read-only and never mutate pages.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// Number of mapped windows kept per file before the least recently used
/// one is dropped.
pub const WINDOW_CACHE_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

enum Window {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Window {
    fn as_slice(&self) -> &[u8] {
        match self {
            Window::Ro(m) => m,
            Window::Rw(m) => m,
        }
    }

    fn flush_async(&self) -> std::io::Result<()> {
        match self {
            Window::Ro(_) => Ok(()),
            Window::Rw(m) => m.flush_async(),
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Window::Ro(_) => Ok(()),
            Window::Rw(m) => m.flush(),
        }
    }
}

pub struct MemoryFile {
    file: File,
    path: PathBuf,
    mode: AccessMode,
    bit_hint: u32,
    /// Logical size in bytes; the append offset.
    size: u64,
    /// Cached physical file length.
    physical: u64,
    windows: HashMap<u64, Window>,
    /// Window indexes, most recently used last.
    lru: Vec<u64>,
    dirty: bool,
}

impl MemoryFile {
    pub fn open(path: impl AsRef<Path>, bit_hint: u32, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == AccessMode::ReadWrite {
            options.write(true).create(true);
        }
        let file = options
            .open(&path)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        let physical = file.metadata()?.len();

        Ok(Self {
            file,
            path,
            mode,
            bit_hint,
            size: physical,
            physical,
            windows: HashMap::new(),
            lru: Vec::new(),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window_size(&self) -> u64 {
        1 << self.bit_hint
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sets the logical size. Does not touch mappings or the physical file.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Advances the logical size by `n` bytes.
    pub fn advance(&mut self, n: u64) {
        self.size += n;
    }

    /// Re-stats the file. On a read-only handle the logical size follows
    /// the physical length, letting readers observe writer-side growth and
    /// compaction without remapping.
    pub fn refresh_physical(&mut self) -> Result<()> {
        self.physical = self.file.metadata()?.len();
        if self.mode == AccessMode::ReadOnly {
            self.size = self.physical;
        }
        Ok(())
    }

    /// True when `len` bytes starting at `offset` lie within one window.
    pub fn contiguous(&self, offset: u64, len: u64) -> bool {
        len == 0 || (offset >> self.bit_hint) == ((offset + len - 1) >> self.bit_hint)
    }

    /// The bytes from `offset` to the end of its mapping window,
    /// guaranteeing at least `min_bytes` contiguous bytes. Fails when
    /// `min_bytes` exceeds the window size.
    ///
    /// A read-only window mapped while the file was shorter is remapped
    /// once when the guarantee cannot be met, so readers observe appends
    /// made by a writer after the window was first mapped.
    pub fn window(&mut self, offset: u64, min_bytes: usize) -> Result<&[u8]> {
        let min_bytes = min_bytes.max(1);
        if min_bytes as u64 > self.window_size() {
            return Err(self.mapping_error(offset, min_bytes as u64));
        }
        let widx = offset >> self.bit_hint;
        let off_in = (offset & (self.window_size() - 1)) as usize;

        // A reader's cached file length may predate writer-side growth;
        // re-stat and retry once before giving up.
        if let Err(e) = self.ensure_window(widx) {
            if !matches!(e, Error::Mapping { .. }) {
                return Err(e);
            }
            self.refresh_physical()?;
            self.ensure_window(widx)?;
        }
        if off_in + min_bytes > self.windows[&widx].as_slice().len() {
            self.refresh_physical()?;
            self.windows.remove(&widx);
            self.lru.retain(|&i| i != widx);
            self.ensure_window(widx)?;
            if off_in + min_bytes > self.windows[&widx].as_slice().len() {
                return Err(self.mapping_error(offset, min_bytes as u64));
            }
        }
        Ok(&self.windows[&widx].as_slice()[off_in..])
    }

    /// The writable bytes from `offset` to the end of its mapping window,
    /// growing the file as needed.
    pub fn window_mut(&mut self, offset: u64) -> Result<&mut [u8]> {
        if self.mode != AccessMode::ReadWrite {
            return Err(Error::Io(format!(
                "write to read-only mapping {}",
                self.path.display()
            )));
        }
        let widx = offset >> self.bit_hint;
        self.ensure_window(widx)?;
        self.dirty = true;
        let off_in = (offset & (self.window_size() - 1)) as usize;
        let err = self.mapping_error(offset, 1);
        match self.windows.get_mut(&widx) {
            Some(Window::Rw(m)) => Ok(&mut m[off_in..]),
            _ => Err(err),
        }
    }

    /// Reads `buf.len()` bytes starting at `offset`, crossing window
    /// boundaries as needed.
    pub fn read_bytes(&mut self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let window = self.window(offset, 1)?;
            let n = window.len().min(buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&window[..n]);
            pos += n;
            offset += n as u64;
        }
        Ok(())
    }

    /// Writes `buf` starting at `offset`, crossing window boundaries as
    /// needed. Does not advance the logical size.
    pub fn write_bytes(&mut self, mut offset: u64, buf: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let window = self.window_mut(offset)?;
            let n = window.len().min(buf.len() - pos);
            window[..n].copy_from_slice(&buf[pos..pos + n]);
            pos += n;
            offset += n as u64;
        }
        Ok(())
    }

    /// Appends `buf` at the logical size and returns the offset it was
    /// written at.
    pub fn append_bytes(&mut self, buf: &[u8]) -> Result<u64> {
        let offset = self.size;
        self.write_bytes(offset, buf)?;
        self.size += buf.len() as u64;
        Ok(offset)
    }

    /// Flushes dirty windows without forcing an fsync.
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty {
            for window in self.windows.values() {
                window.flush_async()?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Flushes dirty windows and fsyncs the file.
    pub fn force(&mut self) -> Result<()> {
        for window in self.windows.values() {
            window.flush()?;
        }
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    /// Shrinks the file to `new_size` bytes, unmapping windows past the new
    /// size.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.drop_windows_beyond(new_size);
        self.file.set_len(new_size)?;
        self.physical = new_size;
        self.size = new_size;
        Ok(())
    }

    /// Drops the unused mapping tail: shrinks the physical file to the
    /// logical size.
    pub fn compact(&mut self) -> Result<()> {
        if self.physical > self.size {
            self.drop_windows_beyond(self.size);
            self.file.set_len(self.size)?;
            self.physical = self.size;
        }
        Ok(())
    }

    fn drop_windows_beyond(&mut self, limit: u64) {
        let wsize = self.window_size();
        self.windows.retain(|&idx, _| (idx + 1) * wsize <= limit);
        let windows = &self.windows;
        self.lru.retain(|idx| windows.contains_key(idx));
    }

    fn ensure_window(&mut self, widx: u64) -> Result<()> {
        if self.windows.contains_key(&widx) {
            self.touch(widx);
            return Ok(());
        }

        if self.windows.len() >= WINDOW_CACHE_SIZE {
            let evicted = self.lru.remove(0);
            self.windows.remove(&evicted);
        }

        let wsize = self.window_size();
        let start = widx * wsize;
        let window = match self.mode {
            AccessMode::ReadWrite => {
                let end = start + wsize;
                if self.physical < end {
                    // Grow in window multiples so the mapping is fully backed.
                    self.file.set_len(end)?;
                    self.physical = end;
                }
                let map = unsafe { MmapOptions::new().offset(start).len(wsize as usize).map_mut(&self.file) }
                    .map_err(|_| self.mapping_error(start, wsize))?;
                Window::Rw(map)
            }
            AccessMode::ReadOnly => {
                if self.physical <= start {
                    return Err(self.mapping_error(start, wsize));
                }
                let len = wsize.min(self.physical - start);
                let map = unsafe { MmapOptions::new().offset(start).len(len as usize).map(&self.file) }
                    .map_err(|_| self.mapping_error(start, len))?;
                Window::Ro(map)
            }
        };

        self.windows.insert(widx, window);
        self.lru.push(widx);
        Ok(())
    }

    fn touch(&mut self, widx: u64) {
        if self.lru.last() != Some(&widx) {
            self.lru.retain(|&i| i != widx);
            self.lru.push(widx);
        }
    }

    fn mapping_error(&self, offset: u64, len: u64) -> Error {
        Error::Mapping {
            path: self.path.display().to_string(),
            offset,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BIT_HINT: u32 = 17;

    fn open_rw(dir: &TempDir, name: &str) -> MemoryFile {
        MemoryFile::open(dir.path().join(name), BIT_HINT, AccessMode::ReadWrite).unwrap()
    }

    #[test]
    fn test_append_and_read() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");

        let offset = mem.append_bytes(b"hello")?;
        assert_eq!(offset, 0);
        assert_eq!(mem.size(), 5);

        let mut buf = [0u8; 5];
        mem.read_bytes(0, &mut buf)?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[test]
    fn test_window_boundary_crossing() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");

        // Straddle the first window boundary.
        let wsize = mem.window_size();
        let payload: Vec<u8> = (0..64u8).collect();
        mem.write_bytes(wsize - 10, &payload)?;

        let mut buf = vec![0u8; payload.len()];
        mem.read_bytes(wsize - 10, &mut buf)?;
        assert_eq!(buf, payload);
        Ok(())
    }

    #[test]
    fn test_growth_in_window_multiples() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");

        mem.append_bytes(&[1, 2, 3])?;
        let physical = std::fs::metadata(dir.path().join("col.d")).unwrap().len();
        assert_eq!(physical, mem.window_size());
        Ok(())
    }

    #[test]
    fn test_truncate_unmaps_and_shrinks() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");

        mem.append_bytes(&vec![7u8; 100])?;
        mem.truncate(40)?;
        assert_eq!(mem.size(), 40);
        assert_eq!(std::fs::metadata(dir.path().join("col.d")).unwrap().len(), 40);

        // The region is writable again after truncation.
        mem.append_bytes(&[9u8; 8])?;
        assert_eq!(mem.size(), 48);
        Ok(())
    }

    #[test]
    fn test_compact_drops_tail() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");

        mem.append_bytes(&[1u8; 24])?;
        mem.compact()?;
        assert_eq!(std::fs::metadata(dir.path().join("col.d")).unwrap().len(), 24);
        Ok(())
    }

    #[test]
    fn test_window_cache_eviction() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");

        // Touch more windows than the cache holds; data must survive.
        let wsize = mem.window_size();
        for i in 0..(WINDOW_CACHE_SIZE as u64 + 4) {
            mem.write_bytes(i * wsize, &[i as u8 + 1])?;
        }
        for i in 0..(WINDOW_CACHE_SIZE as u64 + 4) {
            let mut b = [0u8; 1];
            mem.read_bytes(i * wsize, &mut b)?;
            assert_eq!(b[0], i as u8 + 1);
        }
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        {
            let mut mem = open_rw(&dir, "col.d");
            mem.append_bytes(b"data").unwrap();
        }

        let mut mem =
            MemoryFile::open(dir.path().join("col.d"), BIT_HINT, AccessMode::ReadOnly).unwrap();
        let mut buf = [0u8; 4];
        mem.read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        assert!(mem.window_mut(0).is_err());
    }

    #[test]
    fn test_read_only_missing_region() {
        let dir = TempDir::new().unwrap();
        {
            let mut mem = open_rw(&dir, "col.d");
            mem.append_bytes(b"x").unwrap();
            mem.compact().unwrap();
        }

        let mut mem =
            MemoryFile::open(dir.path().join("col.d"), BIT_HINT, AccessMode::ReadOnly).unwrap();
        let err = mem.window(1 << 20, 1).unwrap_err();
        assert!(matches!(err, Error::Mapping { .. }));
    }

    #[test]
    fn test_reader_observes_growth_after_mapping() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut writer = open_rw(&dir, "col.d");
        writer.append_bytes(&[1u8; 8])?;
        writer.compact()?;

        let mut reader =
            MemoryFile::open(dir.path().join("col.d"), BIT_HINT, AccessMode::ReadOnly)?;
        let mut buf = [0u8; 8];
        reader.read_bytes(0, &mut buf)?;

        // The writer extends the file past the reader's short mapping; the
        // reader's next access must remap and observe the new bytes.
        writer.write_bytes(8, &[2u8; 8])?;
        writer.advance(8);

        reader.read_bytes(8, &mut buf)?;
        assert_eq!(buf, [2u8; 8]);
        Ok(())
    }

    #[test]
    fn test_commit_and_force() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut mem = open_rw(&dir, "col.d");
        mem.append_bytes(b"durable")?;
        mem.commit()?;
        mem.force()?;
        Ok(())
    }
}
