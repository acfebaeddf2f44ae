//! Append-only inverted index from int key to ordered row ids.
//!
//! Engineered for bounded key spaces: symbol columns, indexed int columns
//! and the symbol table's hash buckets.
//!
//! # File Format
//!
//! Two files back an index:
//!
//! ```text
//! key file ("k")                      row file ("r")
//! +--------------------+              +--------------------+
//! | Header (16 bytes)  |              | Header (16 bytes)  |
//! +--------------------+              +--------------------+
//! | slot -1 (null key) |              | chunk 0            |
//! +--------------------+              +--------------------+
//! | slot 0             |              | chunk 1            |
//! +--------------------+              +--------------------+
//! | ...                |              | ...                |
//! +--------------------+              +--------------------+
//! ```
//!
//! Each key slot holds `{row_count: u64, last_chunk_offset: u64}`. Each row
//! chunk holds `row_chunk_size` row ids followed by the offset of the
//! previous chunk in the key's chain (0 terminates the chain). All integers
//! are big-endian. Slots are addressed by `key + 1` so the null sentinel
//! (−1) is indexable.
//!
//! # Visibility
//!
//! Row ids are appended in ascending order per key, so a transaction
//! snapshot is a single row-id cap: an entry is visible iff its row id is
//! below the cap published by the last observed commit. `set_tx_address`
//! installs the cap on readers without touching the files; `truncate`
//! applies the same cut physically on the writer.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::{Error, Result};
use crate::mapped::{AccessMode, MemoryFile};
use crate::meta::bit_hint_for;

const KEY_MAGIC: &[u8; 4] = b"TSKV";
const ROW_MAGIC: &[u8; 4] = b"TSKR";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;
const SLOT_SIZE: u64 = 16;
const MIN_ROW_CHUNK: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexHeader {
    row_chunk_size: u64,
    key_space: usize,
}

impl IndexHeader {
    fn encode(&self, magic: &[u8; 4]) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(magic);
        BigEndian::write_u32(&mut buf[4..8], FORMAT_VERSION);
        BigEndian::write_u32(&mut buf[8..12], self.row_chunk_size as u32);
        BigEndian::write_u32(&mut buf[12..16], self.key_space as u32);
        buf
    }

    fn decode(buf: &[u8], magic: &[u8; 4], path: &Path) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let mut found = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut found)?;
        if &found != magic {
            return Err(Error::Config(format!(
                "{}: not an index file",
                path.display()
            )));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::Config(format!(
                "{}: unsupported index format version {version}",
                path.display()
            )));
        }
        let row_chunk_size = cursor.read_u32::<BigEndian>()? as u64;
        let key_space = cursor.read_u32::<BigEndian>()? as usize;
        Ok(Self {
            row_chunk_size,
            key_space,
        })
    }
}

pub struct KVIndex {
    kfile: MemoryFile,
    rfile: MemoryFile,
    row_chunk_size: u64,
    key_space: usize,
    /// Highest row id added plus one.
    max_row: u64,
    /// Row-id cap captured by the last `commit`.
    committed: u64,
    /// Reader-side visibility cap; `None` evaluates the raw slots.
    visible_cap: Option<u64>,
    /// Chunk-walk cache for sequential `value_at` scans.
    cached: Option<(i32, u64, u64)>,
}

impl KVIndex {
    /// Number of row ids per chunk for the given sizing hints.
    pub fn row_chunk_size(key_space: usize, record_hint: usize) -> u64 {
        ((record_hint / key_space.max(1)) as u64)
            .next_power_of_two()
            .max(MIN_ROW_CHUNK)
    }

    pub fn open(
        kpath: PathBuf,
        rpath: PathBuf,
        key_space: usize,
        record_hint: usize,
        mode: AccessMode,
    ) -> Result<Self> {
        if key_space == 0 || !key_space.is_power_of_two() {
            return Err(Error::Config(format!(
                "index key space {key_space} must be a nonzero power of two"
            )));
        }
        let row_chunk_size = Self::row_chunk_size(key_space, record_hint);
        let header = IndexHeader {
            row_chunk_size,
            key_space,
        };

        let slots_end = HEADER_SIZE + (key_space as u64 + 1) * SLOT_SIZE;
        let mut kfile = MemoryFile::open(&kpath, bit_hint_for(slots_end), mode)?;
        let mut rfile = MemoryFile::open(
            &rpath,
            bit_hint_for(8 * record_hint as u64),
            mode,
        )?;

        if kfile.size() == 0 {
            if mode == AccessMode::ReadWrite {
                kfile.write_bytes(0, &header.encode(KEY_MAGIC))?;
                rfile.write_bytes(0, &ROW_MAGIC_HEADER.encode(ROW_MAGIC))?;
                rfile.set_size(HEADER_SIZE);
            }
        } else {
            let mut buf = [0u8; HEADER_SIZE as usize];
            kfile.read_bytes(0, &mut buf)?;
            let found = IndexHeader::decode(&buf, KEY_MAGIC, &kpath)?;
            if found != header {
                return Err(Error::Config(format!(
                    "{}: index geometry mismatch (found chunk {} keys {}, expected chunk {} keys {})",
                    kpath.display(),
                    found.row_chunk_size,
                    found.key_space,
                    row_chunk_size,
                    key_space
                )));
            }
        }
        if mode == AccessMode::ReadWrite {
            kfile.set_size(slots_end);
        }

        let mut index = Self {
            kfile,
            rfile,
            row_chunk_size,
            key_space,
            max_row: 0,
            committed: 0,
            visible_cap: None,
            cached: None,
        };

        if mode == AccessMode::ReadWrite {
            index.restore_append_state()?;
        }
        Ok(index)
    }

    /// Removes an index's files, for rebuilds.
    pub fn delete(kpath: &Path, rpath: &Path) -> Result<()> {
        for path in [kpath, rpath] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn key_space(&self) -> usize {
        self.key_space
    }

    /// Appends `row_id` to the key's chain.
    pub fn add(&mut self, key: i32, row_id: u64) -> Result<()> {
        self.check_key(key)?;
        let (mut count, mut last) = self.read_slot(key)?;

        let pos = count % self.row_chunk_size;
        if pos == 0 {
            // Current chunk is full (or absent): chain a new one.
            let chunk = self.rfile.size();
            let chunk_bytes = self.row_chunk_size * 8 + 8;
            self.write_u64_r(chunk + self.row_chunk_size * 8, last)?;
            self.rfile.set_size(chunk + chunk_bytes);
            last = chunk;
        }

        self.write_u64_r(last + pos * 8, row_id)?;
        count += 1;
        self.write_slot(key, count, last)?;
        self.max_row = self.max_row.max(row_id + 1);
        self.cached = None;
        Ok(())
    }

    /// Number of tx-visible row ids for the key.
    pub fn value_count(&mut self, key: i32) -> Result<u64> {
        self.check_key(key)?;
        let (count, last) = self.read_slot(key)?;
        match self.visible_cap {
            None => Ok(count),
            Some(cap) => Ok(self.clamped(count, last, cap)?.0),
        }
    }

    /// The i-th row id for the key, in append order.
    pub fn value_at(&mut self, key: i32, i: u64) -> Result<u64> {
        self.check_key(key)?;
        let (count, last) = self.read_slot(key)?;
        if i >= count {
            return Err(Error::Io(format!(
                "row index {i} out of bounds for key {key} ({count} rows)"
            )));
        }

        let rcs = self.row_chunk_size;
        let total_chunks = (count + rcs - 1) / rcs;
        let target = i / rcs;

        // Chains only walk tailward, so the cache helps when it sits at or
        // past the target chunk; ascending scans hit it on every call.
        let (mut chunk_idx, mut chunk) = match self.cached {
            Some((k, idx, off)) if k == key && idx >= target => (idx, off),
            _ => (total_chunks - 1, last),
        };
        while chunk_idx > target {
            chunk = self.read_u64_r(chunk + rcs * 8)?;
            chunk_idx -= 1;
        }
        self.cached = Some((key, chunk_idx, chunk));

        self.read_u64_r(chunk + (i % rcs) * 8)
    }

    /// All tx-visible row ids for the key, in append order.
    pub fn values(&mut self, key: i32) -> Result<Vec<u64>> {
        let count = self.value_count(key)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            out.push(self.value_at(key, i)?);
        }
        Ok(out)
    }

    /// Flushes both files and captures the commit snapshot.
    pub fn commit(&mut self) -> Result<()> {
        self.kfile.commit()?;
        self.rfile.commit()?;
        self.committed = self.max_row;
        Ok(())
    }

    /// Opaque snapshot of the state after the last `commit`.
    pub fn tx_address(&self) -> u64 {
        self.committed
    }

    /// Hides rows added after the supplied snapshot.
    pub fn set_tx_address(&mut self, address: u64) {
        self.visible_cap = Some(address);
    }

    /// Clears the visibility cap; raw slot counts become visible.
    pub fn clear_tx_address(&mut self) {
        self.visible_cap = None;
    }

    /// Drops every `(key, row_id)` pair with `row_id >= new_size`.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        let mut max_row = 0;
        for key in -1..self.key_space as i32 {
            let (count, last) = self.read_slot(key)?;
            let (kept, kept_last) = self.clamped(count, last, new_size)?;
            if kept != count {
                self.write_slot(key, kept, kept_last)?;
            }
            if kept > 0 {
                let tail = self.read_u64_r(kept_last + ((kept - 1) % self.row_chunk_size) * 8)?;
                max_row = max_row.max(tail + 1);
            }
        }
        self.max_row = max_row;
        self.cached = None;
        Ok(())
    }

    pub fn force(&mut self) -> Result<()> {
        self.kfile.force()?;
        self.rfile.force()
    }

    pub fn compact(&mut self) -> Result<()> {
        self.kfile.compact()?;
        self.rfile.compact()
    }

    /// Walks a key's chain from the tail, cutting entries with
    /// `row_id >= cap`. Returns the clamped count and tail chunk.
    fn clamped(&mut self, mut count: u64, mut last: u64, cap: u64) -> Result<(u64, u64)> {
        let rcs = self.row_chunk_size;
        while count > 0 {
            let pos = (count - 1) % rcs;
            let row_id = self.read_u64_r(last + pos * 8)?;
            if row_id < cap {
                break;
            }
            count -= 1;
            if pos == 0 {
                last = self.read_u64_r(last + rcs * 8)?;
            }
        }
        if count == 0 {
            last = 0;
        }
        Ok((count, last))
    }

    /// Recomputes append state from the slots after open: the row file's
    /// append offset and the highest row id.
    fn restore_append_state(&mut self) -> Result<()> {
        let chunk_bytes = self.row_chunk_size * 8 + 8;
        let mut rfile_end = HEADER_SIZE;
        let mut max_row = 0;
        for key in -1..self.key_space as i32 {
            let (count, last) = self.read_slot(key)?;
            if count == 0 {
                continue;
            }
            rfile_end = rfile_end.max(last + chunk_bytes);
            let tail = self.read_u64_r(last + ((count - 1) % self.row_chunk_size) * 8)?;
            max_row = max_row.max(tail + 1);
        }
        self.rfile.set_size(rfile_end);
        self.max_row = max_row;
        self.committed = max_row;
        Ok(())
    }

    fn check_key(&self, key: i32) -> Result<()> {
        if key < -1 || key as i64 >= self.key_space as i64 {
            return Err(Error::IndexKeyOutOfRange {
                key,
                key_space: self.key_space,
            });
        }
        Ok(())
    }

    fn slot_offset(&self, key: i32) -> u64 {
        HEADER_SIZE + (key + 1) as u64 * SLOT_SIZE
    }

    fn read_slot(&mut self, key: i32) -> Result<(u64, u64)> {
        let offset = self.slot_offset(key);
        if offset + SLOT_SIZE > self.kfile.size() {
            // Readers may hold a stale length; re-stat before concluding
            // the slot span is short (untouched slots read as empty).
            self.kfile.refresh_physical()?;
            if offset + SLOT_SIZE > self.kfile.size() {
                return Ok((0, 0));
            }
        }
        let window = self.kfile.window(offset, SLOT_SIZE as usize)?;
        Ok((
            BigEndian::read_u64(&window[0..8]),
            BigEndian::read_u64(&window[8..16]),
        ))
    }

    fn write_slot(&mut self, key: i32, count: u64, last: u64) -> Result<()> {
        let offset = self.slot_offset(key);
        let window = self.kfile.window_mut(offset)?;
        BigEndian::write_u64(&mut window[0..8], count);
        BigEndian::write_u64(&mut window[8..16], last);
        Ok(())
    }

    fn read_u64_r(&mut self, offset: u64) -> Result<u64> {
        Ok(BigEndian::read_u64(self.rfile.window(offset, 8)?))
    }

    fn write_u64_r(&mut self, offset: u64, value: u64) -> Result<()> {
        let window = self.rfile.window_mut(offset)?;
        BigEndian::write_u64(window, value);
        Ok(())
    }
}

const ROW_MAGIC_HEADER: IndexHeader = IndexHeader {
    row_chunk_size: 0,
    key_space: 0,
};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir, key_space: usize) -> KVIndex {
        KVIndex::open(
            dir.path().join("col.k"),
            dir.path().join("col.r"),
            key_space,
            1000,
            AccessMode::ReadWrite,
        )
        .unwrap()
    }

    #[test]
    fn test_add_and_lookup() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir, 16);

        index.add(3, 10)?;
        index.add(3, 11)?;
        index.add(7, 12)?;
        index.add(3, 13)?;

        assert_eq!(index.value_count(3)?, 3);
        assert_eq!(index.values(3)?, vec![10, 11, 13]);
        assert_eq!(index.values(7)?, vec![12]);
        assert_eq!(index.value_count(0)?, 0);
        Ok(())
    }

    #[test]
    fn test_null_key_slot() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir, 16);

        index.add(-1, 0)?;
        index.add(-1, 5)?;
        assert_eq!(index.values(-1)?, vec![0, 5]);
        Ok(())
    }

    #[test]
    fn test_key_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir, 16);

        assert!(matches!(
            index.add(16, 0),
            Err(Error::IndexKeyOutOfRange { key: 16, .. })
        ));
        assert!(matches!(
            index.add(-2, 0),
            Err(Error::IndexKeyOutOfRange { key: -2, .. })
        ));
    }

    #[test]
    fn test_chunk_chaining() -> Result<()> {
        let dir = TempDir::new().unwrap();
        // record_hint 1000 over 16 keys rounds to 64 rows per chunk; push
        // well past several chunks.
        let mut index = open_index(&dir, 16);

        let n = 300u64;
        for row in 0..n {
            index.add(1, row)?;
        }
        assert_eq!(index.value_count(1)?, n);
        for row in 0..n {
            assert_eq!(index.value_at(1, row)?, row);
        }
        // Reverse order defeats the chunk cache; results are identical.
        for row in (0..n).rev() {
            assert_eq!(index.value_at(1, row)?, row);
        }
        Ok(())
    }

    #[test]
    fn test_tx_address_hides_later_rows() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir, 16);

        index.add(2, 0)?;
        index.add(2, 1)?;
        index.commit()?;
        let address = index.tx_address();

        index.add(2, 2)?;
        index.add(5, 3)?;

        index.set_tx_address(address);
        assert_eq!(index.value_count(2)?, 2);
        assert_eq!(index.value_count(5)?, 0);

        index.clear_tx_address();
        assert_eq!(index.value_count(2)?, 3);
        assert_eq!(index.value_count(5)?, 1);
        Ok(())
    }

    #[test]
    fn test_truncate() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir, 8);

        for row in 0..100u64 {
            index.add((row % 4) as i32, row)?;
        }
        index.truncate(50)?;

        // Rows 0..50 round-robin over 4 keys.
        for (key, expected) in [(0, 13), (1, 13), (2, 12), (3, 12)] {
            let values = index.values(key)?;
            assert!(values.iter().all(|&r| r < 50));
            assert_eq!(values.len(), expected);
        }
        Ok(())
    }

    #[test]
    fn test_reopen_restores_append_state() -> Result<()> {
        let dir = TempDir::new().unwrap();
        {
            let mut index = open_index(&dir, 16);
            for row in 0..20u64 {
                index.add(4, row)?;
            }
            index.commit()?;
        }

        let mut index = open_index(&dir, 16);
        assert_eq!(index.value_count(4)?, 20);
        assert_eq!(index.tx_address(), 20);
        index.add(4, 20)?;
        assert_eq!(index.value_at(4, 20)?, 20);
        Ok(())
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let _ = open_index(&dir, 16);
        }
        let result = KVIndex::open(
            dir.path().join("col.k"),
            dir.path().join("col.r"),
            32,
            1000,
            AccessMode::ReadWrite,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
