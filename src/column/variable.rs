//! Variable-length columns for STRING and BINARY values.
//!
//! Two [`MemoryFile`]s back a column: `data` holds `[len: i32 BE][bytes…]`
//! records, `offsets` holds one big-endian u64 data offset per row. A length
//! of −1 encodes null, distinct from an empty value. STRING payloads are
//! UTF-16 code units, two big-endian bytes each.
//!
//! Values returned by the flyweight accessors borrow the mapped buffer and
//! are valid only until the next write or remap on this column; the borrow
//! is tied to `&mut self`, so the compiler enforces the aliasing rule. A
//! value that straddles a mapping window boundary is materialized instead.

use std::borrow::Cow;
use std::char::REPLACEMENT_CHARACTER;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::mapped::MemoryFile;

const NULL_LEN: i32 = -1;

pub struct VariableColumn {
    data: MemoryFile,
    offsets: MemoryFile,
}

impl VariableColumn {
    pub fn new(data: MemoryFile, offsets: MemoryFile) -> Self {
        Self { data, offsets }
    }

    pub fn size(&self) -> u64 {
        self.offsets.size() / 8
    }

    /// Clamps the visible row count without touching mappings.
    pub fn set_row_count(&mut self, rows: u64) {
        self.offsets.set_size(rows * 8);
    }

    /// Re-reads both backing files' lengths; see
    /// [`MemoryFile::refresh_physical`].
    pub fn refresh(&mut self) -> Result<()> {
        self.data.refresh_physical()?;
        self.offsets.refresh_physical()
    }

    /// Appends a string value; `None` stores null. Returns the row index.
    pub fn put_str(&mut self, value: Option<&str>) -> Result<u64> {
        match value {
            None => self.put_null(),
            Some(s) => {
                let units: Vec<u8> = s
                    .encode_utf16()
                    .flat_map(|u| u.to_be_bytes())
                    .collect();
                self.append_record(&units)
            }
        }
    }

    /// Appends a binary value; `None` stores null. Returns the row index.
    pub fn put_bin(&mut self, value: Option<&[u8]>) -> Result<u64> {
        match value {
            None => self.put_null(),
            Some(bytes) => self.append_record(bytes),
        }
    }

    /// Appends a null value. Returns the row index.
    pub fn put_null(&mut self) -> Result<u64> {
        let data_offset = self.data.size();
        let mut len_buf = [0u8; 4];
        BigEndian::write_i32(&mut len_buf, NULL_LEN);
        self.data.append_bytes(&len_buf)?;
        self.push_offset(data_offset)
    }

    /// Payload byte length of a row; −1 for null.
    pub fn bin_size(&mut self, row: u64) -> Result<i32> {
        let offset = self.offset_of(row)?;
        self.len_at(offset)
    }

    /// The binary payload of a row, borrowed from the mapped buffer where
    /// possible.
    pub fn bin_at(&mut self, row: u64) -> Result<Option<Cow<'_, [u8]>>> {
        self.payload(row)
    }

    /// The string value of a row, materialized.
    pub fn str_at(&mut self, row: u64) -> Result<Option<String>> {
        Ok(self.flyweight_str_at(row)?.map(|s| s.to_string()))
    }

    /// A flyweight view of the string value of a row. The view borrows the
    /// mapped buffer; it is invalidated by the next write to this column.
    pub fn flyweight_str_at(&mut self, row: u64) -> Result<Option<FlyweightStr<'_>>> {
        Ok(self.payload(row)?.map(|units| FlyweightStr { units }))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.data.commit()?;
        self.offsets.commit()
    }

    pub fn force(&mut self) -> Result<()> {
        self.data.force()?;
        self.offsets.force()
    }

    /// Shrinks the column to `rows` rows, truncating both files.
    pub fn truncate(&mut self, rows: u64) -> Result<()> {
        let data_end = if rows == 0 {
            0
        } else {
            let offset = self.offset_of(rows - 1)?;
            let len = self.len_at(offset)?;
            offset + 4 + len.max(0) as u64
        };
        self.data.truncate(data_end)?;
        self.offsets.truncate(rows * 8)
    }

    pub fn compact(&mut self) -> Result<()> {
        self.data.compact()?;
        self.offsets.compact()
    }

    fn payload(&mut self, row: u64) -> Result<Option<Cow<'_, [u8]>>> {
        let offset = self.offset_of(row)?;
        let len = self.len_at(offset)?;
        if len < 0 {
            return Ok(None);
        }
        if len == 0 {
            return Ok(Some(Cow::Borrowed(&[])));
        }
        let len = len as u64;
        let start = offset + 4;

        if self.data.contiguous(start, len) {
            let window = self.data.window(start, len as usize)?;
            Ok(Some(Cow::Borrowed(&window[..len as usize])))
        } else {
            let mut buf = vec![0u8; len as usize];
            self.data.read_bytes(start, &mut buf)?;
            Ok(Some(Cow::Owned(buf)))
        }
    }

    fn append_record(&mut self, payload: &[u8]) -> Result<u64> {
        let data_offset = self.data.size();
        let mut len_buf = [0u8; 4];
        BigEndian::write_i32(&mut len_buf, payload.len() as i32);
        self.data.append_bytes(&len_buf)?;
        self.data.append_bytes(payload)?;
        self.push_offset(data_offset)
    }

    fn push_offset(&mut self, data_offset: u64) -> Result<u64> {
        let row = self.size();
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, data_offset);
        self.offsets.append_bytes(&buf)?;
        Ok(row)
    }

    fn offset_of(&mut self, row: u64) -> Result<u64> {
        // Offset entries are window-aligned, never straddling.
        Ok(BigEndian::read_u64(self.offsets.window(row * 8, 8)?))
    }

    fn len_at(&mut self, data_offset: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.data.read_bytes(data_offset, &mut buf)?;
        Ok(BigEndian::read_i32(&buf))
    }
}

/// A borrowed view over a stored string's UTF-16 code units.
pub struct FlyweightStr<'a> {
    units: Cow<'a, [u8]>,
}

impl FlyweightStr<'_> {
    /// Number of UTF-16 code units.
    pub fn unit_len(&self) -> usize {
        self.units.len() / 2
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        std::char::decode_utf16(self.code_units()).map(|r| r.unwrap_or(REPLACEMENT_CHARACTER))
    }

    /// Content comparison against a native string without materializing.
    pub fn eq_str(&self, other: &str) -> bool {
        let mut mine = self.code_units();
        let mut theirs = other.encode_utf16();
        loop {
            match (mine.next(), theirs.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a == b => continue,
                _ => return false,
            }
        }
    }

    fn code_units(&self) -> impl Iterator<Item = u16> + '_ {
        self.units
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }
}

impl fmt::Display for FlyweightStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.chars() {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped::AccessMode;
    use tempfile::TempDir;

    fn column(dir: &TempDir) -> VariableColumn {
        let data = MemoryFile::open(dir.path().join("col.d"), 17, AccessMode::ReadWrite).unwrap();
        let offsets = MemoryFile::open(dir.path().join("col.i"), 17, AccessMode::ReadWrite).unwrap();
        VariableColumn::new(data, offsets)
    }

    #[test]
    fn test_str_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir);

        for s in ["", "AAA", "héllo", "日本語", "emoji 🦀 plane two"] {
            let row = col.put_str(Some(s))?;
            assert_eq!(col.str_at(row)?.as_deref(), Some(s));
            let fly = col.flyweight_str_at(row)?.unwrap();
            assert!(fly.eq_str(s));
        }
        assert_eq!(col.size(), 5);
        Ok(())
    }

    #[test]
    fn test_null_distinct_from_empty() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir);

        let empty = col.put_str(Some(""))?;
        let null = col.put_str(None)?;

        assert_eq!(col.bin_size(empty)?, 0);
        assert_eq!(col.bin_size(null)?, -1);
        assert_eq!(col.str_at(empty)?.as_deref(), Some(""));
        assert_eq!(col.str_at(null)?, None);
        Ok(())
    }

    #[test]
    fn test_bin_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir);

        let payload: Vec<u8> = (0..=255u8).collect();
        let row = col.put_bin(Some(&payload))?;
        assert_eq!(col.bin_size(row)?, 256);
        assert_eq!(col.bin_at(row)?.unwrap().as_ref(), payload.as_slice());

        let null = col.put_bin(None)?;
        assert_eq!(col.bin_size(null)?, -1);
        assert!(col.bin_at(null)?.is_none());
        Ok(())
    }

    #[test]
    fn test_value_straddling_window_boundary() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir);

        // Fill the data file to just short of the window boundary, then
        // write a record that crosses it.
        let wsize = 1u64 << 17;
        let filler = vec![b'x'; (wsize - 20) as usize];
        col.put_bin(Some(&filler))?;

        let crossing: Vec<u8> = (0..200).map(|i| (i % 251) as u8).collect();
        let row = col.put_bin(Some(&crossing))?;
        assert_eq!(col.bin_at(row)?.unwrap().as_ref(), crossing.as_slice());
        Ok(())
    }

    #[test]
    fn test_truncate() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir);

        col.put_str(Some("one"))?;
        col.put_str(Some("two"))?;
        col.put_str(None)?;
        col.put_str(Some("four"))?;

        col.truncate(3)?;
        assert_eq!(col.size(), 3);
        assert_eq!(col.str_at(1)?.as_deref(), Some("two"));
        assert_eq!(col.str_at(2)?, None);

        // Appends continue cleanly from the truncation point.
        let row = col.put_str(Some("five"))?;
        assert_eq!(row, 3);
        assert_eq!(col.str_at(3)?.as_deref(), Some("five"));
        Ok(())
    }

    #[test]
    fn test_truncate_to_zero() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir);

        col.put_str(Some("gone"))?;
        col.truncate(0)?;
        assert_eq!(col.size(), 0);
        assert_eq!(col.put_str(Some("back"))?, 0);
        assert_eq!(col.str_at(0)?.as_deref(), Some("back"));
        Ok(())
    }
}
