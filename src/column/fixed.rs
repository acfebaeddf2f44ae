//! Fixed-width columns.
//!
//! A thin typed view over a [`MemoryFile`]; element `i` lives at byte offset
//! `i * width`. Elements are little-endian packed primitives. Widths are
//! powers of two, so an element never straddles a mapping window.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::mapped::MemoryFile;

/// Edge selector for timestamp binary search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BSearchEdge {
    /// Smallest index with `value >= needle`.
    NewerOrSame,
    /// Largest index with `value <= needle`.
    OlderOrSame,
    /// Smallest index with `value > needle`.
    Newer,
    /// Largest index with `value < needle`.
    Older,
}

pub struct FixedColumn {
    mem: MemoryFile,
    width: u64,
}

impl FixedColumn {
    pub fn new(mem: MemoryFile, width: u64) -> Self {
        Self { mem, width }
    }

    pub fn size(&self) -> u64 {
        self.mem.size() / self.width
    }

    /// Clamps the visible row count without touching mappings.
    pub fn set_row_count(&mut self, rows: u64) {
        self.mem.set_size(rows * self.width);
    }

    /// Re-reads the backing file's length; see
    /// [`MemoryFile::refresh_physical`].
    pub fn refresh(&mut self) -> Result<()> {
        self.mem.refresh_physical()
    }

    pub fn put_bool(&mut self, v: bool) -> Result<u64> {
        self.append(&[v as u8])
    }

    pub fn put_byte(&mut self, v: i8) -> Result<u64> {
        self.append(&[v as u8])
    }

    pub fn put_short(&mut self, v: i16) -> Result<u64> {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, v);
        self.append(&buf)
    }

    pub fn put_int(&mut self, v: i32) -> Result<u64> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, v);
        self.append(&buf)
    }

    pub fn put_long(&mut self, v: i64) -> Result<u64> {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, v);
        self.append(&buf)
    }

    pub fn put_float(&mut self, v: f32) -> Result<u64> {
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, v);
        self.append(&buf)
    }

    pub fn put_double(&mut self, v: f64) -> Result<u64> {
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, v);
        self.append(&buf)
    }

    pub fn get_bool(&mut self, idx: u64) -> Result<bool> {
        Ok(self.element(idx)?[0] != 0)
    }

    pub fn get_byte(&mut self, idx: u64) -> Result<i8> {
        Ok(self.element(idx)?[0] as i8)
    }

    pub fn get_short(&mut self, idx: u64) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.element(idx)?))
    }

    pub fn get_int(&mut self, idx: u64) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.element(idx)?))
    }

    pub fn get_long(&mut self, idx: u64) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.element(idx)?))
    }

    pub fn get_float(&mut self, idx: u64) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.element(idx)?))
    }

    pub fn get_double(&mut self, idx: u64) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.element(idx)?))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.mem.commit()
    }

    pub fn force(&mut self) -> Result<()> {
        self.mem.force()
    }

    pub fn truncate(&mut self, rows: u64) -> Result<()> {
        self.mem.truncate(rows * self.width)
    }

    pub fn compact(&mut self) -> Result<()> {
        self.mem.compact()
    }

    /// Binary search over the full column. See [`bsearch_edge_in`].
    ///
    /// [`bsearch_edge_in`]: FixedColumn::bsearch_edge_in
    pub fn bsearch_edge(&mut self, needle: i64, edge: BSearchEdge) -> Result<i64> {
        let size = self.size();
        self.bsearch_edge_in(needle, edge, 0, size)
    }

    /// Binary search for `needle` over the sorted i64 elements in
    /// `[lo, hi)`, returning the row selected by `edge` or −1 when no row
    /// matches. Correct across duplicate values.
    pub fn bsearch_edge_in(
        &mut self,
        needle: i64,
        edge: BSearchEdge,
        lo: u64,
        hi: u64,
    ) -> Result<i64> {
        let result = match edge {
            BSearchEdge::NewerOrSame => {
                let i = self.lower_bound(needle, lo, hi)?;
                (i < hi).then_some(i)
            }
            BSearchEdge::Newer => {
                let i = self.upper_bound(needle, lo, hi)?;
                (i < hi).then_some(i)
            }
            BSearchEdge::OlderOrSame => {
                let i = self.upper_bound(needle, lo, hi)?;
                (i > lo).then(|| i - 1)
            }
            BSearchEdge::Older => {
                let i = self.lower_bound(needle, lo, hi)?;
                (i > lo).then(|| i - 1)
            }
        };
        Ok(result.map(|i| i as i64).unwrap_or(-1))
    }

    /// First index in `[lo, hi)` whose element is `>= needle`, or `hi`.
    fn lower_bound(&mut self, needle: i64, mut lo: u64, mut hi: u64) -> Result<u64> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get_long(mid)? < needle {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First index in `[lo, hi)` whose element is `> needle`, or `hi`.
    fn upper_bound(&mut self, needle: i64, mut lo: u64, mut hi: u64) -> Result<u64> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get_long(mid)? <= needle {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn append(&mut self, buf: &[u8]) -> Result<u64> {
        let offset = self.mem.size();
        self.mem.write_bytes(offset, buf)?;
        self.mem.advance(self.width);
        Ok(offset / self.width)
    }

    fn element(&mut self, idx: u64) -> Result<&[u8]> {
        self.mem.window(idx * self.width, self.width as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped::AccessMode;
    use tempfile::TempDir;

    fn column(dir: &TempDir, width: u64) -> FixedColumn {
        let mem = MemoryFile::open(dir.path().join("col.d"), 17, AccessMode::ReadWrite).unwrap();
        FixedColumn::new(mem, width)
    }

    #[test]
    fn test_long_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 8);

        for v in [0i64, 1, -1, i64::MIN, i64::MAX, 1420070400000] {
            let row = col.put_long(v)?;
            assert_eq!(col.get_long(row)?, v);
        }
        assert_eq!(col.size(), 6);
        Ok(())
    }

    #[test]
    fn test_int_min_value_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 4);

        let row = col.put_int(i32::MIN)?;
        assert_eq!(col.get_int(row)?, i32::MIN);
        Ok(())
    }

    #[test]
    fn test_primitive_roundtrips() -> Result<()> {
        let dir = TempDir::new().unwrap();

        let mut col = column(&dir, 1);
        col.put_bool(true)?;
        col.put_bool(false)?;
        assert!(col.get_bool(0)?);
        assert!(!col.get_bool(1)?);

        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 1);
        col.put_byte(-100)?;
        assert_eq!(col.get_byte(0)?, -100);

        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 2);
        col.put_short(i16::MIN)?;
        assert_eq!(col.get_short(0)?, i16::MIN);

        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 8);
        col.put_double(f64::MAX)?;
        col.put_double(f64::NAN)?;
        assert_eq!(col.get_double(0)?, f64::MAX);
        assert!(col.get_double(1)?.is_nan());

        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 4);
        col.put_float(std::f32::consts::PI)?;
        assert_eq!(col.get_float(0)?, std::f32::consts::PI);
        Ok(())
    }

    #[test]
    fn test_truncate() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 8);

        for v in 0..10 {
            col.put_long(v)?;
        }
        col.truncate(4)?;
        assert_eq!(col.size(), 4);
        assert_eq!(col.get_long(3)?, 3);
        assert_eq!(col.put_long(99)?, 4);
        Ok(())
    }

    #[test]
    fn test_bsearch_edges_with_duplicates() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 8);

        for v in [10i64, 20, 20, 20, 30, 40] {
            col.put_long(v)?;
        }

        assert_eq!(col.bsearch_edge(20, BSearchEdge::NewerOrSame)?, 1);
        assert_eq!(col.bsearch_edge(20, BSearchEdge::OlderOrSame)?, 3);
        assert_eq!(col.bsearch_edge(20, BSearchEdge::Newer)?, 4);
        assert_eq!(col.bsearch_edge(20, BSearchEdge::Older)?, 0);

        // Needle between values.
        assert_eq!(col.bsearch_edge(25, BSearchEdge::NewerOrSame)?, 4);
        assert_eq!(col.bsearch_edge(25, BSearchEdge::OlderOrSame)?, 3);

        // No matching row.
        assert_eq!(col.bsearch_edge(50, BSearchEdge::NewerOrSame)?, -1);
        assert_eq!(col.bsearch_edge(50, BSearchEdge::Newer)?, -1);
        assert_eq!(col.bsearch_edge(5, BSearchEdge::OlderOrSame)?, -1);
        assert_eq!(col.bsearch_edge(10, BSearchEdge::Older)?, -1);
        Ok(())
    }

    #[test]
    fn test_bsearch_bounded_range() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut col = column(&dir, 8);

        for v in [10i64, 20, 30, 40, 50] {
            col.put_long(v)?;
        }

        assert_eq!(col.bsearch_edge_in(30, BSearchEdge::NewerOrSame, 1, 4)?, 2);
        assert_eq!(col.bsearch_edge_in(10, BSearchEdge::NewerOrSame, 1, 4)?, 1);
        assert_eq!(col.bsearch_edge_in(50, BSearchEdge::NewerOrSame, 1, 4)?, -1);
        Ok(())
    }
}
