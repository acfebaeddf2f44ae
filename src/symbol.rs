//! Symbol tables: journal-scoped string↔int dictionaries.
//!
//! A symbol column stores a dense integer key per row; the key resolves
//! through a symbol table shared by every partition of the journal. The
//! table is backed by a [`VariableColumn`] holding the distinct strings in
//! key order and a [`KVIndex`] keyed by a bounded hash of the string.
//!
//! Lookup probes the hash bucket newest to oldest comparing content; a miss
//! appends the string and records `(hash, key)` in the index. Keys are
//! handed out densely from zero and never change.

use std::collections::HashMap;
use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::column::VariableColumn;
use crate::error::{Error, Result};
use crate::index::KVIndex;
use crate::mapped::{AccessMode, MemoryFile};
use crate::meta::bit_hint_for;

/// Key stored for a null symbol value.
pub const VALUE_IS_NULL: i32 = -1;
/// Transient key for a string absent from the table.
pub const VALUE_NOT_FOUND: i32 = -2;

const HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Hash of `s` bounded to `[0, mask]`. CRC-32/ISO-HDLC over the UTF-16BE
/// code units; `mask` must be one less than a power of two. Bit-exact and
/// stable across versions.
pub fn bounded_hash(s: &str, mask: usize) -> i32 {
    let mut digest = HASH.digest();
    for unit in s.encode_utf16() {
        digest.update(&unit.to_be_bytes());
    }
    (digest.finalize() as usize & mask) as i32
}

pub struct SymbolTable {
    column: VariableColumn,
    index: KVIndex,
    mask: usize,
    /// Reader-side clamp from the last observed tx; `None` on the writer.
    visible: Option<u64>,
    cache: HashMap<String, i32>,
}

impl SymbolTable {
    /// Opens the table's four files (`.symd`, `.symi`, `.symk`, `.symr`)
    /// under the journal directory.
    pub fn open(
        dir: &Path,
        column_name: &str,
        distinct_count_hint: usize,
        avg_size: usize,
        mode: AccessMode,
    ) -> Result<Self> {
        if distinct_count_hint == 0 || !distinct_count_hint.is_power_of_two() {
            return Err(Error::Config(format!(
                "symbol column '{column_name}': distinct count hint {distinct_count_hint} must be a nonzero power of two"
            )));
        }

        let data = MemoryFile::open(
            dir.join(format!("{column_name}.symd")),
            bit_hint_for(avg_size as u64 * distinct_count_hint as u64),
            mode,
        )?;
        let offsets = MemoryFile::open(
            dir.join(format!("{column_name}.symi")),
            bit_hint_for(8 * distinct_count_hint as u64),
            mode,
        )?;
        let index = KVIndex::open(
            dir.join(format!("{column_name}.symk")),
            dir.join(format!("{column_name}.symr")),
            distinct_count_hint,
            distinct_count_hint,
            mode,
        )?;

        Ok(Self {
            column: VariableColumn::new(data, offsets),
            index,
            mask: distinct_count_hint - 1,
            visible: None,
            cache: HashMap::new(),
        })
    }

    /// Resolves a string to its key, appending it on first sight.
    /// Idempotent: a string seen before returns its existing key.
    pub fn put(&mut self, s: &str) -> Result<i32> {
        if let Some(&key) = self.cache.get(s) {
            return Ok(key);
        }
        if let Some(key) = self.probe(s)? {
            self.cache.insert(s.to_string(), key);
            return Ok(key);
        }

        let key = self.column.size() as i32;
        self.column.put_str(Some(s))?;
        self.index.add(bounded_hash(s, self.mask), key as u64)?;
        self.cache.insert(s.to_string(), key);
        Ok(key)
    }

    /// Resolves a string without inserting; `VALUE_NOT_FOUND` on a miss.
    pub fn get(&mut self, s: &str) -> Result<i32> {
        if let Some(&key) = self.cache.get(s) {
            return Ok(key);
        }
        match self.probe(s)? {
            Some(key) => {
                self.cache.insert(s.to_string(), key);
                Ok(key)
            }
            None => Ok(VALUE_NOT_FOUND),
        }
    }

    /// The string for a key; `None` for the null and not-found sentinels.
    pub fn value(&mut self, key: i32) -> Result<Option<String>> {
        if key == VALUE_IS_NULL || key == VALUE_NOT_FOUND {
            return Ok(None);
        }
        if key < 0 || key as u64 >= self.visible_size() {
            return Err(Error::IndexKeyOutOfRange {
                key,
                key_space: self.visible_size() as usize,
            });
        }
        self.column.str_at(key as u64)
    }

    /// Total number of keys handed out.
    pub fn size(&self) -> u64 {
        self.column.size()
    }

    /// Number of keys visible to this handle; bounded by the last observed
    /// tx on readers.
    pub fn visible_size(&self) -> u64 {
        self.visible.unwrap_or_else(|| self.column.size())
    }

    /// Installs the reader-side size from a transaction record.
    pub fn apply_size(&mut self, size: u64) {
        self.visible = Some(size);
        self.index.set_tx_address(size);
    }

    pub fn commit(&mut self) -> Result<()> {
        self.column.commit()?;
        self.index.commit()
    }

    pub fn force(&mut self) -> Result<()> {
        self.column.force()?;
        self.index.force()
    }

    pub fn compact(&mut self) -> Result<()> {
        self.column.compact()?;
        self.index.compact()
    }

    /// Shrinks the table to `size` keys, discarding later appends. Used by
    /// rollback and full journal truncation.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if size < self.column.size() {
            self.column.truncate(size)?;
        }
        self.index.truncate(size)?;
        self.cache.retain(|_, &mut key| (key as u64) < size);
        Ok(())
    }

    fn probe(&mut self, s: &str) -> Result<Option<i32>> {
        let hash = bounded_hash(s, self.mask);
        let count = self.index.value_count(hash)?;
        for i in (0..count).rev() {
            let key = self.index.value_at(hash, i)?;
            if let Some(stored) = self.column.flyweight_str_at(key)? {
                if stored.eq_str(s) {
                    return Ok(Some(key as i32));
                }
            }
        }
        Ok(None)
    }
}
