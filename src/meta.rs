//! Journal and column schema.
//!
//! A journal's schema is fixed at creation: an ordered list of typed columns,
//! an optional timestamp column, the partition type and a handful of sizing
//! hints. The schema is persisted to `_meta` in the journal directory and
//! validated against the caller's configuration on every open.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errcfg;
use crate::error::{Error, Result};
use crate::interval::PartitionType;

/// Name of the schema file inside a journal directory.
pub const META_FILE_NAME: &str = "_meta";

/// Default mapping-window hints are derived from these; see
/// [`bit_hint_for`].
const MIN_BIT_HINT: u32 = 17;
const MAX_BIT_HINT: u32 = 30;

const DEFAULT_RECORD_HINT: usize = 100_000;
const DEFAULT_AVG_STR_SIZE: usize = 12;
const DEFAULT_AVG_BIN_SIZE: usize = 64;
const DEFAULT_DISTINCT_HINT: usize = 256;
const DEFAULT_OPEN_FILE_TTL_MS: u64 = 180_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Epoch milliseconds stored as LONG.
    Date,
    Str,
    Bin,
    /// Low-cardinality string stored as an INT key into a journal-level
    /// symbol table.
    Sym,
}

impl ColumnType {
    /// Element width in bytes for fixed-width types; `None` for STRING and
    /// BINARY.
    pub fn fixed_size(&self) -> Option<u64> {
        match self {
            ColumnType::Bool | ColumnType::Byte => Some(1),
            ColumnType::Short => Some(2),
            ColumnType::Int | ColumnType::Float | ColumnType::Sym => Some(4),
            ColumnType::Long | ColumnType::Double | ColumnType::Date => Some(8),
            ColumnType::Str | ColumnType::Bin => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.fixed_size().is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub column_type: ColumnType,
    /// Element width in bytes; 0 for variable types.
    pub size: u64,
    /// Average value size hint for variable types.
    pub avg_size: usize,
    /// log2 of the mapping window over the data file.
    pub bit_hint: u32,
    /// log2 of the mapping window over the offsets file (variable types).
    pub index_bit_hint: u32,
    pub indexed: bool,
    /// Key space of the column's inverted index; power of two.
    pub distinct_count_hint: usize,
}

impl ColumnMetadata {
    /// Mask applied to hashes and raw int values when deriving index keys.
    pub fn key_mask(&self) -> usize {
        self.distinct_count_hint.saturating_sub(1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalMetadata {
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub timestamp_column: Option<usize>,
    pub partition_type: PartitionType,
    pub record_hint: usize,
    pub tx_count_hint: usize,
    pub open_file_ttl_ms: u64,
    pub lag_hours: u32,
    pub key_column: Option<usize>,
}

impl JournalMetadata {
    pub fn builder(name: impl Into<String>) -> JournalMetadataBuilder {
        JournalMetadataBuilder::new(name)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> &ColumnMetadata {
        &self.columns[index]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Writes the schema file, or validates it when one already exists.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        let path = dir.join(META_FILE_NAME);
        if path.exists() {
            let existing: JournalMetadata = bincode::deserialize(&fs::read(&path)?)?;
            if existing != *self {
                return Err(Error::Config(format!(
                    "schema mismatch for journal '{}': on-disk _meta differs",
                    self.name
                )));
            }
            return Ok(());
        }
        fs::write(&path, bincode::serialize(self)?)?;
        Ok(())
    }
}

/// Column definition used while building a [`JournalMetadata`].
#[derive(Clone, Debug)]
pub struct ColumnDef {
    name: String,
    column_type: ColumnType,
    avg_size: Option<usize>,
    indexed: bool,
    distinct_count_hint: Option<usize>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            avg_size: None,
            indexed: false,
            distinct_count_hint: None,
        }
    }

    /// Maintain an inverted index for this column.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Expected number of distinct values; sizes the index key space. Must
    /// be a power of two.
    pub fn distinct_count_hint(mut self, hint: usize) -> Self {
        self.distinct_count_hint = Some(hint);
        self
    }

    /// Average value size hint for STRING/BINARY columns.
    pub fn avg_size(mut self, avg: usize) -> Self {
        self.avg_size = Some(avg);
        self
    }
}

pub struct JournalMetadataBuilder {
    name: String,
    columns: Vec<ColumnDef>,
    timestamp: Option<String>,
    partition_type: PartitionType,
    record_hint: usize,
    tx_count_hint: Option<usize>,
    open_file_ttl_ms: u64,
    lag_hours: u32,
    key_column: Option<String>,
}

impl JournalMetadataBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            timestamp: None,
            partition_type: PartitionType::None,
            record_hint: DEFAULT_RECORD_HINT,
            tx_count_hint: None,
            open_file_ttl_ms: DEFAULT_OPEN_FILE_TTL_MS,
            lag_hours: 0,
            key_column: None,
        }
    }

    pub fn column(mut self, def: ColumnDef) -> Self {
        self.columns.push(def);
        self
    }

    /// Adds a DATE column and marks it as the journal timestamp. The
    /// timestamp column is non-decreasing across the entire journal.
    pub fn timestamp(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.timestamp = Some(name.clone());
        self.columns.push(ColumnDef::new(name, ColumnType::Date));
        self
    }

    pub fn partition_by(mut self, partition_type: PartitionType) -> Self {
        self.partition_type = partition_type;
        self
    }

    pub fn record_hint(mut self, hint: usize) -> Self {
        self.record_hint = hint;
        self
    }

    pub fn tx_count_hint(mut self, hint: usize) -> Self {
        self.tx_count_hint = Some(hint);
        self
    }

    pub fn open_file_ttl_ms(mut self, ttl: u64) -> Self {
        self.open_file_ttl_ms = ttl;
        self
    }

    /// Enables a lag window (hours) for out-of-order late data.
    pub fn lag_hours(mut self, hours: u32) -> Self {
        self.lag_hours = hours;
        self
    }

    /// Declares a unique secondary key column.
    pub fn key_column(mut self, name: impl Into<String>) -> Self {
        self.key_column = Some(name.into());
        self
    }

    pub fn build(self) -> Result<JournalMetadata> {
        if self.columns.is_empty() {
            return errcfg!("journal '{}' has no columns", self.name);
        }

        let mut columns = Vec::with_capacity(self.columns.len());
        for (i, def) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == def.name) {
                return errcfg!("duplicate column '{}'", def.name);
            }

            let size = def.column_type.fixed_size().unwrap_or(0);
            let avg_size = def.avg_size.unwrap_or(match def.column_type {
                ColumnType::Bin => DEFAULT_AVG_BIN_SIZE,
                _ => DEFAULT_AVG_STR_SIZE,
            });

            let needs_index = def.indexed || def.column_type == ColumnType::Sym;
            let distinct_count_hint = if needs_index {
                let hint = def
                    .distinct_count_hint
                    .unwrap_or(DEFAULT_DISTINCT_HINT);
                if hint == 0 || !hint.is_power_of_two() {
                    return errcfg!(
                        "column '{}': distinct count hint {} must be a nonzero power of two",
                        def.name,
                        hint
                    );
                }
                hint
            } else {
                def.distinct_count_hint.unwrap_or(0)
            };

            if def.indexed
                && !matches!(
                    def.column_type,
                    ColumnType::Int | ColumnType::Sym | ColumnType::Str
                )
            {
                return errcfg!(
                    "column '{}': only INT, SYMBOL and STRING columns can be indexed",
                    def.name
                );
            }

            let data_bytes = if def.column_type.is_variable() {
                avg_size as u64 * self.record_hint as u64
            } else {
                size * self.record_hint as u64
            };

            columns.push(ColumnMetadata {
                name: def.name.clone(),
                column_type: def.column_type,
                size,
                avg_size,
                bit_hint: bit_hint_for(data_bytes),
                index_bit_hint: bit_hint_for(8 * self.record_hint as u64),
                indexed: def.indexed,
                distinct_count_hint,
            });
        }

        let timestamp_column = match &self.timestamp {
            Some(name) => {
                let idx = columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| Error::Config(format!("timestamp column '{name}' not found")))?;
                if !matches!(
                    columns[idx].column_type,
                    ColumnType::Date | ColumnType::Long
                ) {
                    return Err(Error::Config(format!(
                        "timestamp column '{name}' must be DATE or LONG"
                    )));
                }
                Some(idx)
            }
            None => None,
        };

        if self.partition_type != PartitionType::None && timestamp_column.is_none() {
            return errcfg!(
                "journal '{}' is time-partitioned but has no timestamp column",
                self.name
            );
        }

        let key_column = match &self.key_column {
            Some(name) => Some(
                columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| Error::Config(format!("key column '{name}' not found")))?,
            ),
            None => None,
        };

        Ok(JournalMetadata {
            name: self.name,
            columns,
            timestamp_column,
            partition_type: self.partition_type,
            record_hint: self.record_hint,
            tx_count_hint: self.tx_count_hint.unwrap_or(self.record_hint / 100 + 1),
            open_file_ttl_ms: self.open_file_ttl_ms,
            lag_hours: self.lag_hours,
            key_column,
        })
    }
}

/// log2 of the mapping window covering `total_bytes`, clamped to
/// `[2^17, 2^30]`.
pub fn bit_hint_for(total_bytes: u64) -> u32 {
    let bits = total_bytes.max(1).next_power_of_two().trailing_zeros();
    bits.clamp(MIN_BIT_HINT, MAX_BIT_HINT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quote_schema() -> Result<JournalMetadata> {
        JournalMetadata::builder("quotes")
            .column(ColumnDef::new("sym", ColumnType::Sym).indexed().distinct_count_hint(16))
            .column(ColumnDef::new("bid", ColumnType::Double))
            .timestamp("ts")
            .partition_by(PartitionType::Day)
            .build()
    }

    #[test]
    fn test_build_quote_schema() -> Result<()> {
        let meta = quote_schema()?;
        assert_eq!(meta.column_count(), 3);
        assert_eq!(meta.timestamp_column, Some(2));
        assert_eq!(meta.column(0).column_type, ColumnType::Sym);
        assert_eq!(meta.column(0).size, 4);
        assert_eq!(meta.column(1).size, 8);
        assert_eq!(meta.column_index("bid"), Some(1));
        Ok(())
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let result = JournalMetadata::builder("j")
            .column(ColumnDef::new("x", ColumnType::Int))
            .column(ColumnDef::new("x", ColumnType::Long))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_distinct_hint_must_be_power_of_two() {
        let result = JournalMetadata::builder("j")
            .column(ColumnDef::new("s", ColumnType::Sym).distinct_count_hint(100))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));

        let result = JournalMetadata::builder("j")
            .column(ColumnDef::new("s", ColumnType::Str).indexed().distinct_count_hint(0))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_partitioned_journal_needs_timestamp() {
        let result = JournalMetadata::builder("j")
            .column(ColumnDef::new("x", ColumnType::Int))
            .partition_by(PartitionType::Day)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_indexed_double_rejected() {
        let result = JournalMetadata::builder("j")
            .column(ColumnDef::new("x", ColumnType::Double).indexed())
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bit_hint_bounds() {
        assert_eq!(bit_hint_for(1), 17);
        assert_eq!(bit_hint_for(1 << 20), 20);
        assert_eq!(bit_hint_for((1 << 20) + 1), 21);
        assert_eq!(bit_hint_for(u64::MAX / 2), 30);
    }

    #[test]
    fn test_meta_persist_and_validate() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = quote_schema()?;
        meta.persist(dir.path())?;

        // Same schema validates.
        meta.persist(dir.path())?;

        // A different schema is rejected.
        let other = JournalMetadata::builder("quotes")
            .column(ColumnDef::new("ask", ColumnType::Double))
            .timestamp("ts")
            .partition_by(PartitionType::Day)
            .build()?;
        assert!(matches!(other.persist(dir.path()), Err(Error::Config(_))));
        Ok(())
    }
}
