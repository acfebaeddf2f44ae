//! A partition: the columns and indexes for one time range.
//!
//! Owns one column per schema column plus a sparse array of index proxies
//! for the indexed ones. Columns live as `<name>.d` (+ `<name>.i` for
//! variable types) inside the partition directory; indexes as `<name>.k` /
//! `<name>.r`. Index proxies survive `close` so reader-visible tx addresses
//! are not lost when the TTL sweeper unmaps a partition.
//!
//! Symbol tables are journal-owned; operations that resolve symbols receive
//! them by slice, keyed by column index.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::column::{BSearchEdge, FixedColumn, VariableColumn};
use crate::error::{Error, Result};
use crate::index::KVIndex;
use crate::interval::{Interval, PartitionType};
use crate::mapped::{AccessMode, MemoryFile};
use crate::meta::{ColumnMetadata, ColumnType, JournalMetadata};
use crate::record::{RecordCodec, Value};
use crate::symbol::{SymbolTable, VALUE_IS_NULL, VALUE_NOT_FOUND};

enum Column {
    Fixed(FixedColumn),
    Variable(VariableColumn),
}

impl Column {
    fn size(&self) -> u64 {
        match self {
            Column::Fixed(c) => c.size(),
            Column::Variable(c) => c.size(),
        }
    }

    fn commit(&mut self) -> Result<()> {
        match self {
            Column::Fixed(c) => c.commit(),
            Column::Variable(c) => c.commit(),
        }
    }

    fn force(&mut self) -> Result<()> {
        match self {
            Column::Fixed(c) => c.force(),
            Column::Variable(c) => c.force(),
        }
    }

    fn truncate(&mut self, rows: u64) -> Result<()> {
        match self {
            Column::Fixed(c) => c.truncate(rows),
            Column::Variable(c) => c.truncate(rows),
        }
    }

    fn compact(&mut self) -> Result<()> {
        match self {
            Column::Fixed(c) => c.compact(),
            Column::Variable(c) => c.compact(),
        }
    }

    fn refresh(&mut self) -> Result<()> {
        match self {
            Column::Fixed(c) => c.refresh(),
            Column::Variable(c) => c.refresh(),
        }
    }
}

struct IndexProxy {
    /// Visibility cap carried across close/open; `None` evaluates raw.
    tx_address: Option<u64>,
    index: Option<KVIndex>,
}

pub struct Partition {
    metadata: Arc<JournalMetadata>,
    dir: PathBuf,
    interval: Interval,
    partition_index: usize,
    mode: AccessMode,
    columns: Option<Vec<Column>>,
    index_proxies: Vec<Option<IndexProxy>>,
    /// Visible row count from the last applied tx; `None` evaluates column
    /// sizes.
    tx_limit: Option<u64>,
    last_accessed: u64,
}

impl Partition {
    pub(crate) fn new(
        metadata: Arc<JournalMetadata>,
        journal_dir: &std::path::Path,
        interval: Interval,
        partition_index: usize,
        mode: AccessMode,
        tx_limit: Option<u64>,
        index_tx_addresses: Option<&[u64]>,
    ) -> Self {
        let dir = journal_dir.join(interval.dir_name(metadata.partition_type));
        Self::new_at_dir(
            metadata,
            dir,
            interval,
            partition_index,
            mode,
            tx_limit,
            index_tx_addresses,
        )
    }

    /// Constructs a partition over an explicit directory. Used for lag
    /// partitions, whose directory name carries a suffix the interval
    /// naming does not produce.
    pub(crate) fn new_at_dir(
        metadata: Arc<JournalMetadata>,
        dir: PathBuf,
        interval: Interval,
        partition_index: usize,
        mode: AccessMode,
        tx_limit: Option<u64>,
        index_tx_addresses: Option<&[u64]>,
    ) -> Self {
        let index_proxies = metadata
            .columns
            .iter()
            .enumerate()
            .map(|(i, m)| {
                m.indexed.then(|| IndexProxy {
                    tx_address: index_tx_addresses.map(|a| a[i]),
                    index: None,
                })
            })
            .collect();

        Self {
            metadata,
            dir,
            interval,
            partition_index,
            mode,
            columns: None,
            index_proxies,
            tx_limit,
            last_accessed: now_millis(),
        }
    }

    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn partition_index(&self) -> usize {
        self.partition_index
    }

    pub(crate) fn set_partition_index(&mut self, index: usize) {
        self.partition_index = index;
    }

    pub fn is_open(&self) -> bool {
        self.columns.is_some()
    }

    pub fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    /// Opens every column's files, creating the partition directory in
    /// write mode.
    pub fn open(&mut self) -> Result<()> {
        self.access();
        if self.columns.is_some() {
            return Ok(());
        }

        if self.mode == AccessMode::ReadWrite {
            std::fs::create_dir_all(&self.dir)?;
        }

        let meta = Arc::clone(&self.metadata);
        let mut columns = Vec::with_capacity(meta.columns.len());
        for m in &meta.columns {
            columns.push(self.open_column(m)?);
        }
        self.columns = Some(columns);
        tracing::trace!(partition = %self.name(), "partition opened");
        Ok(())
    }

    /// Unmaps and frees every column and index, preserving index proxy
    /// state.
    pub fn close(&mut self) {
        if self.columns.take().is_some() {
            tracing::trace!(partition = %self.name(), "partition closed");
        }
        for proxy in self.index_proxies.iter_mut().flatten() {
            proxy.index = None;
        }
    }

    /// Refreshes the TTL clock. Unpartitioned journals are never evicted,
    /// so the clock is left alone.
    pub fn access(&mut self) {
        if self.metadata.partition_type != PartitionType::None {
            let t = now_millis();
            if self.last_accessed < t {
                self.last_accessed = t;
            }
        }
    }

    /// Visible row count: the applied tx limit when one is set, the last
    /// column's size otherwise. Monotonic non-decreasing between commits.
    pub fn size(&mut self) -> Result<u64> {
        if let Some(limit) = self.tx_limit {
            return Ok(limit);
        }
        let columns = self
            .columns
            .as_ref()
            .ok_or_else(|| Error::ClosedPartition(self.dir.display().to_string()))?;
        let size = columns.last().map(|c| c.size()).unwrap_or(0);
        self.tx_limit = Some(size);
        Ok(size)
    }

    /// Installs the visible size and per-column index tx addresses from a
    /// transaction record. Passing no tx limit switches the partition to
    /// evaluating column sizes from the files; open columns re-stat so a
    /// reader observes the writer's final (sealed) lengths. Mappings are
    /// left in place either way.
    pub fn apply_tx(
        &mut self,
        tx_limit: Option<u64>,
        index_tx_addresses: Option<&[u64]>,
    ) -> Result<()> {
        self.tx_limit = tx_limit;
        if tx_limit.is_none() {
            if let Some(columns) = self.columns.as_mut() {
                for column in columns.iter_mut() {
                    column.refresh()?;
                }
            }
        }
        for (i, proxy) in self.index_proxies.iter_mut().enumerate() {
            if let Some(proxy) = proxy {
                proxy.tx_address = index_tx_addresses.map(|a| a[i]);
                if let Some(index) = proxy.index.as_mut() {
                    match proxy.tx_address {
                        Some(addr) => index.set_tx_address(addr),
                        None => index.clear_tx_address(),
                    }
                }
            }
        }
        Ok(())
    }

    /// Appends one record, dispatching per column type. Returns the local
    /// row id. On error the caller must roll the writer back; the partition
    /// may hold partially written columns.
    pub fn append<C: RecordCodec>(
        &mut self,
        record: &C,
        symbols: &mut [Option<SymbolTable>],
    ) -> Result<u64> {
        self.open()?;
        let meta = Arc::clone(&self.metadata);

        let mut row = 0;
        for (i, m) in meta.columns.iter().enumerate() {
            row = self.append_column(i, m, record.get(i), symbols)?;
        }
        self.tx_limit = None;
        Ok(row)
    }

    /// Copies every column's value for `row` into the out-record, skipping
    /// inactive columns and those unmapped in the target layout.
    pub fn read<C: RecordCodec>(
        &mut self,
        row: u64,
        out: &mut C,
        symbols: &mut [Option<SymbolTable>],
        inactive_columns: &[bool],
    ) -> Result<()> {
        self.open()?;
        let meta = Arc::clone(&self.metadata);

        for (i, m) in meta.columns.iter().enumerate() {
            if inactive_columns.get(i).copied().unwrap_or(false) || !out.is_mapped(i) {
                continue;
            }
            let value = self.read_value(i, m, row, symbols)?;
            out.set(i, value);
        }
        Ok(())
    }

    pub fn get_bool(&mut self, row: u64, column: usize) -> Result<bool> {
        self.fixed(column)?.get_bool(row)
    }

    pub fn get_byte(&mut self, row: u64, column: usize) -> Result<i8> {
        self.fixed(column)?.get_byte(row)
    }

    pub fn get_short(&mut self, row: u64, column: usize) -> Result<i16> {
        self.fixed(column)?.get_short(row)
    }

    pub fn get_int(&mut self, row: u64, column: usize) -> Result<i32> {
        self.fixed(column)?.get_int(row)
    }

    /// Widening read. An INT null (`i32::MIN`) surfaces as `i64::MIN`.
    pub fn get_long(&mut self, row: u64, column: usize) -> Result<i64> {
        match self.metadata.columns[column].column_type {
            ColumnType::Int => Ok(match self.fixed(column)?.get_int(row)? {
                i32::MIN => i64::MIN,
                v => v as i64,
            }),
            ColumnType::Short => Ok(self.fixed(column)?.get_short(row)? as i64),
            ColumnType::Byte => Ok(self.fixed(column)?.get_byte(row)? as i64),
            _ => self.fixed(column)?.get_long(row),
        }
    }

    pub fn get_float(&mut self, row: u64, column: usize) -> Result<f32> {
        self.fixed(column)?.get_float(row)
    }

    /// Widening read. An INT null (`i32::MIN`) surfaces as NaN.
    pub fn get_double(&mut self, row: u64, column: usize) -> Result<f64> {
        match self.metadata.columns[column].column_type {
            ColumnType::Int => Ok(match self.fixed(column)?.get_int(row)? {
                i32::MIN => f64::NAN,
                v => v as f64,
            }),
            ColumnType::Float => Ok(self.fixed(column)?.get_float(row)? as f64),
            ColumnType::Long | ColumnType::Date => Ok(self.fixed(column)?.get_long(row)? as f64),
            _ => self.fixed(column)?.get_double(row),
        }
    }

    pub fn get_str(&mut self, row: u64, column: usize) -> Result<Option<String>> {
        self.variable(column)?.str_at(row)
    }

    pub fn get_bin(&mut self, row: u64, column: usize) -> Result<Option<Vec<u8>>> {
        Ok(self.variable(column)?.bin_at(row)?.map(|b| b.into_owned()))
    }

    pub fn get_bin_size(&mut self, row: u64, column: usize) -> Result<i32> {
        self.variable(column)?.bin_size(row)
    }

    /// Resolves a SYMBOL column's value for `row`.
    pub fn get_sym(
        &mut self,
        row: u64,
        column: usize,
        symbols: &mut [Option<SymbolTable>],
    ) -> Result<Option<String>> {
        let key = self.fixed(column)?.get_int(row)?;
        match key {
            VALUE_IS_NULL | VALUE_NOT_FOUND => Ok(None),
            _ => symbol_table(symbols, column)?.value(key),
        }
    }

    /// Binary search on the timestamp column. See [`BSearchEdge`].
    pub fn index_of(&mut self, timestamp: i64, edge: BSearchEdge) -> Result<i64> {
        let size = self.size()?;
        self.index_of_in(timestamp, edge, 0, size)
    }

    /// Binary search on the timestamp column bounded to `[lo, hi)`.
    pub fn index_of_in(
        &mut self,
        timestamp: i64,
        edge: BSearchEdge,
        lo: u64,
        hi: u64,
    ) -> Result<i64> {
        let ts_column = self
            .metadata
            .timestamp_column
            .ok_or_else(|| Error::Config(format!("no timestamp column in {self}")))?;
        self.fixed(ts_column)?.bsearch_edge_in(timestamp, edge, lo, hi)
    }

    /// The inverted index of a column. Opens it lazily, applying the
    /// proxy's tx address.
    pub fn index_for(&mut self, column: usize) -> Result<&mut KVIndex> {
        let m = &self.metadata.columns[column];
        let key_space = m.distinct_count_hint;
        let kpath = self.dir.join(format!("{}.k", m.name));
        let rpath = self.dir.join(format!("{}.r", m.name));
        let record_hint = self.metadata.record_hint;
        let mode = self.mode;
        let name = m.name.clone();

        let proxy = self.index_proxies[column]
            .as_mut()
            .ok_or_else(|| Error::Config(format!("no index for column '{name}'")))?;
        if proxy.index.is_none() {
            let mut index = KVIndex::open(kpath, rpath, key_space, record_hint, mode)?;
            match proxy.tx_address {
                Some(addr) => index.set_tx_address(addr),
                None => index.clear_tx_address(),
            }
            proxy.index = Some(index);
        }
        Ok(proxy.index.as_mut().unwrap())
    }

    /// Commits columns first to last, so the partition size derived from
    /// the last column never observes a partial prior column.
    pub fn commit_columns(&mut self) -> Result<()> {
        if let Some(columns) = self.columns.as_mut() {
            for column in columns.iter_mut() {
                column.commit()?;
            }
        }
        Ok(())
    }

    /// Commits every open index.
    pub fn commit_indexes(&mut self) -> Result<()> {
        for i in self.indexed_columns() {
            self.index_for(i)?.commit()?;
        }
        Ok(())
    }

    /// Per-column index tx addresses, dense over all columns; 0 for
    /// columns without an index.
    pub fn index_tx_addresses(&mut self) -> Result<Vec<u64>> {
        let mut addresses = vec![0u64; self.metadata.columns.len()];
        for i in self.indexed_columns() {
            addresses[i] = self.index_for(i)?.tx_address();
        }
        Ok(addresses)
    }

    /// Fsyncs every column and index.
    pub fn force(&mut self) -> Result<()> {
        for i in self.indexed_columns() {
            self.index_for(i)?.force()?;
        }
        if let Some(columns) = self.columns.as_mut() {
            for column in columns.iter_mut() {
                column.force()?;
            }
        }
        Ok(())
    }

    /// Compacts every column and index, dropping unused mapping tails.
    pub fn compact(&mut self) -> Result<()> {
        if self.columns.is_none() {
            return Err(Error::ClosedPartition(self.dir.display().to_string()));
        }
        for i in self.indexed_columns() {
            self.index_for(i)?.compact()?;
        }
        if let Some(columns) = self.columns.as_mut() {
            for column in columns.iter_mut() {
                column.compact()?;
            }
        }
        Ok(())
    }

    /// Shrinks every column and index to `new_size` rows and commits.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.open()?;
        if self.size()? <= new_size {
            return Ok(());
        }

        for i in self.indexed_columns() {
            self.index_for(i)?.truncate(new_size)?;
        }
        if let Some(columns) = self.columns.as_mut() {
            for column in columns.iter_mut() {
                column.truncate(new_size)?;
            }
        }
        self.commit_columns()?;
        self.tx_limit = None;
        Ok(())
    }

    /// Rebuilds every indexed column's index from column data.
    pub fn rebuild_indexes(&mut self) -> Result<()> {
        for i in self.indexed_columns() {
            self.rebuild_index(i)?;
        }
        Ok(())
    }

    /// Closes a column's index, deletes its files and re-adds every
    /// `(key, row)` pair from the column. Exclusive of writers.
    pub fn rebuild_index(&mut self, column: usize) -> Result<()> {
        self.open()?;
        let name = self.metadata.columns[column].name.clone();
        let kpath = self.dir.join(format!("{name}.k"));
        let rpath = self.dir.join(format!("{name}.r"));

        match self.index_proxies[column].as_mut() {
            Some(proxy) => {
                proxy.index = None;
                proxy.tx_address = None;
            }
            None => {
                return Err(Error::Config(format!("no index for column '{name}'")));
            }
        }
        KVIndex::delete(&kpath, &rpath)?;

        let size = self.size()?;
        self.index_rows(column, 0, size)?;
        self.index_for(column)?.commit()?;
        tracing::debug!(partition = %self.name(), column = %name, rows = size, "index rebuilt");
        Ok(())
    }

    /// Back-fills every index from column data for rows in
    /// `[old_size, new_size)`.
    pub fn update_indexes(&mut self, old_size: u64, new_size: u64) -> Result<()> {
        if old_size < new_size {
            for i in self.indexed_columns() {
                self.index_rows(i, old_size, new_size)?;
                self.index_for(i)?.commit()?;
            }
        }
        Ok(())
    }

    fn index_rows(&mut self, column: usize, lo: u64, hi: u64) -> Result<()> {
        let column_type = self.metadata.columns[column].column_type;
        let mask = self.metadata.columns[column].key_mask();
        for row in lo..hi {
            let key = match column_type {
                ColumnType::Sym => self.fixed(column)?.get_int(row)?,
                ColumnType::Int => int_key(self.fixed(column)?.get_int(row)?, mask),
                ColumnType::Str => match self.variable(column)?.str_at(row)? {
                    Some(s) => crate::symbol::bounded_hash(&s, mask),
                    None => VALUE_IS_NULL,
                },
                other => {
                    return Err(Error::Config(format!(
                        "cannot index column of type {other:?}"
                    )));
                }
            };
            self.index_for(column)?.add(key, row)?;
        }
        Ok(())
    }

    fn append_column(
        &mut self,
        i: usize,
        m: &ColumnMetadata,
        value: Value,
        symbols: &mut [Option<SymbolTable>],
    ) -> Result<u64> {
        match m.column_type {
            ColumnType::Bool => match value {
                Value::Bool(v) => self.fixed(i)?.put_bool(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Byte => match value {
                Value::Byte(v) => self.fixed(i)?.put_byte(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Short => match value {
                Value::Short(v) => self.fixed(i)?.put_short(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Long => match value {
                Value::Long(v) => self.fixed(i)?.put_long(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Date => match value {
                Value::Date(v) | Value::Long(v) => self.fixed(i)?.put_long(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Float => match value {
                Value::Float(v) => self.fixed(i)?.put_float(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Double => match value {
                Value::Double(v) => self.fixed(i)?.put_double(v),
                other => Err(type_mismatch(m, &other)),
            },
            ColumnType::Int => {
                let v = match value {
                    Value::Int(v) => v,
                    other => return Err(type_mismatch(m, &other)),
                };
                let row = self.fixed(i)?.put_int(v)?;
                if m.indexed {
                    let key = int_key(v, m.key_mask());
                    self.index_for(i)?.add(key, row)?;
                }
                Ok(row)
            }
            ColumnType::Sym => {
                let key = match value {
                    Value::Null => VALUE_IS_NULL,
                    Value::Str(s) => symbol_table(symbols, i)?.put(&s)?,
                    other => return Err(type_mismatch(m, &other)),
                };
                let row = self.fixed(i)?.put_int(key)?;
                if m.indexed {
                    self.index_for(i)?.add(key, row)?;
                }
                Ok(row)
            }
            ColumnType::Str => {
                let s = match &value {
                    Value::Null => None,
                    Value::Str(s) => Some(s.as_str()),
                    other => return Err(type_mismatch(m, other)),
                };
                let row = self.variable(i)?.put_str(s)?;
                if m.indexed {
                    let key = s
                        .map(|s| crate::symbol::bounded_hash(s, m.key_mask()))
                        .unwrap_or(VALUE_IS_NULL);
                    self.index_for(i)?.add(key, row)?;
                }
                Ok(row)
            }
            ColumnType::Bin => {
                let b = match &value {
                    Value::Null => None,
                    Value::Bin(b) => Some(b.as_slice()),
                    other => return Err(type_mismatch(m, other)),
                };
                self.variable(i)?.put_bin(b)
            }
        }
    }

    fn read_value(
        &mut self,
        i: usize,
        m: &ColumnMetadata,
        row: u64,
        symbols: &mut [Option<SymbolTable>],
    ) -> Result<Value> {
        Ok(match m.column_type {
            ColumnType::Bool => Value::Bool(self.fixed(i)?.get_bool(row)?),
            ColumnType::Byte => Value::Byte(self.fixed(i)?.get_byte(row)?),
            ColumnType::Short => Value::Short(self.fixed(i)?.get_short(row)?),
            ColumnType::Int => Value::Int(self.fixed(i)?.get_int(row)?),
            ColumnType::Long => Value::Long(self.fixed(i)?.get_long(row)?),
            ColumnType::Date => Value::Date(self.fixed(i)?.get_long(row)?),
            ColumnType::Float => Value::Float(self.fixed(i)?.get_float(row)?),
            ColumnType::Double => Value::Double(self.fixed(i)?.get_double(row)?),
            ColumnType::Str => match self.variable(i)?.str_at(row)? {
                Some(s) => Value::Str(s),
                None => Value::Null,
            },
            ColumnType::Sym => match self.get_sym(row, i, symbols)? {
                Some(s) => Value::Str(s),
                None => Value::Null,
            },
            ColumnType::Bin => match self.variable(i)?.bin_at(row)? {
                Some(b) => Value::Bin(b.into_owned()),
                None => Value::Null,
            },
        })
    }

    fn open_column(&mut self, m: &ColumnMetadata) -> Result<Column> {
        let data = MemoryFile::open(
            self.dir.join(format!("{}.d", m.name)),
            m.bit_hint,
            self.mode,
        )?;
        Ok(match m.column_type {
            ColumnType::Str | ColumnType::Bin => {
                let offsets = MemoryFile::open(
                    self.dir.join(format!("{}.i", m.name)),
                    m.index_bit_hint,
                    self.mode,
                )?;
                Column::Variable(VariableColumn::new(data, offsets))
            }
            _ => Column::Fixed(FixedColumn::new(data, m.size)),
        })
    }

    fn indexed_columns(&self) -> Vec<usize> {
        self.index_proxies
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|_| i))
            .collect()
    }

    fn fixed(&mut self, i: usize) -> Result<&mut FixedColumn> {
        let dir = &self.dir;
        match self
            .columns
            .as_mut()
            .ok_or_else(|| Error::ClosedPartition(dir.display().to_string()))?
            .get_mut(i)
        {
            Some(Column::Fixed(c)) => Ok(c),
            _ => Err(Error::Config(format!("column {i} is not fixed-width"))),
        }
    }

    fn variable(&mut self, i: usize) -> Result<&mut VariableColumn> {
        let dir = &self.dir;
        match self
            .columns
            .as_mut()
            .ok_or_else(|| Error::ClosedPartition(dir.display().to_string()))?
            .get_mut(i)
        {
            Some(Column::Variable(c)) => Ok(c),
            _ => Err(Error::Config(format!("column {i} is not variable-width"))),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Partition{{index={}, open={}, dir={}}}",
            self.partition_index,
            self.is_open(),
            self.dir.display()
        )
    }
}

fn symbol_table<'a>(
    symbols: &'a mut [Option<SymbolTable>],
    column: usize,
) -> Result<&'a mut SymbolTable> {
    symbols
        .get_mut(column)
        .and_then(|s| s.as_mut())
        .ok_or_else(|| Error::Config(format!("no symbol table for column {column}")))
}

fn int_key(value: i32, mask: usize) -> i32 {
    (value as u32 as usize & mask) as i32
}

fn type_mismatch(m: &ColumnMetadata, value: &Value) -> Error {
    Error::Config(format!(
        "column '{}' is {:?}, got {value:?}",
        m.name, m.column_type
    ))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ColumnDef;
    use crate::record::Record;
    use tempfile::TempDir;

    const JAN_1_2015: i64 = 1420070400000;

    fn trade_metadata() -> Arc<JournalMetadata> {
        Arc::new(
            JournalMetadata::builder("trades")
                .column(ColumnDef::new("sym", ColumnType::Sym).indexed().distinct_count_hint(16))
                .column(ColumnDef::new("price", ColumnType::Double))
                .column(ColumnDef::new("note", ColumnType::Str))
                .timestamp("ts")
                .partition_by(PartitionType::Day)
                .build()
                .unwrap(),
        )
    }

    fn open_partition(dir: &TempDir, meta: &Arc<JournalMetadata>) -> Partition {
        let interval = Interval::containing(JAN_1_2015, PartitionType::Day).unwrap();
        let mut partition = Partition::new(
            Arc::clone(meta),
            dir.path(),
            interval,
            0,
            AccessMode::ReadWrite,
            None,
            None,
        );
        partition.open().unwrap();
        partition
    }

    fn symbols_for(dir: &TempDir, meta: &Arc<JournalMetadata>) -> Vec<Option<SymbolTable>> {
        meta.columns
            .iter()
            .map(|m| {
                (m.column_type == ColumnType::Sym).then(|| {
                    SymbolTable::open(
                        dir.path(),
                        &m.name,
                        m.distinct_count_hint,
                        m.avg_size,
                        AccessMode::ReadWrite,
                    )
                    .unwrap()
                })
            })
            .collect()
    }

    fn trade(sym: Option<&str>, price: f64, note: Option<&str>, ts: i64) -> Record {
        Record::with_values(vec![
            sym.map(|s| Value::Str(s.to_string())).unwrap_or(Value::Null),
            Value::Double(price),
            note.map(|s| Value::Str(s.to_string())).unwrap_or(Value::Null),
            Value::Date(ts),
        ])
    }

    #[test]
    fn test_append_and_read() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        partition.append(&trade(Some("AAA"), 1.5, Some("first"), JAN_1_2015), &mut symbols)?;
        partition.append(&trade(None, 2.5, None, JAN_1_2015 + 1), &mut symbols)?;

        assert_eq!(partition.size()?, 2);

        let mut out = Record::new(4);
        partition.read(0, &mut out, &mut symbols, &[])?;
        assert_eq!(out.value(0), &Value::Str("AAA".to_string()));
        assert_eq!(out.value(1), &Value::Double(1.5));
        assert_eq!(out.value(2), &Value::Str("first".to_string()));
        assert_eq!(out.value(3), &Value::Date(JAN_1_2015));

        partition.read(1, &mut out, &mut symbols, &[])?;
        assert_eq!(out.value(0), &Value::Null);
        assert_eq!(out.value(2), &Value::Null);
        Ok(())
    }

    #[test]
    fn test_symbol_index_updated_on_append() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        for (i, sym) in ["a", "b", "a", "a", "b"].iter().enumerate() {
            partition.append(&trade(Some(sym), 0.0, None, JAN_1_2015 + i as i64), &mut symbols)?;
        }

        let key_a = symbols[0].as_mut().unwrap().get("a")?;
        let index = partition.index_for(0)?;
        assert_eq!(index.values(key_a)?, vec![0, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        let bad = Record::with_values(vec![
            Value::Int(1),
            Value::Double(0.0),
            Value::Null,
            Value::Date(0),
        ]);
        assert!(matches!(
            partition.append(&bad, &mut symbols),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_int_null_coercions() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(
            JournalMetadata::builder("ints")
                .column(ColumnDef::new("v", ColumnType::Int))
                .build()
                .unwrap(),
        );
        let mut symbols: Vec<Option<SymbolTable>> = vec![None];
        let interval = Interval::containing(0, PartitionType::None).unwrap();
        let mut partition = Partition::new(
            Arc::clone(&meta),
            dir.path(),
            interval,
            0,
            AccessMode::ReadWrite,
            None,
            None,
        );
        partition.open()?;

        partition.append(&Record::with_values(vec![Value::Int(i32::MIN)]), &mut symbols)?;

        assert_eq!(partition.get_int(0, 0)?, i32::MIN);
        assert_eq!(partition.get_long(0, 0)?, i64::MIN);
        assert!(partition.get_double(0, 0)?.is_nan());
        Ok(())
    }

    #[test]
    fn test_truncate_shrinks_columns_and_indexes() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        for i in 0..6i64 {
            partition.append(&trade(Some("s"), i as f64, None, JAN_1_2015 + i), &mut symbols)?;
        }
        partition.truncate(2)?;

        assert_eq!(partition.size()?, 2);
        let key = symbols[0].as_mut().unwrap().get("s")?;
        assert_eq!(partition.index_for(0)?.values(key)?, vec![0, 1]);
        assert_eq!(partition.get_double(1, 1)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_timestamp_search() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        for ts in [0i64, 1000, 1000, 2000] {
            partition.append(&trade(None, 0.0, None, JAN_1_2015 + ts), &mut symbols)?;
        }

        assert_eq!(
            partition.index_of(JAN_1_2015 + 1000, BSearchEdge::NewerOrSame)?,
            1
        );
        assert_eq!(
            partition.index_of(JAN_1_2015 + 1000, BSearchEdge::OlderOrSame)?,
            2
        );
        assert_eq!(partition.index_of(JAN_1_2015 + 5000, BSearchEdge::Newer)?, -1);
        Ok(())
    }

    #[test]
    fn test_rebuild_index_matches_appends() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        for (i, sym) in ["x", "y", "x", "z"].iter().enumerate() {
            partition.append(&trade(Some(sym), 0.0, None, JAN_1_2015 + i as i64), &mut symbols)?;
        }

        let key_x = symbols[0].as_mut().unwrap().get("x")?;
        let before = partition.index_for(0)?.values(key_x)?;
        partition.rebuild_index(0)?;
        assert_eq!(partition.index_for(0)?.values(key_x)?, before);
        Ok(())
    }

    #[test]
    fn test_close_preserves_tx_address() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let meta = trade_metadata();
        let mut symbols = symbols_for(&dir, &meta);
        let mut partition = open_partition(&dir, &meta);

        partition.append(&trade(Some("k"), 1.0, None, JAN_1_2015), &mut symbols)?;
        partition.commit_columns()?;
        partition.commit_indexes()?;
        let addresses = partition.index_tx_addresses()?;

        partition.append(&trade(Some("k"), 2.0, None, JAN_1_2015 + 1), &mut symbols)?;
        partition.apply_tx(Some(1), Some(&addresses))?;
        partition.close();
        assert!(!partition.is_open());

        partition.open()?;
        let key = symbols[0].as_mut().unwrap().get("k")?;
        assert_eq!(partition.size()?, 1);
        assert_eq!(partition.index_for(0)?.value_count(key)?, 1);
        Ok(())
    }
}
