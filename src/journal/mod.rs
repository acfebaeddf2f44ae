//! Journals: ordered collections of time-range partitions.
//!
//! A [`Journal`] is the reader-side handle: it discovers partitions from the
//! directory tree, applies transaction records to publish visible sizes, and
//! iterates rows. [`JournalWriter`] (see [`writer`]) adds the single-writer
//! append and commit protocol on top.
//!
//! Readers are unsynchronized with the writer: `refresh` re-reads the tail
//! of the transaction log and re-applies partition sizes and index addresses
//! without remapping column files. A row is visible only when a transaction
//! record covering it has been observed.

pub mod writer;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::interval::{Interval, PartitionType, LAG_SUFFIX};
use crate::mapped::AccessMode;
use crate::meta::{ColumnType, JournalMetadata, META_FILE_NAME};
use crate::partition::Partition;
use crate::record::{Record, RecordCodec};
use crate::symbol::SymbolTable;
use crate::tx::{global_row_id, split_row_id, Tx, TxLog, LAG_PARTITION_INDEX, TX_FILE_NAME};

pub use writer::JournalWriter;

pub struct Journal {
    pub(crate) metadata: Arc<JournalMetadata>,
    pub(crate) location: PathBuf,
    pub(crate) mode: AccessMode,
    pub(crate) partitions: Vec<Partition>,
    /// Late rows staged inside the lag window; ordered after the regular
    /// partitions and addressed by [`LAG_PARTITION_INDEX`].
    pub(crate) lag: Option<Partition>,
    /// Symbol tables by column index; `None` for non-symbol columns.
    pub(crate) symbols: Vec<Option<SymbolTable>>,
    /// Absent until the writer has created the `_tx` file.
    pub(crate) tx_log: Option<TxLog>,
    pub(crate) inactive_columns: Vec<bool>,
}

impl Journal {
    /// Opens a reader over `<base>/<journal name>/`. The journal must have
    /// been created by a writer; the stored schema is validated against
    /// `metadata`.
    pub fn open(base: impl AsRef<Path>, metadata: JournalMetadata) -> Result<Journal> {
        Self::open_with_mode(base.as_ref(), metadata, AccessMode::ReadOnly)
    }

    pub(crate) fn open_with_mode(
        base: &Path,
        metadata: JournalMetadata,
        mode: AccessMode,
    ) -> Result<Journal> {
        let location = base.join(&metadata.name);
        match mode {
            AccessMode::ReadWrite => {
                fs::create_dir_all(&location)?;
                metadata.persist(&location)?;
            }
            AccessMode::ReadOnly => {
                if !location.is_dir() || !location.join(META_FILE_NAME).exists() {
                    return Err(Error::Config(format!(
                        "journal '{}' does not exist at {}",
                        metadata.name,
                        location.display()
                    )));
                }
                metadata.persist(&location)?;
            }
        }

        let metadata = Arc::new(metadata);
        let mut symbols = Vec::with_capacity(metadata.columns.len());
        for m in &metadata.columns {
            symbols.push(if m.column_type == ColumnType::Sym {
                Some(SymbolTable::open(
                    &location,
                    &m.name,
                    m.distinct_count_hint,
                    m.avg_size,
                    mode,
                )?)
            } else {
                None
            });
        }

        let tx_path = location.join(TX_FILE_NAME);
        let tx_log = if mode == AccessMode::ReadWrite || tx_path.exists() {
            Some(TxLog::open(tx_path, mode)?)
        } else {
            None
        };

        let inactive_columns = vec![false; metadata.columns.len()];
        let mut journal = Journal {
            metadata,
            location,
            mode,
            partitions: Vec::new(),
            lag: None,
            symbols,
            tx_log,
            inactive_columns,
        };
        journal.sync_partition_list()?;
        if mode == AccessMode::ReadOnly {
            journal.apply_latest()?;
        }
        Ok(journal)
    }

    pub fn metadata(&self) -> &JournalMetadata {
        &self.metadata
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Total visible row count across all partitions, lag included.
    pub fn size(&mut self) -> Result<u64> {
        let mut total = 0;
        for i in 0..self.partitions.len() {
            total += self.partition_size(i)?;
        }
        total += self.lag_size()?;
        Ok(total)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn get_partition(&mut self, index: usize, open: bool) -> Result<&mut Partition> {
        if index >= self.partitions.len() {
            return Err(Error::Config(format!(
                "partition index {index} out of range ({} partitions)",
                self.partitions.len()
            )));
        }
        let partition = &mut self.partitions[index];
        if open {
            partition.open()?;
        }
        Ok(partition)
    }

    pub fn last_partition(&mut self, open: bool) -> Result<Option<&mut Partition>> {
        if self.partitions.is_empty() {
            return Ok(None);
        }
        let last = self.partitions.len() - 1;
        self.get_partition(last, open).map(Some)
    }

    /// The lag partition holding late rows, when one exists.
    pub fn lag_partition(&mut self) -> Option<&mut Partition> {
        self.lag.as_mut()
    }

    /// The journal-level symbol table of a SYMBOL column.
    pub fn symbol_table(&mut self, column: usize) -> Result<&mut SymbolTable> {
        self.symbols
            .get_mut(column)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::Config(format!("no symbol table for column {column}")))
    }

    /// Excludes a column from `read` materialization.
    pub fn set_column_inactive(&mut self, column: usize, inactive: bool) {
        if column < self.inactive_columns.len() {
            self.inactive_columns[column] = inactive;
        }
    }

    /// Re-reads the transaction log tail and applies any new commit.
    /// Returns true when new data became visible.
    pub fn refresh(&mut self) -> Result<bool> {
        if self.tx_log.is_none() {
            let path = self.location.join(TX_FILE_NAME);
            if !path.exists() {
                return Ok(false);
            }
            self.tx_log = Some(TxLog::open(path, self.mode)?);
            self.apply_latest()?;
            return Ok(self.tx_log.as_ref().is_some_and(|l| l.latest().is_some()));
        }

        let advanced = self.tx_log.as_mut().unwrap().refresh()?;
        if advanced {
            self.apply_latest()?;
        }
        Ok(advanced)
    }

    /// Reads the row at `global_row_id` into a fresh record.
    pub fn read_record(&mut self, global_row_id: u64) -> Result<Record> {
        let mut record = Record::new(self.metadata.columns.len());
        self.read_into(global_row_id, &mut record)?;
        Ok(record)
    }

    /// Reads the row at `global_row_id` into `out` through its codec.
    pub fn read_into<C: RecordCodec>(&mut self, global_row_id: u64, out: &mut C) -> Result<()> {
        let (partition_index, local_row_id) = split_row_id(global_row_id);
        if partition_index == LAG_PARTITION_INDEX {
            let lag = self
                .lag
                .as_mut()
                .ok_or_else(|| Error::Config("journal has no lag partition".to_string()))?;
            return lag.read(local_row_id, out, &mut self.symbols, &self.inactive_columns);
        }
        self.get_partition(partition_index, true)?;
        self.partitions[partition_index].read(
            local_row_id,
            out,
            &mut self.symbols,
            &self.inactive_columns,
        )
    }

    /// A forward iterator over every visible row.
    pub fn iter(&mut self) -> JournalIterator<'_> {
        JournalIterator {
            journal: self,
            partition: 0,
            row: 0,
            limit: None,
            failed: false,
        }
    }

    /// A forward iterator that re-reads into a caller-supplied record.
    pub fn buffered_iter(&mut self) -> BufferedIterator<'_> {
        BufferedIterator {
            journal: self,
            partition: 0,
            row: 0,
            limit: None,
        }
    }

    /// Closes partitions whose last access is older than the journal's
    /// open-file TTL. The writer's active partition is never evicted.
    pub fn evict_stale_partitions(&mut self) {
        let ttl = self.metadata.open_file_ttl_ms;
        let now = crate::partition::now_millis();
        let keep_active = self.mode == AccessMode::ReadWrite;
        let count = self.partitions.len();

        for (i, partition) in self.partitions.iter_mut().enumerate() {
            if keep_active && i + 1 == count {
                continue;
            }
            if partition.is_open() && now.saturating_sub(partition.last_accessed()) > ttl {
                tracing::debug!(partition = %partition.name(), "evicting idle partition");
                partition.close();
            }
        }
    }

    pub(crate) fn tx_log_mut(&mut self) -> Result<&mut TxLog> {
        self.tx_log
            .as_mut()
            .ok_or_else(|| Error::Io("transaction log is not open".to_string()))
    }

    pub(crate) fn partition_size(&mut self, index: usize) -> Result<u64> {
        let partition = &mut self.partitions[index];
        match partition.size() {
            Ok(size) => Ok(size),
            Err(Error::ClosedPartition(_)) => {
                partition.open()?;
                partition.size()
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn lag_size(&mut self) -> Result<u64> {
        let Some(lag) = self.lag.as_mut() else {
            return Ok(0);
        };
        match lag.size() {
            Ok(size) => Ok(size),
            Err(Error::ClosedPartition(_)) => {
                lag.open()?;
                lag.size()
            }
            Err(e) => Err(e),
        }
    }

    fn apply_latest(&mut self) -> Result<()> {
        let Some(tx) = self.tx_log.as_ref().and_then(|l| l.latest()).cloned() else {
            return Ok(());
        };
        self.apply_tx(&tx)
    }

    /// Dispatches a transaction record: visible sizes for each partition,
    /// index tx addresses for the active one, symbol table sizes. New
    /// partition directories are materialized; mappings of already open
    /// partitions are left in place.
    fn apply_tx(&mut self, tx: &Tx) -> Result<()> {
        self.sync_partition_list()?;

        let active = tx.partition_index();
        let row_count = tx.partition_row_count();
        if tx.journal_max_row_id > 0 && self.partitions.len() <= active {
            return Err(Error::TxCorruption(format!(
                "transaction {} references partition {active} but only {} exist",
                tx.tx_number,
                self.partitions.len()
            )));
        }

        let addresses = (tx.index_tx_addresses.len() == self.metadata.columns.len())
            .then_some(tx.index_tx_addresses.as_slice());

        for (i, partition) in self.partitions.iter_mut().enumerate() {
            if tx.journal_max_row_id == 0 || i > active {
                partition.apply_tx(Some(0), None)?;
            } else if i == active {
                partition.apply_tx(Some(row_count), addresses)?;
            } else {
                // Sealed: the writer compacted it, so column sizes are
                // evaluated from the files.
                partition.apply_tx(None, None)?;
            }
        }

        match &tx.lag_partition_name {
            Some(name) => {
                if self.lag.as_ref().map(|p| p.name() != *name).unwrap_or(true) {
                    if let Some(mut stale) = self.lag.take() {
                        stale.close();
                    }
                    let stripped = name.strip_suffix(LAG_SUFFIX).unwrap_or(name);
                    let interval =
                        match Interval::parse(stripped, self.metadata.partition_type) {
                            Some(interval) => interval,
                            None => Interval::containing(0, PartitionType::None)?,
                        };
                    self.lag = Some(Partition::new_at_dir(
                        Arc::clone(&self.metadata),
                        self.location.join(name),
                        interval,
                        LAG_PARTITION_INDEX,
                        self.mode,
                        Some(0),
                        None,
                    ));
                }
                // Lag row ids ascend like any partition's, so the published
                // row count doubles as the index visibility cap.
                let caps = vec![tx.lag_size; self.metadata.columns.len()];
                self.lag
                    .as_mut()
                    .unwrap()
                    .apply_tx(Some(tx.lag_size), Some(&caps))?;
            }
            None => {
                if let Some(mut stale) = self.lag.take() {
                    stale.close();
                }
            }
        }

        for (i, slot) in self.symbols.iter_mut().enumerate() {
            if let Some(table) = slot {
                table.apply_size(tx.symbol_table_sizes.get(i).copied().unwrap_or(0));
            }
        }
        Ok(())
    }

    /// Rescans the journal directory for partition directories, keeping the
    /// state of partitions already known. Lag directories are skipped.
    pub(crate) fn sync_partition_list(&mut self) -> Result<()> {
        let partition_type = self.metadata.partition_type;
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.location)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(LAG_SUFFIX) {
                continue;
            }
            if let Some(interval) = Interval::parse(&name, partition_type) {
                found.push(interval);
            }
        }
        found.sort_by_key(Interval::lo);

        if found.len() == self.partitions.len() {
            return Ok(());
        }

        let mut existing: Vec<Partition> = self.partitions.drain(..).collect();
        for (i, interval) in found.into_iter().enumerate() {
            let mut partition = match existing.iter().position(|p| p.interval() == interval) {
                Some(at) => existing.remove(at),
                None => Partition::new(
                    Arc::clone(&self.metadata),
                    &self.location,
                    interval,
                    i,
                    self.mode,
                    // Invisible to readers until a tx covers it.
                    (self.mode == AccessMode::ReadOnly).then_some(0),
                    None,
                ),
            };
            partition.set_partition_index(i);
            self.partitions.push(partition);
        }
        Ok(())
    }
}

pub struct JournalIterator<'a> {
    journal: &'a mut Journal,
    partition: usize,
    row: u64,
    limit: Option<u64>,
    failed: bool,
}

impl Iterator for JournalIterator<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            // The lag partition, when present, is iterated after the
            // regular partitions.
            let count = self.journal.partition_count();
            if self.partition > count {
                return None;
            }
            let in_lag = self.partition == count;

            let limit = match self.limit {
                Some(limit) => limit,
                None => {
                    let size = if in_lag {
                        self.journal.lag_size()
                    } else {
                        self.journal.partition_size(self.partition)
                    };
                    match size {
                        Ok(size) => {
                            self.limit = Some(size);
                            size
                        }
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
            };

            if self.row < limit {
                let global = if in_lag {
                    global_row_id(LAG_PARTITION_INDEX, self.row)
                } else {
                    global_row_id(self.partition, self.row)
                };
                self.row += 1;
                return match self.journal.read_record(global) {
                    Ok(record) => Some(Ok(record)),
                    Err(e) => {
                        self.failed = true;
                        Some(Err(e))
                    }
                };
            }

            self.partition += 1;
            self.row = 0;
            self.limit = None;
        }
    }
}

/// Forward row iterator that reuses one caller-owned record, avoiding an
/// allocation per row.
pub struct BufferedIterator<'a> {
    journal: &'a mut Journal,
    partition: usize,
    row: u64,
    limit: Option<u64>,
}

impl BufferedIterator<'_> {
    /// Reads the next row into `out`; false when the journal is exhausted.
    pub fn next_into(&mut self, out: &mut Record) -> Result<bool> {
        loop {
            let count = self.journal.partition_count();
            if self.partition > count {
                return Ok(false);
            }
            let in_lag = self.partition == count;

            let limit = match self.limit {
                Some(limit) => limit,
                None => {
                    let size = if in_lag {
                        self.journal.lag_size()?
                    } else {
                        self.journal.partition_size(self.partition)?
                    };
                    self.limit = Some(size);
                    size
                }
            };

            if self.row < limit {
                let global = if in_lag {
                    global_row_id(LAG_PARTITION_INDEX, self.row)
                } else {
                    global_row_id(self.partition, self.row)
                };
                self.row += 1;
                self.journal.read_into(global, out)?;
                return Ok(true);
            }

            self.partition += 1;
            self.row = 0;
            self.limit = None;
        }
    }
}
