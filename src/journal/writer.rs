//! The single journal writer: append, commit, rollback, recovery.
//!
//! One writer exists per journal, enforced across processes by an exclusive
//! lock on `lock.lock` in the journal directory. The commit protocol:
//!
//! 1. Append column and index data (during `append` calls).
//! 2. Flush every open partition's columns (first to last), every symbol
//!    table and every index.
//! 3. Snapshot each index's tx address and each symbol table's size.
//! 4. Append the transaction record and fsync the log.
//!
//! Readers poll the log tail; nothing they observe precedes step 4.
//!
//! On open the writer recovers to the last good transaction: the corrupt
//! log tail is dropped, partitions created after the covered one are
//! deleted, the covered partition's columns and indexes are truncated to
//! the published row count, and symbol tables shrink to their published
//! sizes. A journal with no transaction record recovers to empty.

use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use crc::{Crc, CRC_64_ECMA_182};

use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::interval::{Interval, PartitionType, LAG_SUFFIX};
use crate::journal::Journal;
use crate::mapped::AccessMode;
use crate::meta::JournalMetadata;
use crate::partition::{now_millis, Partition};
use crate::record::RecordCodec;
use crate::tx::{global_row_id, Tx, LAG_PARTITION_INDEX};

const KEY_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub struct JournalWriter {
    journal: Journal,
    _lock: FileLock,
    /// Number the next transaction record will carry.
    tx_number: u64,
    /// Timestamp of the last appended row; appends may not precede it.
    max_timestamp: i64,
    degraded: bool,
}

impl JournalWriter {
    /// Opens (creating if absent) the journal at `<base>/<name>/` for
    /// writing and recovers it to its last good transaction.
    pub fn open(base: impl AsRef<Path>, metadata: JournalMetadata) -> Result<Self> {
        let location = base.as_ref().join(&metadata.name);
        fs::create_dir_all(&location)?;
        let lock = FileLock::acquire(&location, &metadata.name)?;

        let journal = Journal::open_with_mode(base.as_ref(), metadata, AccessMode::ReadWrite)?;
        let mut writer = Self {
            journal,
            _lock: lock,
            tx_number: 1,
            max_timestamp: i64::MIN,
            degraded: false,
        };
        writer.recover()?;
        tracing::info!(
            journal = %writer.journal.metadata.name,
            partitions = writer.journal.partition_count(),
            "journal writer opened"
        );
        Ok(writer)
    }

    pub fn journal(&mut self) -> &mut Journal {
        &mut self.journal
    }

    /// Locates or lazily creates the partition owning `timestamp`, sealing
    /// the previous one on a roll.
    pub fn partition_for_timestamp(&mut self, timestamp: i64) -> Result<&mut Partition> {
        let index = self.partition_for(Some(timestamp))?;
        Ok(&mut self.journal.partitions[index])
    }

    /// Appends one record. The record's timestamp (when the schema has one)
    /// selects or lazily creates the owning partition. A timestamp older
    /// than the last appended one is rejected unless it falls within the
    /// journal's lag window, in which case the row is staged in the lag
    /// partition. Returns the global row id.
    ///
    /// A failure inside column writes rolls the journal back to the last
    /// commit before the error is returned.
    pub fn append<C: RecordCodec>(&mut self, record: &C) -> Result<u64> {
        if self.degraded {
            return Err(Error::Degraded);
        }

        let timestamp = match self.journal.metadata.timestamp_column {
            Some(column) => Some(record.get(column).as_millis()?),
            None => None,
        };
        if let Some(ts) = timestamp {
            if ts < self.max_timestamp {
                return self.append_lag(record, ts);
            }
        }

        let partition_index = self.partition_for(timestamp)?;
        let journal = &mut self.journal;
        match journal.partitions[partition_index].append(record, &mut journal.symbols) {
            Ok(local_row_id) => {
                if let Some(ts) = timestamp {
                    self.max_timestamp = ts;
                }
                Ok(global_row_id(partition_index, local_row_id))
            }
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    /// Stages a late record in the lag partition, provided it falls within
    /// `lag_hours` of the newest appended timestamp.
    fn append_lag<C: RecordCodec>(&mut self, record: &C, timestamp: i64) -> Result<u64> {
        let lag_millis = self.journal.metadata.lag_hours as i64 * 3_600_000;
        if lag_millis == 0 || timestamp < self.max_timestamp - lag_millis {
            return Err(Error::TimestampOutOfOrder {
                timestamp,
                max: self.max_timestamp,
            });
        }

        self.open_lag()?;
        let journal = &mut self.journal;
        match journal
            .lag
            .as_mut()
            .unwrap()
            .append(record, &mut journal.symbols)
        {
            Ok(local_row_id) => Ok(global_row_id(LAG_PARTITION_INDEX, local_row_id)),
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    fn open_lag(&mut self) -> Result<()> {
        if self.journal.lag.is_some() {
            return Ok(());
        }
        // A late timestamp implies at least one appended row, so the
        // active partition exists and names the lag directory.
        let active = self
            .journal
            .partitions
            .last()
            .ok_or_else(|| Error::Config("cannot stage late rows in an empty journal".to_string()))?;
        let interval = active.interval();
        let name = interval.lag_dir_name(self.journal.metadata.partition_type);

        let mut partition = Partition::new_at_dir(
            Arc::clone(&self.journal.metadata),
            self.journal.location.join(&name),
            interval,
            LAG_PARTITION_INDEX,
            AccessMode::ReadWrite,
            None,
            None,
        );
        partition.open()?;
        tracing::info!(partition = %partition.name(), "lag partition created");
        self.journal.lag = Some(partition);
        Ok(())
    }

    /// Publishes everything appended since the last commit.
    pub fn commit(&mut self) -> Result<()> {
        if self.degraded {
            return Err(Error::Degraded);
        }
        match self.commit_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.degraded = true;
                tracing::error!(error = %e, "commit failed; journal degraded");
                Err(e)
            }
        }
    }

    /// Discards everything appended since the last commit: truncates the
    /// active partition's columns and indexes, deletes partitions created
    /// after it and shrinks symbol tables to their committed sizes.
    pub fn rollback(&mut self) -> Result<()> {
        let tx = self.journal.tx_log_mut()?.latest().cloned();
        self.restore(tx)
    }

    /// Fsyncs every open partition and symbol table.
    pub fn force(&mut self) -> Result<()> {
        for partition in self.journal.partitions.iter_mut().chain(self.journal.lag.as_mut()) {
            if partition.is_open() {
                partition.force()?;
            }
        }
        for table in self.journal.symbols.iter_mut().flatten() {
            table.force()?;
        }
        Ok(())
    }

    /// Drops unused mapping tails on every open partition and symbol table.
    pub fn compact(&mut self) -> Result<()> {
        for partition in self.journal.partitions.iter_mut().chain(self.journal.lag.as_mut()) {
            if partition.is_open() {
                partition.compact()?;
            }
        }
        for table in self.journal.symbols.iter_mut().flatten() {
            table.compact()?;
        }
        Ok(())
    }

    /// Removes every row and symbol from the journal and publishes the
    /// empty state. The only operation that shrinks symbol tables.
    pub fn truncate(&mut self) -> Result<()> {
        if self.degraded {
            return Err(Error::Degraded);
        }
        self.delete_all_partitions()?;
        for table in self.journal.symbols.iter_mut().flatten() {
            table.truncate(0)?;
        }
        self.max_timestamp = i64::MIN;
        self.commit()?;
        tracing::info!(journal = %self.journal.metadata.name, "journal truncated");
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        for partition in self.journal.partitions.iter_mut() {
            if partition.is_open() {
                partition.commit_columns()?;
                partition.commit_indexes()?;
            }
        }
        let (lag_partition_name, lag_size) = match self.journal.lag.as_mut() {
            Some(lag) => {
                lag.commit_columns()?;
                lag.commit_indexes()?;
                (Some(lag.name()), lag.size()?)
            }
            None => (None, 0),
        };
        for table in self.journal.symbols.iter_mut().flatten() {
            table.commit()?;
        }

        let column_count = self.journal.metadata.column_count();
        let partition_type = self.journal.metadata.partition_type;
        let (journal_max_row_id, last_partition_ts, index_tx_addresses) =
            match self.journal.partitions.last_mut() {
                Some(partition) => {
                    let size = partition.size()?;
                    let addresses = partition.index_tx_addresses()?;
                    let ts = match partition_type {
                        PartitionType::None => 0,
                        _ => partition.interval().lo() as u64,
                    };
                    (global_row_id(partition.partition_index(), size), ts, addresses)
                }
                None => (0, 0, vec![0; column_count]),
            };

        let symbol_table_sizes = self
            .journal
            .symbols
            .iter()
            .map(|s| s.as_ref().map(|t| t.size()).unwrap_or(0))
            .collect();
        let key_hash = match self.journal.metadata.key_column {
            Some(column) => {
                KEY_HASH.checksum(self.journal.metadata.columns[column].name.as_bytes())
            }
            None => 0,
        };

        let tx = Tx {
            tx_number: self.tx_number,
            commit_millis: now_millis(),
            journal_max_row_id,
            last_partition_ts,
            lag_partition_name,
            lag_size,
            index_tx_addresses,
            symbol_table_sizes,
            key_hash,
        };
        self.journal.tx_log_mut()?.append(tx)?;
        self.tx_number += 1;
        Ok(())
    }

    /// The partition owning `timestamp`, created lazily. Rolling to a new
    /// partition seals the previous one: its columns are flushed and
    /// compacted so readers can evaluate exact sizes from the files.
    fn partition_for(&mut self, timestamp: Option<i64>) -> Result<usize> {
        let anchor = timestamp.unwrap_or(0);
        if let Some(last) = self.journal.partitions.last() {
            if last.interval().contains(anchor) {
                return Ok(self.journal.partitions.len() - 1);
            }
        }

        if let Some(previous) = self.journal.partitions.last_mut() {
            previous.open()?;
            previous.commit_columns()?;
            previous.commit_indexes()?;
            previous.compact()?;
            tracing::debug!(partition = %previous.name(), "partition sealed");
        }

        let interval = Interval::containing(anchor, self.journal.metadata.partition_type)?;
        let index = self.journal.partitions.len();
        let mut partition = Partition::new(
            Arc::clone(&self.journal.metadata),
            &self.journal.location,
            interval,
            index,
            AccessMode::ReadWrite,
            None,
            None,
        );
        partition.open()?;
        tracing::info!(partition = %partition.name(), "partition created");
        self.journal.partitions.push(partition);
        Ok(index)
    }

    fn recover(&mut self) -> Result<()> {
        self.journal.tx_log_mut()?.recover()?;
        let tx = self.journal.tx_log_mut()?.latest().cloned();
        self.restore(tx)
    }

    /// Brings on-disk state in line with `tx` (or with emptiness when the
    /// journal has no committed transaction).
    fn restore(&mut self, tx: Option<Tx>) -> Result<()> {
        let Some(tx) = tx else {
            self.delete_all_partitions()?;
            for table in self.journal.symbols.iter_mut().flatten() {
                table.truncate(0)?;
            }
            self.tx_number = 1;
            self.max_timestamp = i64::MIN;
            return Ok(());
        };

        if tx.journal_max_row_id == 0 {
            self.delete_all_partitions()?;
        } else {
            let active = tx.partition_index();
            let row_count = tx.partition_row_count();
            if self.journal.partitions.len() <= active {
                return Err(Error::TxCorruption(format!(
                    "transaction {} references partition {active} but only {} exist",
                    tx.tx_number,
                    self.journal.partition_count()
                )));
            }
            while self.journal.partitions.len() > active + 1 {
                let mut partition = self.journal.partitions.pop().unwrap();
                partition.close();
                tracing::warn!(partition = %partition.name(), "deleting uncommitted partition");
                fs::remove_dir_all(partition.dir())?;
            }
            self.journal.partitions[active].truncate(row_count)?;
            self.restore_lag(&tx)?;
        }

        for (i, slot) in self.journal.symbols.iter_mut().enumerate() {
            if let Some(table) = slot {
                table.truncate(tx.symbol_table_sizes.get(i).copied().unwrap_or(0))?;
            }
        }

        self.tx_number = tx.tx_number + 1;
        self.max_timestamp = self.last_committed_timestamp()?;
        Ok(())
    }

    fn delete_all_partitions(&mut self) -> Result<()> {
        for partition in self.journal.partitions.iter_mut() {
            partition.close();
        }
        for partition in self.journal.partitions.drain(..) {
            if partition.dir().exists() {
                tracing::warn!(partition = %partition.name(), "deleting uncommitted partition");
                fs::remove_dir_all(partition.dir())?;
            }
        }
        if let Some(mut lag) = self.journal.lag.take() {
            lag.close();
            if lag.dir().exists() {
                fs::remove_dir_all(lag.dir())?;
            }
        }
        self.delete_stray_lag_dirs(None)?;
        Ok(())
    }

    /// Brings the lag partition in line with the published name and row
    /// count; lag directories the transaction does not name are uncommitted
    /// leftovers and are removed.
    fn restore_lag(&mut self, tx: &Tx) -> Result<()> {
        match &tx.lag_partition_name {
            Some(name) => {
                if self.journal.lag.as_ref().map(|p| p.name() != *name).unwrap_or(true) {
                    if let Some(mut stale) = self.journal.lag.take() {
                        stale.close();
                    }
                    let stripped = name.strip_suffix(LAG_SUFFIX).unwrap_or(name);
                    let interval =
                        match Interval::parse(stripped, self.journal.metadata.partition_type) {
                            Some(interval) => interval,
                            None => Interval::containing(0, PartitionType::None)?,
                        };
                    self.journal.lag = Some(Partition::new_at_dir(
                        Arc::clone(&self.journal.metadata),
                        self.journal.location.join(name),
                        interval,
                        LAG_PARTITION_INDEX,
                        AccessMode::ReadWrite,
                        None,
                        None,
                    ));
                }
                self.journal.lag.as_mut().unwrap().truncate(tx.lag_size)?;
                self.delete_stray_lag_dirs(Some(name))?;
            }
            None => {
                if let Some(mut lag) = self.journal.lag.take() {
                    lag.close();
                    if lag.dir().exists() {
                        tracing::warn!(partition = %lag.name(), "deleting uncommitted lag partition");
                        fs::remove_dir_all(lag.dir())?;
                    }
                }
                self.delete_stray_lag_dirs(None)?;
            }
        }
        Ok(())
    }

    fn delete_stray_lag_dirs(&mut self, keep: Option<&str>) -> Result<()> {
        for entry in fs::read_dir(&self.journal.location)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(LAG_SUFFIX) || keep == Some(name.as_str()) {
                continue;
            }
            tracing::warn!(partition = %name, "deleting stray lag partition");
            fs::remove_dir_all(entry.path())?;
        }
        Ok(())
    }

    fn last_committed_timestamp(&mut self) -> Result<i64> {
        let Some(ts_column) = self.journal.metadata.timestamp_column else {
            return Ok(i64::MIN);
        };
        for i in (0..self.journal.partition_count()).rev() {
            let size = self.journal.partition_size(i)?;
            if size > 0 {
                let partition = self.journal.get_partition(i, true)?;
                return partition.get_long(size - 1, ts_column);
            }
        }
        Ok(i64::MIN)
    }
}

impl Deref for JournalWriter {
    type Target = Journal;

    fn deref(&self) -> &Journal {
        &self.journal
    }
}

impl DerefMut for JournalWriter {
    fn deref_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }
}
