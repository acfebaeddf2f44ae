//! The transaction log and visibility protocol.
//!
//! A journal's `_tx` file is an append-only sequence of commit records. The
//! single writer appends a record after flushing column, symbol and index
//! state; readers poll the tail to learn the latest published sizes.
//!
//! # Record Format
//!
//! ```text
//! +-----------+----------+------------------+-----------+
//! |magic: u16 | size: u32| body             | crc32: u32|
//! +-----------+----------+------------------+-----------+
//! | 0xFACE    | body len | variable length  | IEEE, body|
//! +-----------+----------+------------------+-----------+
//! ```
//!
//! The body is versioned:
//!
//! ```text
//! format_version: u32
//! tx_number:      u64    monotonic
//! commit_millis:  u64
//! max_row_id:     u64    (partition_index << 44) | partition_row_count
//! last_partition_ts: u64 interval start of the active partition
//! lag_name:       u8 len + UTF-16BE units (0 = none)
//! lag_size:       u64    row count of the lag partition (0 = none)
//! index_addr[]:   u32 count, then u64 per column (0 for unindexed)
//! sym_size[]:     u32 count, then u64 per column (0 for non-symbol)
//! key_hash:       u64    (0 if no key column)
//! ```
//!
//! All integers are big-endian. A partial or CRC-corrupt tail is ignored by
//! readers; the previous good record remains the visible transaction. The
//! writer truncates the corrupt tail away on open.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::mapped::AccessMode;

/// Name of the transaction log file inside a journal directory.
pub const TX_FILE_NAME: &str = "_tx";

const TX_MAGIC: u16 = 0xFACE;
const TX_FORMAT_VERSION: u32 = 1;
/// Bits reserved for the local row id inside a global row id.
pub const ROW_ID_BITS: u32 = 44;
/// Partition index reserved for the lag partition in global row ids.
pub const LAG_PARTITION_INDEX: usize = (1 << (64 - ROW_ID_BITS)) - 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A single published commit.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Tx {
    pub tx_number: u64,
    pub commit_millis: u64,
    /// `(active_partition_index << ROW_ID_BITS) | active_partition_row_count`.
    pub journal_max_row_id: u64,
    /// Interval start of the active partition, epoch millis.
    pub last_partition_ts: u64,
    pub lag_partition_name: Option<String>,
    /// Row count of the lag partition; 0 when no lag partition exists.
    pub lag_size: u64,
    /// Per-column index tx addresses for the active partition; 0 for
    /// columns without an index.
    pub index_tx_addresses: Vec<u64>,
    /// Per-column symbol table sizes; 0 for non-symbol columns.
    pub symbol_table_sizes: Vec<u64>,
    pub key_hash: u64,
}

impl Tx {
    /// Index of the active partition.
    pub fn partition_index(&self) -> usize {
        (self.journal_max_row_id >> ROW_ID_BITS) as usize
    }

    /// Row count of the active partition.
    pub fn partition_row_count(&self) -> u64 {
        self.journal_max_row_id & ((1 << ROW_ID_BITS) - 1)
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(TX_FORMAT_VERSION).unwrap();
        buf.write_u64::<BigEndian>(self.tx_number).unwrap();
        buf.write_u64::<BigEndian>(self.commit_millis).unwrap();
        buf.write_u64::<BigEndian>(self.journal_max_row_id).unwrap();
        buf.write_u64::<BigEndian>(self.last_partition_ts).unwrap();

        match &self.lag_partition_name {
            None => buf.write_u8(0).unwrap(),
            Some(name) => {
                let units: Vec<u16> = name.encode_utf16().collect();
                buf.write_u8(units.len() as u8).unwrap();
                for unit in units {
                    buf.write_u16::<BigEndian>(unit).unwrap();
                }
            }
        }
        buf.write_u64::<BigEndian>(self.lag_size).unwrap();

        buf.write_u32::<BigEndian>(self.index_tx_addresses.len() as u32)
            .unwrap();
        for addr in &self.index_tx_addresses {
            buf.write_u64::<BigEndian>(*addr).unwrap();
        }

        buf.write_u32::<BigEndian>(self.symbol_table_sizes.len() as u32)
            .unwrap();
        for size in &self.symbol_table_sizes {
            buf.write_u64::<BigEndian>(*size).unwrap();
        }

        buf.write_u64::<BigEndian>(self.key_hash).unwrap();
        buf
    }

    pub fn decode_body(body: &[u8]) -> Result<Tx> {
        let mut cursor = Cursor::new(body);

        let version = cursor.read_u32::<BigEndian>()?;
        if version != TX_FORMAT_VERSION {
            return errcorrupt!("unsupported tx format version {version}");
        }

        let tx_number = cursor.read_u64::<BigEndian>()?;
        let commit_millis = cursor.read_u64::<BigEndian>()?;
        let journal_max_row_id = cursor.read_u64::<BigEndian>()?;
        let last_partition_ts = cursor.read_u64::<BigEndian>()?;

        let lag_len = cursor.read_u8()? as usize;
        let lag_partition_name = if lag_len == 0 {
            None
        } else {
            let mut units = Vec::with_capacity(lag_len);
            for _ in 0..lag_len {
                units.push(cursor.read_u16::<BigEndian>()?);
            }
            Some(String::from_utf16_lossy(&units))
        };
        let lag_size = cursor.read_u64::<BigEndian>()?;

        let index_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut index_tx_addresses = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            index_tx_addresses.push(cursor.read_u64::<BigEndian>()?);
        }

        let sym_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut symbol_table_sizes = Vec::with_capacity(sym_count);
        for _ in 0..sym_count {
            symbol_table_sizes.push(cursor.read_u64::<BigEndian>()?);
        }

        let key_hash = cursor.read_u64::<BigEndian>()?;

        Ok(Tx {
            tx_number,
            commit_millis,
            journal_max_row_id,
            last_partition_ts,
            lag_partition_name,
            lag_size,
            index_tx_addresses,
            symbol_table_sizes,
            key_hash,
        })
    }
}

/// Composes a global row id.
pub fn global_row_id(partition_index: usize, local_row_id: u64) -> u64 {
    ((partition_index as u64) << ROW_ID_BITS) | local_row_id
}

/// Splits a global row id into `(partition_index, local_row_id)`.
pub fn split_row_id(global: u64) -> (usize, u64) {
    (
        (global >> ROW_ID_BITS) as usize,
        global & ((1 << ROW_ID_BITS) - 1),
    )
}

pub struct TxLog {
    file: File,
    path: PathBuf,
    /// End offset of the last good record; the scan resumes here.
    read_offset: u64,
    latest: Option<Tx>,
}

impl TxLog {
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == AccessMode::ReadWrite {
            options.write(true).create(true);
        }
        let file = options
            .open(&path)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;

        let mut log = Self {
            file,
            path,
            read_offset: 0,
            latest: None,
        };
        log.refresh()?;
        Ok(log)
    }

    /// The latest published transaction, if any.
    pub fn latest(&self) -> Option<&Tx> {
        self.latest.as_ref()
    }

    /// Scans the tail for new records. A truncated or CRC-corrupt tail
    /// stops the scan; the previous good record remains visible. Returns
    /// true when a new record was observed.
    pub fn refresh(&mut self) -> Result<bool> {
        let file_len = self.file.metadata()?.len();
        let mut advanced = false;

        while self.read_offset + 6 <= file_len {
            self.file.seek(SeekFrom::Start(self.read_offset))?;
            let magic = self.file.read_u16::<BigEndian>()?;
            if magic != TX_MAGIC {
                break;
            }
            let size = self.file.read_u32::<BigEndian>()? as u64;
            if self.read_offset + 6 + size + 4 > file_len {
                break;
            }

            let mut body = vec![0u8; size as usize];
            self.file.read_exact(&mut body)?;
            let stored_crc = self.file.read_u32::<BigEndian>()?;
            if CRC32.checksum(&body) != stored_crc {
                break;
            }
            let Ok(tx) = Tx::decode_body(&body) else {
                break;
            };

            self.latest = Some(tx);
            self.read_offset += 6 + size + 4;
            advanced = true;
        }

        Ok(advanced)
    }

    /// Writer-side open: drops any partial or corrupt tail so subsequent
    /// appends extend the last good record.
    pub fn recover(&mut self) -> Result<()> {
        self.refresh()?;
        let file_len = self.file.metadata()?.len();
        if file_len > self.read_offset {
            tracing::warn!(
                path = %self.path.display(),
                dropped = file_len - self.read_offset,
                "dropping corrupt transaction log tail"
            );
            self.file.set_len(self.read_offset)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Appends a record and fsyncs the log. The record becomes the latest
    /// visible transaction.
    pub fn append(&mut self, tx: Tx) -> Result<()> {
        let body = tx.encode_body();
        let crc = CRC32.checksum(&body);

        let mut buf = Vec::with_capacity(body.len() + 10);
        buf.write_u16::<BigEndian>(TX_MAGIC).unwrap();
        buf.write_u32::<BigEndian>(body.len() as u32).unwrap();
        buf.extend_from_slice(&body);
        buf.write_u32::<BigEndian>(crc).unwrap();

        self.file.seek(SeekFrom::Start(self.read_offset))?;
        std::io::Write::write_all(&mut self.file, &buf)?;
        self.file.sync_all()?;

        self.read_offset += buf.len() as u64;
        self.latest = Some(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_tx(n: u64) -> Tx {
        Tx {
            tx_number: n,
            commit_millis: 1_500_000_000_000 + n,
            journal_max_row_id: global_row_id(1, 100 + n),
            last_partition_ts: 1420070400000,
            lag_partition_name: None,
            lag_size: 0,
            index_tx_addresses: vec![0, 7, 0],
            symbol_table_sizes: vec![2, 0, 0],
            key_hash: 0,
        }
    }

    #[test]
    fn test_body_roundtrip() -> Result<()> {
        let tx = Tx {
            lag_partition_name: Some("2015-01-01.lag".to_string()),
            lag_size: 7,
            ..sample_tx(9)
        };
        let decoded = Tx::decode_body(&tx.encode_body())?;
        assert_eq!(decoded, tx);
        Ok(())
    }

    #[test]
    fn test_row_id_split() {
        let id = global_row_id(3, 12345);
        assert_eq!(split_row_id(id), (3, 12345));
        assert_eq!(split_row_id(0), (0, 0));
    }

    #[test]
    fn test_append_and_refresh() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TX_FILE_NAME);

        let mut log = TxLog::open(&path, AccessMode::ReadWrite)?;
        assert!(log.latest().is_none());

        log.append(sample_tx(1))?;
        log.append(sample_tx(2))?;
        assert_eq!(log.latest().unwrap().tx_number, 2);

        // A second handle sees both records, then picks up a third on
        // refresh.
        let mut reader = TxLog::open(&path, AccessMode::ReadOnly)?;
        assert_eq!(reader.latest().unwrap().tx_number, 2);
        assert!(!reader.refresh()?);

        log.append(sample_tx(3))?;
        assert!(reader.refresh()?);
        assert_eq!(reader.latest().unwrap().tx_number, 3);
        Ok(())
    }

    #[test]
    fn test_partial_tail_is_ignored() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TX_FILE_NAME);

        {
            let mut log = TxLog::open(&path, AccessMode::ReadWrite)?;
            log.append(sample_tx(1))?;
        }

        // Simulate a crash mid-append: half a record past the good one.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFA, 0xCE, 0x00, 0x00, 0x01, 0x00, 0xAB])
                .unwrap();
        }

        let log = TxLog::open(&path, AccessMode::ReadOnly)?;
        assert_eq!(log.latest().unwrap().tx_number, 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_crc_is_ignored() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TX_FILE_NAME);

        {
            let mut log = TxLog::open(&path, AccessMode::ReadWrite)?;
            log.append(sample_tx(1))?;
            log.append(sample_tx(2))?;
        }

        // Flip a byte in the second record's body.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let len = file.metadata().unwrap().len();
            file.seek(SeekFrom::Start(len - 12)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let log = TxLog::open(&path, AccessMode::ReadOnly)?;
        assert_eq!(log.latest().unwrap().tx_number, 1);
        Ok(())
    }

    #[test]
    fn test_recover_truncates_corrupt_tail() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TX_FILE_NAME);

        {
            let mut log = TxLog::open(&path, AccessMode::ReadWrite)?;
            log.append(sample_tx(1))?;
        }
        let good_len = std::fs::metadata(&path).unwrap().len();

        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"garbage tail").unwrap();
        }

        let mut log = TxLog::open(&path, AccessMode::ReadWrite)?;
        log.recover()?;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // Appends continue from the recovered tail.
        log.append(sample_tx(2))?;
        let reader = TxLog::open(&path, AccessMode::ReadOnly)?;
        assert_eq!(reader.latest().unwrap().tx_number, 2);
        Ok(())
    }
}
