//! An embedded, append-optimized, columnar time-series storage engine.
//!
//! Records with a fixed schema of typed columns are stored in a directory
//! tree of time-range partitions, one memory-mapped file per column, with
//! inverted indexes for indexed columns and shared dictionary tables for
//! low-cardinality symbol columns. A single writer and any number of
//! readers cooperate through an append-only transaction log that publishes
//! monotonically advancing visible sizes.
//!
//! ```no_run
//! use tsjournal::interval::PartitionType;
//! use tsjournal::meta::{ColumnDef, ColumnType, JournalMetadata};
//! use tsjournal::record::{Record, Value};
//! use tsjournal::JournalWriter;
//!
//! # fn main() -> tsjournal::Result<()> {
//! let metadata = JournalMetadata::builder("quotes")
//!     .column(ColumnDef::new("sym", ColumnType::Sym).indexed())
//!     .column(ColumnDef::new("bid", ColumnType::Double))
//!     .timestamp("ts")
//!     .partition_by(PartitionType::Day)
//!     .build()?;
//!
//! let mut writer = JournalWriter::open("/var/lib/journals", metadata)?;
//! writer.append(&Record::with_values(vec![
//!     Value::Str("EURUSD".to_string()),
//!     Value::Double(1.1248),
//!     Value::Date(1420070400000),
//! ]))?;
//! writer.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod column;
pub mod error;
pub mod flock;
pub mod index;
pub mod interval;
pub mod journal;
pub mod mapped;
pub mod meta;
pub mod partition;
pub mod record;
pub mod symbol;
pub mod tx;

pub use error::{Error, Result};
pub use journal::{Journal, JournalWriter};
pub use mapped::AccessMode;
pub use record::{Record, RecordCodec, Value};
