use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Engine errors.
///
/// Errors raised while a record is being appended roll the partition back to
/// the last commit. Errors raised during `commit` leave the writer degraded:
/// no further writes are accepted until the journal is reopened. Reader
/// errors are per-call and never mutate shared state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid schema or journal configuration. Fatal at open.
    Config(String),
    /// An underlying read, write or sync failure.
    Io(String),
    /// A mapping window could not be established.
    Mapping { path: String, offset: u64, len: u64 },
    /// An index was addressed with a key outside its key space.
    IndexKeyOutOfRange { key: i32, key_space: usize },
    /// A transaction record failed CRC validation or was truncated.
    TxCorruption(String),
    /// An appended timestamp precedes the last one seen by the writer.
    TimestampOutOfOrder { timestamp: i64, max: i64 },
    /// An operation was attempted on a closed partition.
    ClosedPartition(String),
    /// A second writer tried to acquire the journal lock. Fatal at open.
    ConcurrentWriter(String),
    /// A prior commit failure left the writer unusable.
    Degraded,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Mapping { path, offset, len } => {
                write!(f, "cannot map {path} at offset {offset}, length {len}")
            }
            Error::IndexKeyOutOfRange { key, key_space } => {
                write!(f, "index key {key} outside key space {key_space}")
            }
            Error::TxCorruption(msg) => write!(f, "transaction log corruption: {msg}"),
            Error::TimestampOutOfOrder { timestamp, max } => {
                write!(f, "timestamp {timestamp} is older than {max}")
            }
            Error::ClosedPartition(msg) => write!(f, "partition is closed: {msg}"),
            Error::ConcurrentWriter(path) => {
                write!(f, "another writer holds the lock on {path}")
            }
            Error::Degraded => write!(f, "journal is degraded, reopen to resume writing"),
        }
    }
}

/// Constructs an Error::Config for the given format string.
#[macro_export]
macro_rules! errcfg {
    ($($args:tt)*) => { $crate::error::Error::Config(format!($($args)*)).into() };
}

/// Constructs an Error::TxCorruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::TxCorruption(format!($($args)*)).into() };
}

/// An engine Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Config(err.to_string())
    }
}
