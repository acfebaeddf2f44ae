//! Record values and the codec seam between records and columns.
//!
//! The column layer never inspects application objects. Appends and reads go
//! through [`RecordCodec`], which copies typed values between a record-shaped
//! container and the partition's columns one field at a time. [`Record`] is
//! the schema-driven implementation; callers with generated or hand-written
//! layouts can provide their own.

use crate::error::{Error, Result};

/// A single typed field value.
///
/// `Null` is legal for STRING, BINARY and SYMBOL columns; fixed-width columns
/// reject it on append.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Epoch milliseconds, UTC.
    Date(i64),
    Str(String),
    Bin(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The value as epoch milliseconds. Used on the append path to read the
    /// timestamp column, which may be declared as DATE or LONG.
    pub fn as_millis(&self) -> Result<i64> {
        match self {
            Value::Date(ts) | Value::Long(ts) => Ok(*ts),
            other => Err(Error::Config(format!(
                "expected a timestamp value, got {other:?}"
            ))),
        }
    }
}

/// Copies field values between a record object and the column layer.
///
/// `get` is called once per column on append; `set` once per column on read.
/// `is_mapped` lets sparse record layouts skip columns they do not carry,
/// mirroring how inactive columns are skipped journal-wide.
pub trait RecordCodec {
    fn get(&self, column: usize) -> Value;

    fn set(&mut self, column: usize, value: Value);

    fn is_mapped(&self, _column: usize) -> bool {
        true
    }
}

/// A plain ordered tuple of values, one per schema column.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    pub fn new(column_count: usize) -> Self {
        Self {
            values: vec![Value::Null; column_count],
        }
    }

    pub fn with_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn value(&self, column: usize) -> &Value {
        &self.values[column]
    }

    pub fn set_value(&mut self, column: usize, value: Value) {
        self.values[column] = value;
    }

    pub fn column_count(&self) -> usize {
        self.values.len()
    }
}

impl RecordCodec for Record {
    fn get(&self, column: usize) -> Value {
        self.values[column].clone()
    }

    fn set(&mut self, column: usize, value: Value) {
        self.values[column] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let mut r = Record::new(3);
        r.set(0, Value::Int(42));
        r.set(1, Value::Str("abc".to_string()));

        assert_eq!(r.get(0), Value::Int(42));
        assert_eq!(r.get(1), Value::Str("abc".to_string()));
        assert_eq!(r.get(2), Value::Null);
    }

    #[test]
    fn test_as_millis() {
        assert_eq!(Value::Date(1000).as_millis().unwrap(), 1000);
        assert_eq!(Value::Long(2000).as_millis().unwrap(), 2000);
        assert!(Value::Int(3).as_millis().is_err());
    }
}
