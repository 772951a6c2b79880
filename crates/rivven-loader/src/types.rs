//! Value types for rivven-loader
//!
//! Row values arrive already flattened and type-coerced by the upstream
//! pipeline. The engine only needs to bind them, render them as literals for
//! HTTP-based destinations, and build string keys from them for
//! deduplication.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A flat event row: column name to value
pub type EventRow = HashMap<String, Value>;

/// SQL value type that can hold any event value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT)
    String(String),
    /// Binary data (BYTEA, BLOB)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value (objects and arrays that were not flattened)
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float64(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Decimal(d) => d.trunc().to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// String form used for composite keys and text binding.
///
/// Mirrors what a loosely typed event value looks like when printed: numbers
/// without decoration, timestamps in RFC 3339, JSON compact.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "<nil>"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int16(n) => write!(f, "{n}"),
            Self::Int32(n) => write!(f, "{n}"),
            Self::Int64(n) => write!(f, "{n}"),
            Self::Float64(n) => write!(f, "{n}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::DateTimeTz(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

/// JSON scalars become their native variants; objects and arrays stay JSON.
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int64(i),
                None => n.as_f64().map(Self::Float64).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// Logical column types produced by upstream type inference.
///
/// Each dialect maps these to its own SQL spelling via
/// [`TypeMapping`](crate::dialect::TypeMapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Boolean
    Bool,
    /// 64-bit integer
    Int64,
    /// Double precision float
    Float64,
    /// Free text
    String,
    /// Timestamp with time zone
    Timestamp,
    /// Nested JSON document
    Json,
    /// Could not be inferred; stored as text
    Unknown,
}

/// A row returned by a query
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by index
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Get a column as text, treating NULL as absent
    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.get_by_name(name)? {
            Value::Null => None,
            v => Some(v.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Int64(42).to_string(), "42");
        assert_eq!(Value::from("abc").to_string(), "abc");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Null.to_string(), "<nil>");
        assert_eq!(Value::Float64(1.5).to_string(), "1.5");
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "dead");
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from(serde_json::json!(1)), Value::Int64(1));
        assert_eq!(Value::from(serde_json::json!(1.25)), Value::Float64(1.25));
        assert_eq!(Value::from(serde_json::json!("x")), Value::from("x"));
        assert_eq!(Value::from(serde_json::json!(null)), Value::Null);
        assert!(matches!(
            Value::from(serde_json::json!([1, 2])),
            Value::Json(_)
        ));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("12").as_i64(), Some(12));
        assert_eq!(Value::Float64(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float64(3.5).as_i64(), None);
        assert_eq!(Value::from("yes").as_bool(), Some(true));
        assert_eq!(Value::Int32(0).as_bool(), Some(false));
        assert!(Value::from(None::<i64>).is_null());
    }

    #[test]
    fn test_row_get_by_name() {
        let row = Row::new(
            vec!["COLUMN_NAME".into(), "data_type".into()],
            vec![Value::from("id"), Value::Null],
        );
        assert_eq!(row.get_string("column_name"), Some("id".to_string()));
        assert_eq!(row.get_string("data_type"), None);
        assert_eq!(row.len(), 2);
    }
}
