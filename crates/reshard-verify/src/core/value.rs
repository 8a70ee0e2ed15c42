//! Row, key and column value types.
//!
//! Values are fully owned: rows cross task boundaries and are handed to the
//! diff consumer, so there is nothing to borrow from.

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A single column value as read from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Signed integer of any width.
    Int(i64),

    /// Unsigned integer of any width.
    UInt(u64),

    /// Floating point (float and double).
    Float(f64),

    /// Character data. Decimals arrive as text to keep their exact digits.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// Date without time component.
    Date(NaiveDate),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Time of day or interval, in microseconds (may be negative).
    Time(i64),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

/// One component of a primary key.
///
/// Variants order by discriminant first, so a key column must hold a single
/// kind of value for range reads to agree with the backend's ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkValue {
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PkValue {
    /// Convert a column value into a key component.
    ///
    /// Returns `None` for values that cannot be part of an ordered key
    /// (NULL, floats, temporal values).
    pub fn from_sql_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Int(v) => Some(PkValue::Int(v)),
            SqlValue::UInt(v) => match i64::try_from(v) {
                Ok(v) => Some(PkValue::Int(v)),
                Err(_) => Some(PkValue::UInt(v)),
            },
            SqlValue::Text(v) => Some(PkValue::Text(v)),
            SqlValue::Bytes(v) => Some(PkValue::Bytes(v)),
            _ => None,
        }
    }
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(v) => write!(f, "{}", v),
            PkValue::UInt(v) => write!(f, "{}", v),
            PkValue::Text(v) => write!(f, "'{}'", v),
            PkValue::Bytes(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Composite primary key (supports single and multi-column PKs).
///
/// Ordering is lexicographic over the components, matching SQL row-value
/// comparison `(a, b) < (x, y)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub Vec<PkValue>);

impl Key {
    /// Create a new key from its components.
    pub fn new(values: Vec<PkValue>) -> Self {
        Self(values)
    }

    /// Get the components.
    pub fn values(&self) -> &[PkValue] {
        &self.0
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::new(vec![PkValue::Int(value)])
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::new(vec![PkValue::Text(value.to_string())])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// A row read from one backend: its key and its data columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: Key,
    pub data: Vec<SqlValue>,
}

impl Row {
    pub fn new(key: Key, data: Vec<SqlValue>) -> Self {
        Self { key, data }
    }

    /// Compare key order with another row.
    pub fn cmp_key(&self, other: &Row) -> Ordering {
        self.key.cmp(&other.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_ordering_is_lexicographic() {
        let a = Key::new(vec![PkValue::Int(1), PkValue::Text("b".into())]);
        let b = Key::new(vec![PkValue::Int(1), PkValue::Text("c".into())]);
        let c = Key::new(vec![PkValue::Int(2), PkValue::Text("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_unsigned_keys_normalize_to_int_when_in_range() {
        assert_eq!(
            PkValue::from_sql_value(SqlValue::UInt(42)),
            Some(PkValue::Int(42))
        );
        assert_eq!(
            PkValue::from_sql_value(SqlValue::UInt(u64::MAX)),
            Some(PkValue::UInt(u64::MAX))
        );
        assert_eq!(PkValue::from_sql_value(SqlValue::Null), None);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::from(7).to_string(), "7");
        let k = Key::new(vec![PkValue::Int(1), PkValue::Bytes(vec![0xab, 0x01])]);
        assert_eq!(k.to_string(), "(1, 0xab01)");
    }
}
