//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed column value.
///
/// Entity properties, snapshot rows, identifiers and the values handed to
/// the SQL execution interface are all expressed with this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Uuid(u) => Some(u),
            _ => None,
        }
    }

    /// The form used to compare primary-key values: integers widen to
    /// `BigInt`, everything else is kept.
    pub fn key_form(&self) -> Value {
        match self {
            Value::Int(i) => Value::BigInt(i64::from(*i)),
            other => other.clone(),
        }
    }

    /// Feed this value into a hasher.
    ///
    /// Each variant contributes a distinct tag so `Int(1)` and `BigInt(1)`
    /// hash differently; floats hash by bit pattern.
    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Int(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::BigInt(i) => {
                3u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Double(f) => {
                4u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                6u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                7u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Timestamp(ts) => {
                8u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                9u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                10u8.hash(hasher);
                j.to_string().hash(hasher);
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
