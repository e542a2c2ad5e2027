//! Row identifiers and identity keys.

use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Primary-key value(s) of one row, keyed by database column name.
///
/// Composite keys carry one entry per primary column, in the order the
/// entity metadata declares them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    values: Vec<(String, Value)>,
}

impl Identifier {
    /// Create an identifier from column/value pairs.
    pub fn new<N: Into<String>>(values: impl IntoIterator<Item = (N, Value)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(column, value)| (column.into(), value))
                .collect(),
        }
    }

    /// Create a single-column identifier.
    pub fn single(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            values: vec![(column.into(), value.into())],
        }
    }

    /// Build an identifier by reading `columns` out of a row.
    ///
    /// Returns `None` when any column is missing or NULL.
    pub fn from_row<'a>(row: &Row, columns: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut values = Vec::new();
        for column in columns {
            let value = row.get(column)?;
            if value.is_null() {
                return None;
            }
            values.push((column.to_string(), value.clone()));
        }
        if values.is_empty() {
            return None;
        }
        Some(Self { values })
    }

    /// Get the value for one column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Column names in key order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(c, _)| c.as_str())
    }

    /// Column/value pairs in key order.
    pub fn pairs(&self) -> &[(String, Value)] {
        &self.values
    }

    /// Number of key columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the identifier has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// An identifier is complete when it has at least one column and no NULLs.
    pub fn is_complete(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|(_, v)| !v.is_null())
    }

    /// Hash of the key values (column names excluded).
    pub fn value_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (_, value) in &self.values {
            value.key_form().hash_into(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(c, v)| format!("{c}={v:?}"))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Identity of one database row: entity name plus its key values.
///
/// Two subjects with equal identity keys describe the same row and must be
/// merged rather than written twice. Integer widths are normalized, so a key
/// read as `Int(1)` matches one loaded as `BigInt(1)`.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    entity: String,
    values: Vec<Value>,
    key_hash: u64,
}

impl IdentityKey {
    /// Create the identity key for a row of `entity`.
    pub fn new(entity: impl Into<String>, identifier: &Identifier) -> Self {
        Self {
            entity: entity.into(),
            values: identifier.values.iter().map(|(_, v)| v.key_form()).collect(),
            key_hash: identifier.value_hash(),
        }
    }

    /// Get the entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Get the key hash.
    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_hash == other.key_hash
            && self.entity == other.entity
            && self.values == other.values
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.key_hash.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_row_requires_every_column() {
        let row = Row::new().with("a", 1_i64).with("b", Value::Null);
        assert!(Identifier::from_row(&row, ["a"]).is_some());
        assert!(Identifier::from_row(&row, ["a", "b"]).is_none());
        assert!(Identifier::from_row(&row, ["c"]).is_none());
    }

    #[test]
    fn identity_key_ignores_column_names() {
        let a = Identifier::single("id", 7_i64);
        let b = Identifier::single("post_id", 7_i64);
        assert_eq!(IdentityKey::new("Post", &a), IdentityKey::new("Post", &b));
        assert_ne!(IdentityKey::new("Post", &a), IdentityKey::new("Tag", &a));
    }

    #[test]
    fn composite_keys_hash_all_columns() {
        let a = Identifier::new([("x", Value::Int(1)), ("y", Value::Int(2))]);
        let b = Identifier::new([("x", Value::Int(1)), ("y", Value::Int(3))]);
        assert!(a.is_complete());
        assert_ne!(a.value_hash(), b.value_hash());
        assert!(!Identifier::single("x", Value::Null).is_complete());
    }

    #[test]
    fn integer_widths_share_an_identity() {
        let narrow = Identifier::single("id", Value::Int(1));
        let wide = Identifier::single("id", Value::BigInt(1));
        assert_eq!(IdentityKey::new("Tag", &narrow), IdentityKey::new("Tag", &wide));
        assert_ne!(
            IdentityKey::new("Tag", &narrow),
            IdentityKey::new("Tag", &Identifier::single("id", 2_i64))
        );

        let mut seen = std::collections::HashSet::new();
        seen.insert(IdentityKey::new("Tag", &narrow));
        assert!(seen.contains(&IdentityKey::new("Tag", &wide)));
    }
}
