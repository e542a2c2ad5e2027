//! Ordered name/value rows.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// An ordered set of named values.
///
/// Used for entity properties (keyed by property name), database rows and
/// snapshots (keyed by column name), and values returned by inserts.
/// Insertion order is preserved so generated statements are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    entries: Vec<(String, Value)>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a row from name/value pairs.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<Value>,
    {
        let mut row = Self::new();
        for (name, value) in pairs {
            row.set(name, value);
        }
        row
    }

    /// Add or replace a value (builder pattern).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get a value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Check if a name is present (even when its value is NULL).
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Set a value, replacing any existing entry with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Remove an entry, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Iterate over name/value pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Get all names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Copy every entry of `other` into this row, overwriting duplicates.
    pub fn merge(&mut self, other: &Row) {
        for (name, value) in other.iter() {
            self.set(name, value.clone());
        }
    }

    /// Consume the row, returning its pairs.
    pub fn into_pairs(self) -> Vec<(String, Value)> {
        self.entries
    }

    /// Borrow the underlying pairs.
    pub fn as_pairs(&self) -> &[(String, Value)] {
        &self.entries
    }
}

impl<N: Into<String>> FromIterator<(N, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (N, Value)>>(iter: T) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.set(name, value);
        }
        row
    }
}
