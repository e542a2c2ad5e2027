//! In-memory object graph.
//!
//! Entities live in an arena ([`EntityGraph`]) and refer to each other by
//! [`EntityId`], so cyclic graphs need no shared ownership. The persistence
//! engine reads the graph to plan writes and writes generated values and
//! refreshed snapshots back into it.

use crate::deferred::Deferred;
use crate::identifier::Identifier;
use crate::metadata::EntityMetadata;
use crate::row::Row;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Graph identity of an entity (its index in the arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) usize);

impl EntityId {
    /// Get the arena index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One endpoint of a relation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationTarget {
    /// An object in the same graph.
    Entity(EntityId),
    /// A row known only by its primary key.
    Identifier(Identifier),
}

impl From<EntityId> for RelationTarget {
    fn from(id: EntityId) -> Self {
        RelationTarget::Entity(id)
    }
}

impl From<Identifier> for RelationTarget {
    fn from(id: Identifier) -> Self {
        RelationTarget::Identifier(id)
    }
}

/// The value held in a relation slot.
///
/// A relation that is absent from the entity is *unset* and never produces
/// changes; `Null` explicitly clears it.
#[derive(Debug, Clone)]
pub enum RelationValue {
    Null,
    One(RelationTarget),
    Many(Vec<RelationTarget>),
    /// Lazy handle that has not been materialized into the graph.
    Deferred(Deferred),
}

impl RelationValue {
    /// A to-one relation pointing at a graph entity.
    pub fn one(target: impl Into<RelationTarget>) -> Self {
        RelationValue::One(target.into())
    }

    /// A collection of graph entities.
    pub fn many(targets: impl IntoIterator<Item = EntityId>) -> Self {
        RelationValue::Many(targets.into_iter().map(RelationTarget::Entity).collect())
    }

    /// Concrete targets held by this value. Deferred handles yield nothing.
    pub fn targets(&self) -> Vec<&RelationTarget> {
        match self {
            RelationValue::Null | RelationValue::Deferred(_) => Vec::new(),
            RelationValue::One(target) => vec![target],
            RelationValue::Many(targets) => targets.iter().collect(),
        }
    }
}

/// Values last read from (or written to) the database for one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Column values keyed by column name, in database representation.
    values: Row,
    /// Previously known related identifiers for collection relations.
    relations: BTreeMap<String, Vec<Identifier>>,
}

impl Snapshot {
    pub fn new(values: Row) -> Self {
        Self {
            values,
            relations: BTreeMap::new(),
        }
    }

    /// Record the related identifiers of a collection relation (builder pattern).
    #[must_use]
    pub fn with_relation(mut self, relation: impl Into<String>, ids: Vec<Identifier>) -> Self {
        self.relations.insert(relation.into(), ids);
        self
    }

    pub fn values(&self) -> &Row {
        &self.values
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Previously known related identifiers, if recorded.
    pub fn relation(&self, relation: &str) -> Option<&[Identifier]> {
        self.relations.get(relation).map(Vec::as_slice)
    }

    pub fn set_relation(&mut self, relation: impl Into<String>, ids: Vec<Identifier>) {
        self.relations.insert(relation.into(), ids);
    }
}

/// One domain object.
#[derive(Debug, Clone)]
pub struct Entity {
    entity_type: String,
    values: Row,
    relations: BTreeMap<String, RelationValue>,
    snapshot: Option<Snapshot>,
}

impl Entity {
    /// Create a new (unsaved) entity of the given type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: Row::new(),
            relations: BTreeMap::new(),
            snapshot: None,
        }
    }

    /// Materialize an entity from a database row.
    ///
    /// Property values pass through each column's transformer and the row
    /// itself becomes the snapshot.
    pub fn from_row(metadata: &EntityMetadata, row: Row) -> Self {
        let mut values = Row::new();
        for column in &metadata.columns {
            if let Some(value) = row.get(&column.column) {
                values.set(column.property.clone(), column.from_database(value));
            }
        }
        Self {
            entity_type: metadata.name.clone(),
            values,
            relations: BTreeMap::new(),
            snapshot: Some(Snapshot::new(row)),
        }
    }

    /// Set a property value (builder pattern).
    #[must_use]
    pub fn with_value(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.set(property, value);
        self
    }

    /// Set a relation slot (builder pattern).
    #[must_use]
    pub fn with_relation(mut self, relation: impl Into<String>, value: RelationValue) -> Self {
        self.relations.insert(relation.into(), value);
        self
    }

    /// Attach a snapshot (builder pattern).
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn values(&self) -> &Row {
        &self.values
    }

    pub fn value(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn set_value(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.values.set(property, value);
    }

    /// Get a relation slot; `None` means unset.
    pub fn relation(&self, relation: &str) -> Option<&RelationValue> {
        self.relations.get(relation)
    }

    pub fn set_relation(&mut self, relation: impl Into<String>, value: RelationValue) {
        self.relations.insert(relation.into(), value);
    }

    /// Unset a relation slot.
    pub fn clear_relation(&mut self, relation: &str) -> Option<RelationValue> {
        self.relations.remove(relation)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn set_snapshot(&mut self, snapshot: Option<Snapshot>) {
        self.snapshot = snapshot;
    }
}

/// Arena of entities addressed by [`EntityId`].
#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    entities: Vec<Entity>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity and return its id.
    pub fn add(&mut self, entity: Entity) -> EntityId {
        self.entities.push(entity);
        EntityId(self.entities.len() - 1)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id.0)
    }

    /// Number of entities in the graph.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        (0..self.entities.len()).map(EntityId)
    }

    /// Get a property value of an entity.
    pub fn value(&self, id: EntityId, property: &str) -> Option<&Value> {
        self.get(id).and_then(|e| e.value(property))
    }

    /// Capture the current state of `ids` so a failed operation can undo
    /// every change it made to them.
    pub fn checkpoint(&self, ids: impl IntoIterator<Item = EntityId>) -> GraphCheckpoint {
        let saved = ids
            .into_iter()
            .filter_map(|id| self.get(id).map(|e| (id, e.clone())))
            .collect();
        GraphCheckpoint {
            saved,
            len: self.entities.len(),
        }
    }

    /// Restore a checkpoint, discarding entities added after it was taken.
    pub fn restore(&mut self, checkpoint: GraphCheckpoint) {
        self.entities.truncate(checkpoint.len);
        for (id, entity) in checkpoint.saved {
            if let Some(slot) = self.entities.get_mut(id.0) {
                *slot = entity;
            }
        }
    }
}

/// Saved entity states, see [`EntityGraph::checkpoint`].
#[derive(Debug, Clone)]
pub struct GraphCheckpoint {
    saved: Vec<(EntityId, Entity)>,
    len: usize,
}

impl GraphCheckpoint {
    /// Number of entities captured.
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ColumnMetadata;

    #[test]
    fn relation_targets() {
        let mut graph = EntityGraph::new();
        let a = graph.add(Entity::new("Tag"));
        let b = graph.add(Entity::new("Tag"));
        let many = RelationValue::many([a, b]);
        assert_eq!(many.targets().len(), 2);
        assert!(RelationValue::Null.targets().is_empty());
        assert_eq!(
            RelationValue::one(a).targets(),
            vec![&RelationTarget::Entity(a)]
        );
    }

    #[test]
    fn from_row_sets_snapshot() {
        let meta = EntityMetadata::new("Author", "authors")
            .column(ColumnMetadata::new("id").primary_key())
            .column(ColumnMetadata::new("name").column_name("full_name"));
        let row = Row::new().with("id", 4_i64).with("full_name", "Umed");
        let entity = Entity::from_row(&meta, row.clone());
        assert_eq!(entity.value("name"), Some(&Value::Text("Umed".into())));
        assert_eq!(entity.snapshot().map(Snapshot::values), Some(&row));
    }

    #[test]
    fn checkpoint_restores_state() {
        let mut graph = EntityGraph::new();
        let id = graph.add(Entity::new("Post").with_value("title", "hello"));
        let checkpoint = graph.checkpoint([id]);
        assert_eq!(checkpoint.len(), 1);

        graph.get_mut(id).unwrap().set_value("id", 9_i64);
        graph.add(Entity::new("Post"));
        graph.restore(checkpoint);

        assert_eq!(graph.len(), 1);
        assert!(graph.value(id, "id").is_none());
        assert_eq!(graph.value(id, "title"), Some(&Value::Text("hello".into())));
    }
}
