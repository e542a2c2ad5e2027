//! Subjects: one pending write per database row.
//!
//! A [`SubjectSet`] is created fresh for every save/remove call and dropped
//! when the call finishes. Subjects are addressed by [`SubjectId`] and indexed
//! both by graph identity (before a key exists) and by [`IdentityKey`], so a
//! row reached through several paths maps to exactly one subject.

use persistgraph_core::{
    EntityId, EntityMetadata, Identifier, IdentityKey, Row, Snapshot, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index of a subject within its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(usize);

impl SubjectId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// The write a subject will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Remove,
    NoOp,
}

/// The new value of a changed column.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    /// A concrete value.
    Value(Value),
    /// The referenced subject's key column, known once it is written.
    Reference { subject: SubjectId, column: String },
}

impl ChangeValue {
    /// The referenced subject, if any.
    pub fn referenced(&self) -> Option<SubjectId> {
        match self {
            ChangeValue::Value(_) => None,
            ChangeValue::Reference { subject, .. } => Some(*subject),
        }
    }
}

/// One column-level delta.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChange {
    pub column: String,
    /// Value in the snapshot, `None` for inserts.
    pub old: Option<Value>,
    pub new: ChangeValue,
    /// Relation whose join column this is.
    pub relation: Option<String>,
}

/// An edge discovered while walking the graph: `relation` of this subject
/// points at `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationUpdate {
    pub relation: String,
    pub target: SubjectId,
}

/// A collection on `owner` claims this subject; fills this subject's owning
/// `relation` when the subject does not set it itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InverseAssignment {
    pub relation: String,
    pub owner: SubjectId,
}

/// The unit of work for one row of one entity.
#[derive(Debug, Clone)]
pub struct Subject {
    id: SubjectId,
    metadata: Arc<EntityMetadata>,
    entity: Option<EntityId>,
    pub snapshot: Option<Snapshot>,
    pub identifier: Option<Identifier>,
    pub kind: OperationKind,
    pub change_set: Vec<ColumnChange>,
    pub relation_updates: Vec<RelationUpdate>,
    pub inverse_assignments: Vec<InverseAssignment>,
    pub inserted_values: Row,
    /// Column values written for this row during the call.
    pub written: Row,
    /// Set once the row-level write has run.
    pub executed: bool,
    pub can_be_inserted: bool,
    pub can_be_updated: bool,
    pub must_be_removed: bool,
    /// Required relations without a resolvable target.
    pub unresolved: Vec<String>,
}

impl Subject {
    fn new(id: SubjectId, metadata: Arc<EntityMetadata>, entity: Option<EntityId>) -> Self {
        Self {
            id,
            metadata,
            entity,
            snapshot: None,
            identifier: None,
            kind: OperationKind::NoOp,
            change_set: Vec::new(),
            relation_updates: Vec::new(),
            inverse_assignments: Vec::new(),
            inserted_values: Row::new(),
            written: Row::new(),
            executed: false,
            can_be_inserted: false,
            can_be_updated: false,
            must_be_removed: false,
            unresolved: Vec::new(),
        }
    }

    pub fn id(&self) -> SubjectId {
        self.id
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    /// The graph entity, or `None` for removals by identifier.
    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn entity_name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether this subject issues a row-level write.
    pub fn is_write(&self) -> bool {
        self.kind != OperationKind::NoOp
    }

    /// Whether other writes may use this row's key: it already exists or
    /// has been inserted.
    pub fn is_available(&self) -> bool {
        (self.kind != OperationKind::Insert || self.executed)
            && self.identifier.as_ref().is_some_and(Identifier::is_complete)
    }

    /// Whether the collections of this subject are diffed in this call.
    pub fn tracks_collections(&self) -> bool {
        match self.kind {
            OperationKind::Insert | OperationKind::Update | OperationKind::Remove => true,
            OperationKind::NoOp => {
                self.can_be_updated && self.snapshot.is_some() && !self.must_be_removed
            }
        }
    }

    /// Identity key, once the identifier is known.
    pub fn identity(&self) -> Option<IdentityKey> {
        self.identifier
            .as_ref()
            .filter(|id| id.is_complete())
            .map(|id| IdentityKey::new(self.metadata.name.clone(), id))
    }

    /// Record a discovered relation edge, ignoring duplicates.
    pub fn link(&mut self, relation: &str, target: SubjectId) {
        if !self
            .relation_updates
            .iter()
            .any(|u| u.relation == relation && u.target == target)
        {
            self.relation_updates.push(RelationUpdate {
                relation: relation.to_string(),
                target,
            });
        }
    }

    /// Targets linked through `relation`.
    pub fn linked(&self, relation: &str) -> impl Iterator<Item = SubjectId> + '_ {
        let relation = relation.to_string();
        self.relation_updates
            .iter()
            .filter(move |u| u.relation == relation)
            .map(|u| u.target)
    }

    /// Record that `owner`'s collection claims this subject.
    pub fn assign_inverse(&mut self, relation: &str, owner: SubjectId) {
        let assignment = InverseAssignment {
            relation: relation.to_string(),
            owner,
        };
        if !self.inverse_assignments.contains(&assignment) {
            self.inverse_assignments.push(assignment);
        }
    }

    /// Snapshot value of a column.
    pub fn old_value(&self, column: &str) -> Option<&Value> {
        self.snapshot.as_ref().and_then(|s| s.value(column))
    }
}

/// All subjects of one call.
#[derive(Debug, Default)]
pub struct SubjectSet {
    subjects: Vec<Subject>,
    by_entity: HashMap<EntityId, SubjectId>,
    by_identity: HashMap<IdentityKey, SubjectId>,
}

impl SubjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subject for a graph entity (or an entity-less removal) and
    /// index it. Returns the new id.
    pub fn add(
        &mut self,
        metadata: Arc<EntityMetadata>,
        entity: Option<EntityId>,
        identifier: Option<Identifier>,
    ) -> SubjectId {
        let id = SubjectId(self.subjects.len());
        let mut subject = Subject::new(id, metadata, entity);
        subject.identifier = identifier;
        if let Some(entity) = entity {
            self.by_entity.insert(entity, id);
        }
        if let Some(key) = subject.identity() {
            self.by_identity.entry(key).or_insert(id);
        }
        self.subjects.push(subject);
        id
    }

    /// Map another graph entity onto an existing subject.
    pub fn alias(&mut self, entity: EntityId, subject: SubjectId) {
        self.by_entity.insert(entity, subject);
    }

    /// Re-index a subject after its identifier changed.
    pub fn register_identity(&mut self, id: SubjectId) {
        if let Some(key) = self.get(id).and_then(Subject::identity) {
            self.by_identity.entry(key).or_insert(id);
        }
    }

    pub fn get(&self, id: SubjectId) -> Option<&Subject> {
        self.subjects.get(id.0)
    }

    pub fn get_mut(&mut self, id: SubjectId) -> Option<&mut Subject> {
        self.subjects.get_mut(id.0)
    }

    pub fn by_entity(&self, entity: EntityId) -> Option<SubjectId> {
        self.by_entity.get(&entity).copied()
    }

    pub fn by_identity(&self, key: &IdentityKey) -> Option<SubjectId> {
        self.by_identity.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subject> {
        self.subjects.iter_mut()
    }

    /// All ids in creation order.
    pub fn ids(&self) -> impl Iterator<Item = SubjectId> + use<> {
        (0..self.subjects.len()).map(SubjectId)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Count subjects of one kind.
    pub fn count(&self, kind: OperationKind) -> usize {
        self.subjects.iter().filter(|s| s.kind == kind).count()
    }
}
