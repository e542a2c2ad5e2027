//! Column-level change computation.

use crate::subject::{ChangeValue, ColumnChange, OperationKind, Subject, SubjectId, SubjectSet};
use persistgraph_core::{
    DiffStrategy, Entity, EntityGraph, Generation, Identifier, MetadataProvider, PersistError,
    RelationMetadata, RelationTarget, RelationValue, Result, Value,
};
use std::collections::HashSet;

/// Where an owning relation points, after inverse assignments are applied.
enum Target<'g> {
    Unset,
    Null,
    Entity(persistgraph_core::EntityId),
    Subject(SubjectId),
    Identifier(&'g Identifier),
    Owned(Identifier),
}

/// The join-column outcome of one owning relation.
enum Decision {
    /// The relation is untouched; its columns produce no change.
    Unset,
    /// The target cannot be referenced yet and the relation is nullable.
    Omit,
    /// A required relation has no resolvable target.
    Unresolved,
    /// Join columns with their new values.
    Columns(Vec<(String, ChangeValue)>),
}

/// Diffs each subject's entity against its snapshot.
///
/// Comparison happens on database representations, after every value
/// passes through its column transformer. Join columns of owning relations
/// either carry a concrete value or a reference to another subject whose key
/// is only known once that subject is written.
pub struct ChangeSetComputer<'a> {
    graph: &'a EntityGraph,
    metadata: &'a dyn MetadataProvider,
}

impl<'a> ChangeSetComputer<'a> {
    pub fn new(graph: &'a EntityGraph, metadata: &'a dyn MetadataProvider) -> Self {
        Self { graph, metadata }
    }

    /// Compute change sets for every inserting or updating subject.
    ///
    /// Updates with no changes become no-ops. Fails with
    /// `MissingRequiredRelation` if any write leaves a required relation
    /// without a target.
    pub fn compute(&self, set: &mut SubjectSet) -> Result<()> {
        let ids: Vec<SubjectId> = set.ids().collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(subject) = set.get(*id) else {
                continue;
            };
            if !matches!(subject.kind, OperationKind::Insert | OperationKind::Update) {
                continue;
            }
            let (changes, unresolved) = self.diff(set, subject)?;
            results.push((*id, changes, unresolved));
        }

        for (id, changes, unresolved) in results {
            let Some(subject) = set.get_mut(id) else {
                continue;
            };
            subject.change_set = changes;
            subject.unresolved = unresolved;
            if subject.kind == OperationKind::Update && subject.change_set.is_empty() {
                subject.kind = OperationKind::NoOp;
            }
        }

        if let Some(subject) = set.iter().find(|s| s.is_write() && !s.unresolved.is_empty()) {
            return Err(PersistError::missing_required_relation(
                subject.entity_name(),
                &subject.unresolved[0],
            )
            .into());
        }
        Ok(())
    }

    /// Compute the change set of one subject.
    ///
    /// Returns the changes and the names of required relations that could
    /// not be resolved.
    pub fn diff(
        &self,
        set: &SubjectSet,
        subject: &Subject,
    ) -> Result<(Vec<ColumnChange>, Vec<String>)> {
        let Some(entity) = subject.entity().and_then(|e| self.graph.get(e)) else {
            return Ok((Vec::new(), Vec::new()));
        };
        let metadata = subject.metadata();
        let inserting = subject.kind == OperationKind::Insert;

        let mut relation_changes = Vec::new();
        let mut unresolved = Vec::new();
        let mut managed: HashSet<String> = HashSet::new();

        for relation in &metadata.relations {
            if relation.behaviour().diff != DiffStrategy::JoinColumns {
                continue;
            }
            match self.decide(set, subject, entity, relation)? {
                Decision::Unset => {
                    if inserting
                        && !relation.nullable
                        && !has_explicit_columns(entity, subject, relation)
                    {
                        return Err(PersistError::missing_required_relation(
                            &metadata.name,
                            &relation.name,
                        )
                        .into());
                    }
                }
                Decision::Omit => {}
                Decision::Unresolved => unresolved.push(relation.name.clone()),
                Decision::Columns(columns) => {
                    for (column, new) in columns {
                        managed.insert(column.clone());
                        let old = subject.old_value(&column).cloned();
                        if !inserting {
                            if let ChangeValue::Value(value) = &new {
                                if old.as_ref().unwrap_or(&Value::Null) == value {
                                    continue;
                                }
                            }
                        }
                        relation_changes.push(ColumnChange {
                            column,
                            old: if inserting { None } else { Some(old.unwrap_or(Value::Null)) },
                            new,
                            relation: Some(relation.name.clone()),
                        });
                    }
                }
            }
        }

        let mut changes = Vec::new();
        for column in &metadata.columns {
            if managed.contains(&column.column) || column.version {
                continue;
            }
            let value = entity.value(&column.property);
            if inserting {
                let new = match value {
                    Some(value) if !value.is_null() => column.to_database(value),
                    Some(_) if column.generation.is_some() => continue,
                    Some(_) => Value::Null,
                    None => match column.generation {
                        Some(Generation::Uuid) => Value::Uuid(*uuid::Uuid::new_v4().as_bytes()),
                        _ => continue,
                    },
                };
                changes.push(ColumnChange {
                    column: column.column.clone(),
                    old: None,
                    new: ChangeValue::Value(new),
                    relation: None,
                });
            } else {
                if column.primary {
                    continue;
                }
                let Some(value) = value else {
                    continue;
                };
                let new = column.to_database(value);
                let old = subject.old_value(&column.column).cloned().unwrap_or(Value::Null);
                if new != old {
                    changes.push(ColumnChange {
                        column: column.column.clone(),
                        old: Some(old),
                        new: ChangeValue::Value(new),
                        relation: None,
                    });
                }
            }
        }
        changes.extend(relation_changes);

        if let Some(version) = metadata.version_column() {
            if inserting {
                let initial = entity
                    .value(&version.property)
                    .filter(|v| !v.is_null())
                    .map_or(Value::BigInt(1), |v| version.to_database(v));
                changes.push(ColumnChange {
                    column: version.column.clone(),
                    old: None,
                    new: ChangeValue::Value(initial),
                    relation: None,
                });
            } else if !changes.is_empty() {
                let old = subject.old_value(&version.column).cloned().unwrap_or(Value::Null);
                let next = old.as_i64().unwrap_or(0).saturating_add(1);
                changes.push(ColumnChange {
                    column: version.column.clone(),
                    old: Some(old),
                    new: ChangeValue::Value(Value::BigInt(next)),
                    relation: None,
                });
            }
        }

        Ok((changes, unresolved))
    }

    fn decide(
        &self,
        set: &SubjectSet,
        subject: &Subject,
        entity: &'a Entity,
        relation: &RelationMetadata,
    ) -> Result<Decision> {
        let target = match self.target(subject, entity, relation)? {
            Target::Unset => return Ok(Decision::Unset),
            Target::Null => {
                return Ok(if relation.nullable {
                    Decision::Columns(
                        relation
                            .join_columns
                            .iter()
                            .map(|jc| (jc.column.clone(), ChangeValue::Value(Value::Null)))
                            .collect(),
                    )
                } else {
                    Decision::Unresolved
                });
            }
            target => target,
        };

        match target {
            Target::Entity(entity_id) => {
                if let Some(target_subject) = set.by_entity(entity_id) {
                    return Ok(self.from_subject(set, target_subject, relation));
                }
                let target_meta = self.metadata.require(&relation.target)?;
                let identifier = self
                    .graph
                    .get(entity_id)
                    .and_then(|e| target_meta.identifier_from_values(e.values()));
                Ok(match identifier {
                    Some(identifier) => from_identifier(&identifier, relation),
                    None => unreachable_target(relation),
                })
            }
            Target::Subject(id) => Ok(self.from_subject(set, id, relation)),
            Target::Identifier(identifier) => Ok(from_identifier(identifier, relation)),
            Target::Owned(identifier) => Ok(from_identifier(&identifier, relation)),
            Target::Unset | Target::Null => Ok(Decision::Unset),
        }
    }

    /// Resolve the relation's target. A collection claiming the entity in
    /// this call overrides whatever the entity's own slot holds.
    fn target(
        &self,
        subject: &Subject,
        entity: &'a Entity,
        relation: &RelationMetadata,
    ) -> Result<Target<'a>> {
        let claimed = subject
            .inverse_assignments
            .iter()
            .find(|a| a.relation == relation.name)
            .map(|a| a.owner);

        if let Some(owner) = claimed {
            return Ok(Target::Subject(owner));
        }

        Ok(match entity.relation(&relation.name) {
            None => Target::Unset,
            Some(RelationValue::Null) => Target::Null,
            Some(RelationValue::Deferred(deferred)) => {
                let target_meta = self.metadata.require(&relation.target)?;
                match deferred
                    .get()
                    .and_then(|rows| rows.first())
                    .and_then(|row| target_meta.identifier_from_row(row))
                {
                    Some(identifier) => Target::Owned(identifier),
                    None => Target::Unset,
                }
            }
            Some(value) => match value.targets().into_iter().next() {
                Some(RelationTarget::Entity(id)) => Target::Entity(*id),
                Some(RelationTarget::Identifier(identifier)) => Target::Identifier(identifier),
                None => Target::Null,
            },
        })
    }

    fn from_subject(&self, set: &SubjectSet, id: SubjectId, relation: &RelationMetadata) -> Decision {
        let Some(target) = set.get(id) else {
            return unreachable_target(relation);
        };
        if target.kind == OperationKind::Insert {
            return Decision::Columns(
                relation
                    .join_columns
                    .iter()
                    .map(|jc| {
                        (
                            jc.column.clone(),
                            ChangeValue::Reference {
                                subject: id,
                                column: jc.referenced_column.clone(),
                            },
                        )
                    })
                    .collect(),
            );
        }
        match target.identifier.as_ref().filter(|i| i.is_complete()) {
            Some(identifier) => from_identifier(identifier, relation),
            None => unreachable_target(relation),
        }
    }
}

/// Join-column values read from a known target identifier. A partial
/// composite key never resolves, whatever the relation's nullability.
fn from_identifier(identifier: &Identifier, relation: &RelationMetadata) -> Decision {
    let mut columns = Vec::with_capacity(relation.join_columns.len());
    for jc in &relation.join_columns {
        match identifier.get(&jc.referenced_column) {
            Some(value) if !value.is_null() => {
                columns.push((jc.column.clone(), ChangeValue::Value(value.clone())));
            }
            _ => return Decision::Unresolved,
        }
    }
    Decision::Columns(columns)
}

fn unreachable_target(relation: &RelationMetadata) -> Decision {
    if relation.nullable {
        Decision::Omit
    } else {
        Decision::Unresolved
    }
}

/// Whether the entity sets every join column of `relation` through a plain
/// property.
fn has_explicit_columns(entity: &Entity, subject: &Subject, relation: &RelationMetadata) -> bool {
    relation.join_columns.iter().all(|jc| {
        subject
            .metadata()
            .column_by_name(&jc.column)
            .and_then(|c| entity.value(&c.property))
            .is_some_and(|v| !v.is_null())
    })
}
