//! Subject builder: walks the object graph and collects subjects.

use crate::cascade::CascadeResolver;
use crate::subject::{SubjectId, SubjectSet};
use persistgraph_core::{
    CascadeOperation, DiffStrategy, EntityGraph, EntityId, Error, IdentityKey, MetadataProvider,
    PersistError, RelationTarget, RelationValue, Result,
};
use std::collections::{HashSet, VecDeque};

/// The operation a call performs on its roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOperation {
    Save,
    Remove,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    insert: bool,
    update: bool,
    remove: bool,
}

/// Collects one subject per affected row, following cascading relations.
///
/// Traversal is breadth-first from the roots and keyed by graph identity,
/// so cyclic graphs terminate and an object reachable through several paths
/// yields a single subject. Relations whose cascade flags do not cover the
/// operation are not followed at all.
pub struct SubjectBuilder<'a> {
    graph: &'a EntityGraph,
    metadata: &'a dyn MetadataProvider,
    resolver: CascadeResolver<'a>,
    set: SubjectSet,
    visited: HashSet<EntityId>,
}

impl<'a> SubjectBuilder<'a> {
    pub fn new(graph: &'a EntityGraph, metadata: &'a dyn MetadataProvider) -> Self {
        Self {
            graph,
            metadata,
            resolver: CascadeResolver::new(metadata),
            set: SubjectSet::new(),
            visited: HashSet::new(),
        }
    }

    /// Build the subject set for `roots`.
    #[tracing::instrument(level = "debug", skip(self, roots), fields(roots = roots.len()))]
    pub fn build(mut self, roots: &[EntityId], operation: PersistOperation) -> Result<SubjectSet> {
        let root_flags = match operation {
            PersistOperation::Save => Flags {
                insert: true,
                update: true,
                remove: false,
            },
            PersistOperation::Remove => Flags {
                insert: false,
                update: false,
                remove: true,
            },
        };

        let mut queue = VecDeque::new();
        for root in roots {
            self.ensure_subject(*root, root_flags)?;
            queue.push_back(*root);
        }

        while let Some(entity) = queue.pop_front() {
            if !self.visited.insert(entity) {
                continue;
            }
            self.walk(entity, operation, &mut queue)?;
        }

        self.link_relations(operation)?;

        tracing::debug!(subjects = self.set.len(), "Subject set built");
        Ok(self.set)
    }

    fn walk(
        &mut self,
        entity_id: EntityId,
        operation: PersistOperation,
        queue: &mut VecDeque<EntityId>,
    ) -> Result<()> {
        let graph = self.graph;
        let Some(entity) = graph.get(entity_id) else {
            return Err(PersistError::persisted_entity_not_found("?", entity_id).into());
        };
        let metadata = self.metadata.require(entity.entity_type())?;

        for relation in &metadata.relations {
            let Some(value) = entity.relation(&relation.name) else {
                continue;
            };
            let targets = entity_targets(value);
            if targets.is_empty() {
                continue;
            }

            let flags = match operation {
                PersistOperation::Save => Flags {
                    insert: self
                        .resolver
                        .should_cascade(relation, CascadeOperation::Insert)?,
                    update: self
                        .resolver
                        .should_cascade(relation, CascadeOperation::Update)?,
                    remove: false,
                },
                PersistOperation::Remove => Flags {
                    insert: false,
                    update: false,
                    remove: self
                        .resolver
                        .should_cascade(relation, CascadeOperation::Remove)?,
                },
            };
            if !(flags.insert || flags.update || flags.remove) {
                tracing::trace!(
                    entity = %metadata.name,
                    relation = %relation.name,
                    "Relation does not cascade; skipped"
                );
                continue;
            }

            for target in targets {
                self.ensure_subject(target, flags)?;
                queue.push_back(target);
            }
        }
        Ok(())
    }

    /// Find or create the subject for a graph entity and merge `flags` into it.
    fn ensure_subject(&mut self, entity_id: EntityId, flags: Flags) -> Result<SubjectId> {
        let id = match self.set.by_entity(entity_id) {
            Some(id) => id,
            None => {
                let Some(entity) = self.graph.get(entity_id) else {
                    return Err(PersistError::persisted_entity_not_found("?", entity_id).into());
                };
                let metadata = self.metadata.require(entity.entity_type())?;
                let identifier = metadata.identifier_from_values(entity.values());
                let existing = identifier
                    .as_ref()
                    .and_then(|id| self.set.by_identity(&IdentityKey::new(&metadata.name, id)));
                if let Some(existing) = existing {
                    self.set.alias(entity_id, existing);
                    existing
                } else {
                    self.set.add(metadata, Some(entity_id), identifier)
                }
            }
        };

        if let Some(subject) = self.set.get_mut(id) {
            subject.can_be_inserted |= flags.insert;
            subject.can_be_updated |= flags.update;
            subject.must_be_removed |= flags.remove;
        }
        Ok(id)
    }

    /// Record relation edges between subjects and let collections claim
    /// their children.
    fn link_relations(&mut self, operation: PersistOperation) -> Result<()> {
        let graph = self.graph;
        let ids: Vec<SubjectId> = self.set.ids().collect();
        for id in ids {
            let Some(subject) = self.set.get(id) else {
                continue;
            };
            let Some(entity_id) = subject.entity() else {
                continue;
            };
            let metadata = subject.metadata().clone();
            let Some(entity) = graph.get(entity_id) else {
                continue;
            };

            for relation in &metadata.relations {
                let Some(value) = entity.relation(&relation.name) else {
                    continue;
                };
                let claims_children = operation == PersistOperation::Save
                    && relation.behaviour().diff == DiffStrategy::InverseForeignKey;
                let counterpart = if claims_children {
                    self.metadata.counterpart(relation)?.map(|(_, owning)| owning)
                } else {
                    None
                };

                for target in entity_targets(value) {
                    let Some(target_id) = self.set.by_entity(target) else {
                        continue;
                    };
                    if let Some(subject) = self.set.get_mut(id) {
                        subject.link(&relation.name, target_id);
                    }
                    if let Some(owning) = &counterpart {
                        if let Some(child) = self.set.get_mut(target_id) {
                            child.assign_inverse(&owning.name, id);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Graph entities held by a relation value.
fn entity_targets(value: &RelationValue) -> Vec<EntityId> {
    value
        .targets()
        .into_iter()
        .filter_map(|t| match t {
            RelationTarget::Entity(e) => Some(*e),
            RelationTarget::Identifier(_) => None,
        })
        .collect()
}

/// Check that every root exists in the graph.
pub(crate) fn check_roots(graph: &EntityGraph, roots: &[EntityId]) -> Result<()> {
    for root in roots {
        if graph.get(*root).is_none() {
            return Err(Error::Persist(PersistError::persisted_entity_not_found(
                "?", root,
            )));
        }
    }
    Ok(())
}
