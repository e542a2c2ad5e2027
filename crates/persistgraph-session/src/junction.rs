//! Junction rows, collection foreign keys and deferred assignments.
//!
//! Many-to-many collections are diffed as identifier sets against the
//! previously known members: additions become junction inserts, removals
//! junction deletes. One-to-many collections whose children are not part of
//! the call write the child's foreign key directly, and children dropped
//! from a collection are handled by the relation's orphan action.
//!
//! Every operation may await subjects whose keys are not known until they
//! are inserted. The executor runs whatever is ready at the start and
//! reconciles after each insert; anything still pending at the end is an
//! internal error.

use crate::executor::PersistReport;
use crate::sorter::{BreakKind, BrokenEdge};
use crate::subject::{ChangeValue, OperationKind, SubjectId, SubjectSet};
use asupersync::{Cx, Outcome};
use persistgraph_core::{
    DiffStrategy, Entity, EntityGraph, EntityMetadata, Error, Identifier, IdentityKey,
    JoinColumn, JunctionTable, MetadataProvider, OrphanAction, PersistError, RelationMetadata,
    RelationTarget, RelationValue, Result, SqlExecutor, Value,
};
use std::collections::HashSet;
use std::sync::Arc;

/// A column value that may depend on a subject's key.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Value(Value),
    Subject { subject: SubjectId, column: String },
}

/// The row an assignment updates.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Subject(SubjectId),
    Known(Identifier),
}

/// Why a single-row update was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignKind {
    /// Completes a reference broken to resolve a cycle.
    Deferred,
    /// Points a collection member that is not part of the call at its owner.
    InverseForeignKey,
    /// Clears the foreign key of a child dropped from a collection.
    OrphanNullify,
    /// Clears a reference so a removal cycle can be deleted.
    DetachBeforeRemove,
}

/// A write that is not a subject's own row-level operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Link {
        table: String,
        values: Vec<(String, Source)>,
    },
    Unlink {
        table: String,
        values: Vec<(String, Source)>,
    },
    Assign {
        kind: AssignKind,
        table: String,
        row: Endpoint,
        values: Vec<(String, Source)>,
    },
}

impl PendingOp {
    pub fn table(&self) -> &str {
        match self {
            PendingOp::Link { table, .. }
            | PendingOp::Unlink { table, .. }
            | PendingOp::Assign { table, .. } => table,
        }
    }

    /// Subjects whose keys this operation needs.
    pub fn awaits(&self) -> Vec<SubjectId> {
        let values = match self {
            PendingOp::Link { values, .. }
            | PendingOp::Unlink { values, .. }
            | PendingOp::Assign { values, .. } => values,
        };
        let mut awaited: Vec<SubjectId> = values
            .iter()
            .filter_map(|(_, source)| match source {
                Source::Subject { subject, .. } => Some(*subject),
                Source::Value(_) => None,
            })
            .collect();
        if let PendingOp::Assign {
            row: Endpoint::Subject(subject),
            ..
        } = self
        {
            awaited.push(*subject);
        }
        awaited.sort_unstable();
        awaited.dedup();
        awaited
    }

    fn is_ready(&self, set: &SubjectSet) -> bool {
        self.awaits()
            .into_iter()
            .all(|id| set.get(id).is_some_and(|s| s.is_available()))
    }

    async fn execute<C>(&self, cx: &Cx, connection: &C, set: &mut SubjectSet) -> Outcome<(), Error>
    where
        C: SqlExecutor + ?Sized,
    {
        match self {
            PendingOp::Link { table, values } => {
                let values = match resolve_values(set, values) {
                    Ok(v) => v,
                    Err(e) => return Outcome::Err(e),
                };
                tracing::trace!(table = %table, "Inserting junction row");
                match connection.insert(cx, table, &values).await {
                    Outcome::Ok(_) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            PendingOp::Unlink { table, values } => {
                let identifier = match resolve_values(set, values) {
                    Ok(v) => Identifier::new(v),
                    Err(e) => return Outcome::Err(e),
                };
                tracing::trace!(table = %table, "Deleting junction row");
                match connection.delete(cx, table, &identifier).await {
                    Outcome::Ok(_) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            PendingOp::Assign {
                kind,
                table,
                row,
                values,
            } => {
                let identifier = match resolve_endpoint(set, row) {
                    Ok(id) => id,
                    Err(e) => return Outcome::Err(e),
                };
                let values = match resolve_values(set, values) {
                    Ok(v) => v,
                    Err(e) => return Outcome::Err(e),
                };
                tracing::trace!(table = %table, kind = ?kind, row = %identifier, "Assigning foreign key");
                match connection.update(cx, table, &identifier, &values).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                if let Endpoint::Subject(id) = row {
                    if let Some(subject) = set.get_mut(*id) {
                        for (column, value) in values {
                            subject.written.set(column, value);
                        }
                    }
                }
                Outcome::Ok(())
            }
        }
    }
}

fn resolve_source(set: &SubjectSet, source: &Source) -> Result<Value> {
    match source {
        Source::Value(value) => Ok(value.clone()),
        Source::Subject { subject, column } => set
            .get(*subject)
            .and_then(|s| s.identifier.as_ref())
            .and_then(|id| id.get(column))
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                let entity = set.get(*subject).map_or("?", |s| s.entity_name());
                PersistError::persisted_entity_not_found(entity, subject).into()
            }),
    }
}

fn resolve_values(set: &SubjectSet, values: &[(String, Source)]) -> Result<Vec<(String, Value)>> {
    values
        .iter()
        .map(|(column, source)| Ok((column.clone(), resolve_source(set, source)?)))
        .collect()
}

fn resolve_endpoint(set: &SubjectSet, endpoint: &Endpoint) -> Result<Identifier> {
    match endpoint {
        Endpoint::Known(identifier) => Ok(identifier.clone()),
        Endpoint::Subject(id) => {
            let subject = set
                .get(*id)
                .ok_or_else(|| Error::from(PersistError::persisted_entity_not_found("?", id)))?;
            subject
                .identifier
                .clone()
                .filter(Identifier::is_complete)
                .ok_or_else(|| PersistError::missing_identifier(subject.entity_name()).into())
        }
    }
}

/// Dedup key of one endpoint: its row identity, or the subject while the
/// key is still unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EndpointKey {
    Pending(SubjectId),
    Known(IdentityKey),
}

/// A collection member considered for orphan handling.
struct OrphanCandidate {
    target: Arc<EntityMetadata>,
    owning: RelationMetadata,
    identifier: Identifier,
    action: OrphanAction,
}

/// Plans and runs junction, foreign-key and deferred operations.
#[derive(Debug, Default)]
pub struct JunctionManager {
    ops: Vec<PendingOp>,
    done: Vec<bool>,
    keys: HashSet<(String, bool, EndpointKey, EndpointKey)>,
}

impl JunctionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan collection operations for every subject whose collections are
    /// diffed in this call.
    ///
    /// Orphans configured for deletion become new entity-less removal
    /// subjects in `set`.
    pub fn plan(
        graph: &EntityGraph,
        metadata: &dyn MetadataProvider,
        set: &mut SubjectSet,
    ) -> Result<Self> {
        let mut manager = Self::new();
        let mut claimed: HashSet<IdentityKey> = HashSet::new();
        let mut orphans = Vec::new();

        let ids: Vec<SubjectId> = set.ids().collect();
        for id in ids {
            let Some(subject) = set.get(id) else {
                continue;
            };
            if !subject.tracks_collections() {
                continue;
            }
            let entity_metadata = subject.metadata().clone();
            let entity = subject.entity().and_then(|e| graph.get(e));

            for relation in &entity_metadata.relations {
                match relation.behaviour().diff {
                    DiffStrategy::JoinColumns => {}
                    DiffStrategy::JunctionSet => {
                        manager.plan_junction(graph, metadata, set, id, relation, entity)?;
                    }
                    DiffStrategy::InverseForeignKey => {
                        manager.plan_collection(
                            graph,
                            metadata,
                            set,
                            id,
                            relation,
                            entity,
                            &mut claimed,
                            &mut orphans,
                        )?;
                    }
                }
            }
        }

        for orphan in orphans {
            let key = IdentityKey::new(orphan.target.name.clone(), &orphan.identifier);
            if claimed.contains(&key) || set.by_identity(&key).is_some() {
                continue;
            }
            match orphan.action {
                OrphanAction::Nullify => manager.push(PendingOp::Assign {
                    kind: AssignKind::OrphanNullify,
                    table: orphan.target.table.clone(),
                    row: Endpoint::Known(orphan.identifier),
                    values: orphan
                        .owning
                        .join_columns
                        .iter()
                        .map(|jc| (jc.column.clone(), Source::Value(Value::Null)))
                        .collect(),
                }),
                OrphanAction::Delete => {
                    tracing::debug!(
                        entity = %orphan.target.name,
                        identifier = %orphan.identifier,
                        "Removing orphaned row"
                    );
                    let id = set.add(orphan.target, None, Some(orphan.identifier));
                    if let Some(subject) = set.get_mut(id) {
                        subject.must_be_removed = true;
                        subject.kind = OperationKind::Remove;
                    }
                }
                OrphanAction::Ignore => {}
            }
        }

        tracing::debug!(ops = manager.ops.len(), "Collection operations planned");
        Ok(manager)
    }

    fn plan_junction(
        &mut self,
        graph: &EntityGraph,
        metadata: &dyn MetadataProvider,
        set: &SubjectSet,
        id: SubjectId,
        relation: &RelationMetadata,
        entity: Option<&Entity>,
    ) -> Result<()> {
        let Some(subject) = set.get(id) else {
            return Ok(());
        };
        let target_meta = metadata.require(&relation.target)?;
        let (junction, owning_name, self_is_owner) = if relation.is_owning() {
            match &relation.junction {
                Some(junction) => (junction.clone(), relation.name.clone(), true),
                None => return Ok(()),
            }
        } else {
            match metadata.counterpart(relation)? {
                Some((_, owning)) => match owning.junction {
                    Some(junction) => (junction, owning.name, false),
                    None => return Ok(()),
                },
                None => return Ok(()),
            }
        };

        let previous: Vec<Identifier> = if subject.kind == OperationKind::Insert {
            Vec::new()
        } else {
            subject
                .snapshot
                .as_ref()
                .and_then(|s| s.relation(&relation.name))
                .map(<[Identifier]>::to_vec)
                .unwrap_or_default()
        };
        let self_key = endpoint_key(set, id);
        let pair = |other: Endpoint, other_key: EndpointKey| {
            if self_is_owner {
                (Endpoint::Subject(id), self_key.clone(), other, other_key)
            } else {
                (other, other_key, Endpoint::Subject(id), self_key.clone())
            }
        };

        if subject.kind == OperationKind::Remove {
            for identifier in previous {
                let key = EndpointKey::Known(IdentityKey::new(target_meta.name.clone(), &identifier));
                let (owner, owner_key, inverse, inverse_key) =
                    pair(Endpoint::Known(identifier), key);
                self.pair_op(false, &junction, owner, owner_key, inverse, inverse_key)?;
            }
            return Ok(());
        }

        let Some(value) = entity.and_then(|e| e.relation(&relation.name)) else {
            return Ok(());
        };
        if matches!(value, RelationValue::Deferred(_)) {
            return Ok(());
        }

        let owning_side_wins = |target: SubjectId| {
            !self_is_owner
                && set.get(target).is_some_and(|t| {
                    t.tracks_collections()
                        && t.entity()
                            .and_then(|e| graph.get(e))
                            .and_then(|e| e.relation(&owning_name))
                            .is_some_and(|v| !matches!(v, RelationValue::Deferred(_)))
                })
        };

        let previous_keys: HashSet<IdentityKey> = previous
            .iter()
            .map(|p| IdentityKey::new(target_meta.name.clone(), p))
            .collect();
        let mut desired_keys: HashSet<IdentityKey> = HashSet::new();

        for target in value.targets() {
            let (endpoint, key) = match target {
                RelationTarget::Entity(entity_id) => {
                    if let Some(target_id) = set.by_entity(*entity_id) {
                        if owning_side_wins(target_id) {
                            if let Some(identity) = set.get(target_id).and_then(|t| t.identity()) {
                                desired_keys.insert(identity);
                            }
                            continue;
                        }
                        (Endpoint::Subject(target_id), endpoint_key(set, target_id))
                    } else {
                        let Some(identifier) = graph
                            .get(*entity_id)
                            .and_then(|e| target_meta.identifier_from_values(e.values()))
                        else {
                            continue;
                        };
                        let key = IdentityKey::new(target_meta.name.clone(), &identifier);
                        (Endpoint::Known(identifier), EndpointKey::Known(key))
                    }
                }
                RelationTarget::Identifier(identifier) => {
                    let key = IdentityKey::new(target_meta.name.clone(), identifier);
                    (Endpoint::Known(identifier.clone()), EndpointKey::Known(key))
                }
            };

            let new = match &key {
                EndpointKey::Known(identity) => {
                    desired_keys.insert(identity.clone());
                    !previous_keys.contains(identity)
                }
                EndpointKey::Pending(_) => true,
            };
            if new {
                let (owner, owner_key, inverse, inverse_key) = pair(endpoint, key);
                self.pair_op(true, &junction, owner, owner_key, inverse, inverse_key)?;
            }
        }

        for identifier in previous {
            let identity = IdentityKey::new(target_meta.name.clone(), &identifier);
            if desired_keys.contains(&identity) {
                continue;
            }
            if set
                .by_identity(&identity)
                .is_some_and(|t| owning_side_wins(t))
            {
                continue;
            }
            let (owner, owner_key, inverse, inverse_key) =
                pair(Endpoint::Known(identifier), EndpointKey::Known(identity));
            self.pair_op(false, &junction, owner, owner_key, inverse, inverse_key)?;
        }
        Ok(())
    }

    fn pair_op(
        &mut self,
        link: bool,
        junction: &JunctionTable,
        owner: Endpoint,
        owner_key: EndpointKey,
        inverse: Endpoint,
        inverse_key: EndpointKey,
    ) -> Result<()> {
        if !self
            .keys
            .insert((junction.table.clone(), link, owner_key, inverse_key))
        {
            return Ok(());
        }
        let mut values = endpoint_sources(&owner, &junction.owner_columns, &junction.table)?;
        values.extend(endpoint_sources(
            &inverse,
            &junction.inverse_columns,
            &junction.table,
        )?);
        let table = junction.table.clone();
        self.push(if link {
            PendingOp::Link { table, values }
        } else {
            PendingOp::Unlink { table, values }
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_collection(
        &mut self,
        graph: &EntityGraph,
        metadata: &dyn MetadataProvider,
        set: &SubjectSet,
        id: SubjectId,
        relation: &RelationMetadata,
        entity: Option<&Entity>,
        claimed: &mut HashSet<IdentityKey>,
        orphans: &mut Vec<OrphanCandidate>,
    ) -> Result<()> {
        let Some(subject) = set.get(id) else {
            return Ok(());
        };
        if subject.kind == OperationKind::Remove {
            return Ok(());
        }
        let Some((target_meta, owning)) = metadata.counterpart(relation)? else {
            return Ok(());
        };
        let Some(value) = entity.and_then(|e| e.relation(&relation.name)) else {
            return Ok(());
        };
        if matches!(value, RelationValue::Deferred(_)) {
            return Ok(());
        }

        let previous: Vec<Identifier> = if subject.kind == OperationKind::Insert {
            Vec::new()
        } else {
            subject
                .snapshot
                .as_ref()
                .and_then(|s| s.relation(&relation.name))
                .map(<[Identifier]>::to_vec)
                .unwrap_or_default()
        };
        let previous_keys: HashSet<IdentityKey> = previous
            .iter()
            .map(|p| IdentityKey::new(target_meta.name.clone(), p))
            .collect();
        let mut current: HashSet<IdentityKey> = HashSet::new();

        for target in value.targets() {
            let identifier = match target {
                RelationTarget::Entity(entity_id) => {
                    if let Some(child) = set.by_entity(*entity_id) {
                        if let Some(identity) = set.get(child).and_then(|c| c.identity()) {
                            claimed.insert(identity.clone());
                            current.insert(identity);
                        }
                        continue;
                    }
                    let Some(identifier) = graph
                        .get(*entity_id)
                        .and_then(|e| target_meta.identifier_from_values(e.values()))
                    else {
                        continue;
                    };
                    identifier
                }
                RelationTarget::Identifier(identifier) => identifier.clone(),
            };
            let key = IdentityKey::new(target_meta.name.clone(), &identifier);
            claimed.insert(key.clone());
            current.insert(key.clone());
            if previous_keys.contains(&key) {
                continue;
            }
            self.push(PendingOp::Assign {
                kind: AssignKind::InverseForeignKey,
                table: target_meta.table.clone(),
                row: Endpoint::Known(identifier),
                values: owning
                    .join_columns
                    .iter()
                    .map(|jc| {
                        (
                            jc.column.clone(),
                            Source::Subject {
                                subject: id,
                                column: jc.referenced_column.clone(),
                            },
                        )
                    })
                    .collect(),
            });
        }

        if relation.kind == persistgraph_core::RelationKind::OneToMany
            && relation.orphan != OrphanAction::Ignore
        {
            for identifier in previous {
                let key = IdentityKey::new(target_meta.name.clone(), &identifier);
                if current.contains(&key) {
                    continue;
                }
                orphans.push(OrphanCandidate {
                    target: Arc::clone(&target_meta),
                    owning: owning.clone(),
                    identifier,
                    action: relation.orphan,
                });
            }
        }
        Ok(())
    }

    /// Schedule the completion of edges broken by the sorter.
    pub fn defer(&mut self, set: &SubjectSet, broken: &[BrokenEdge]) {
        for edge in broken {
            let Some(holder) = set.get(edge.holder) else {
                continue;
            };
            let kind = match edge.kind {
                BreakKind::DeferredUpdate => AssignKind::Deferred,
                BreakKind::DetachBeforeRemove => AssignKind::DetachBeforeRemove,
            };
            let values = edge
                .changes
                .iter()
                .map(|change| {
                    let source = match &change.new {
                        ChangeValue::Value(value) => Source::Value(value.clone()),
                        ChangeValue::Reference { subject, column } => Source::Subject {
                            subject: *subject,
                            column: column.clone(),
                        },
                    };
                    (change.column.clone(), source)
                })
                .collect();
            self.push(PendingOp::Assign {
                kind,
                table: holder.metadata().table.clone(),
                row: Endpoint::Subject(edge.holder),
                values,
            });
        }
    }

    pub fn push(&mut self, op: PendingOp) {
        self.ops.push(op);
        self.done.push(false);
    }

    /// All planned operations in planning order.
    pub fn ops(&self) -> &[PendingOp] {
        &self.ops
    }

    /// Operations that have not run yet.
    pub fn pending(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops
            .iter()
            .zip(&self.done)
            .filter(|(_, done)| !**done)
            .map(|(op, _)| op)
    }

    /// Run every operation whose awaited subjects are available.
    pub async fn run_ready<C>(
        &mut self,
        cx: &Cx,
        connection: &C,
        set: &mut SubjectSet,
        report: &mut PersistReport,
    ) -> Outcome<usize, Error>
    where
        C: SqlExecutor + ?Sized,
    {
        self.run_matching(cx, connection, set, report, None).await
    }

    /// Run the operations that were waiting on `subject` and are now ready.
    pub async fn reconcile<C>(
        &mut self,
        cx: &Cx,
        connection: &C,
        set: &mut SubjectSet,
        subject: SubjectId,
        report: &mut PersistReport,
    ) -> Outcome<usize, Error>
    where
        C: SqlExecutor + ?Sized,
    {
        self.run_matching(cx, connection, set, report, Some(subject))
            .await
    }

    async fn run_matching<C>(
        &mut self,
        cx: &Cx,
        connection: &C,
        set: &mut SubjectSet,
        report: &mut PersistReport,
        subject: Option<SubjectId>,
    ) -> Outcome<usize, Error>
    where
        C: SqlExecutor + ?Sized,
    {
        let mut executed = 0;
        for index in 0..self.ops.len() {
            if self.done[index] {
                continue;
            }
            let op = &self.ops[index];
            if subject.is_some_and(|s| !op.awaits().contains(&s)) || !op.is_ready(set) {
                continue;
            }
            match op.execute(cx, connection, set).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            report.record(op);
            self.done[index] = true;
            executed += 1;
        }
        Outcome::Ok(executed)
    }

    /// Fail if any operation never became ready.
    pub fn finish(&self, set: &SubjectSet) -> Result<()> {
        let Some(op) = self.pending().next() else {
            return Ok(());
        };
        let waiting: Vec<String> = op
            .awaits()
            .into_iter()
            .filter(|id| !set.get(*id).is_some_and(|s| s.is_available()))
            .map(|id| id.to_string())
            .collect();
        Err(PersistError::persisted_entity_not_found(
            op.table(),
            format!("waiting on {}", waiting.join(", ")),
        )
        .into())
    }
}

fn endpoint_key(set: &SubjectSet, id: SubjectId) -> EndpointKey {
    match set.get(id) {
        Some(subject) if subject.kind != OperationKind::Insert => subject
            .identity()
            .map_or(EndpointKey::Pending(id), EndpointKey::Known),
        _ => EndpointKey::Pending(id),
    }
}

fn endpoint_sources(
    endpoint: &Endpoint,
    columns: &[JoinColumn],
    table: &str,
) -> Result<Vec<(String, Source)>> {
    columns
        .iter()
        .map(|jc| {
            let source = match endpoint {
                Endpoint::Subject(subject) => Source::Subject {
                    subject: *subject,
                    column: jc.referenced_column.clone(),
                },
                Endpoint::Known(identifier) => Source::Value(
                    identifier
                        .get(&jc.referenced_column)
                        .cloned()
                        .ok_or_else(|| Error::from(PersistError::missing_identifier(table)))?,
                ),
            };
            Ok((jc.column.clone(), source))
        })
        .collect()
}
