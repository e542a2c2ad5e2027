//! Transactional execution of a sorted plan.

use crate::junction::{AssignKind, JunctionManager, PendingOp};
use crate::listeners::{EntityEvent, EntityListeners};
use crate::options::{SaveOptions, TransactionMode};
use crate::sorter::SortedPlan;
use crate::subject::{ChangeValue, ColumnChange, OperationKind, Subject, SubjectId, SubjectSet};
use asupersync::{Cx, Outcome};
use persistgraph_core::{
    EntityGraph, Error, Identifier, MetadataProvider, PersistError, RelationTarget,
    RelationValue, Row, Snapshot, SqlExecutor, TransactionError, TransactionErrorKind,
    TransactionScope, Value,
};
use serde::{Deserialize, Serialize};

/// One subject as it appeared in a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub entity: String,
    pub kind: OperationKind,
}

/// Summary of the writes performed by one save/remove call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReport {
    pub inserts: usize,
    pub updates: usize,
    pub removes: usize,
    pub junction_inserts: usize,
    pub junction_deletes: usize,
    /// Assignments completing references broken to resolve cycles.
    pub deferred_updates: usize,
    /// Collection foreign keys written to rows outside the call.
    pub foreign_key_updates: usize,
    /// Subjects in execution order, grouped by phase.
    pub phases: Vec<Vec<PhaseEntry>>,
}

impl PersistReport {
    /// Count one executed pending operation.
    pub fn record(&mut self, op: &PendingOp) {
        match op {
            PendingOp::Link { .. } => self.junction_inserts += 1,
            PendingOp::Unlink { .. } => self.junction_deletes += 1,
            PendingOp::Assign { kind, .. } => match kind {
                AssignKind::Deferred | AssignKind::DetachBeforeRemove => {
                    self.deferred_updates += 1;
                }
                AssignKind::InverseForeignKey | AssignKind::OrphanNullify => {
                    self.foreign_key_updates += 1;
                }
            },
        }
    }

    /// Total number of statements issued.
    pub fn writes(&self) -> usize {
        self.inserts
            + self.updates
            + self.removes
            + self.junction_inserts
            + self.junction_deletes
            + self.deferred_updates
            + self.foreign_key_updates
    }

    /// Whether the call wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.writes() == 0
    }
}

/// A fully planned call: subjects, their order and the operations that
/// complete them.
#[derive(Debug, Default)]
pub struct PreparedPlan {
    pub set: SubjectSet,
    pub plan: SortedPlan,
    pub junctions: JunctionManager,
}

/// Runs prepared plans inside one transactional scope.
///
/// With [`TransactionMode::Auto`] the executor opens a scope unless the
/// connection already has one, and only finishes a scope it opened.
/// [`TransactionMode::Existing`] requires an active scope and never commits
/// or rolls it back. [`TransactionMode::None`] runs without a scope.
pub struct TransactionExecutor<'c, C> {
    connection: &'c C,
    metadata: &'c dyn MetadataProvider,
    mode: TransactionMode,
    owns_scope: bool,
}

impl<'c, C> TransactionExecutor<'c, C>
where
    C: SqlExecutor + TransactionScope,
{
    pub fn new(connection: &'c C, metadata: &'c dyn MetadataProvider, options: &SaveOptions) -> Self {
        Self {
            connection,
            metadata,
            mode: options.transaction,
            owns_scope: false,
        }
    }

    /// Whether this executor opened the current scope.
    pub fn owns_scope(&self) -> bool {
        self.owns_scope
    }

    /// Enter the transactional scope required by the mode.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.mode {
            TransactionMode::Auto => {
                if self.connection.is_active() {
                    return Outcome::Ok(());
                }
                match self.connection.begin(cx).await {
                    Outcome::Ok(()) => {
                        self.owns_scope = true;
                        tracing::debug!("Transactional scope opened");
                        Outcome::Ok(())
                    }
                    other => other,
                }
            }
            TransactionMode::Existing => {
                if self.connection.is_active() {
                    Outcome::Ok(())
                } else {
                    Outcome::Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::NotActive,
                        message: "transaction mode 'existing' requires an active scope"
                            .to_string(),
                    }))
                }
            }
            TransactionMode::None => Outcome::Ok(()),
        }
    }

    /// Commit and release the scope, if this executor opened it.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.owns_scope {
            return Outcome::Ok(());
        }
        match self.connection.commit(cx).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        self.owns_scope = false;
        tracing::debug!("Transactional scope committed");
        self.connection.release(cx).await
    }

    /// Roll back and release the scope, if this executor opened it.
    ///
    /// Failures here are logged; the caller reports the original error.
    pub async fn abort(&mut self, cx: &Cx) {
        if !self.owns_scope {
            return;
        }
        self.owns_scope = false;
        match self.connection.rollback(cx).await {
            Outcome::Ok(()) => tracing::debug!("Transactional scope rolled back"),
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback failed"),
            Outcome::Cancelled(r) => tracing::warn!(reason = ?r, "Rollback cancelled"),
            Outcome::Panicked(p) => tracing::warn!(payload = ?p, "Rollback panicked"),
        }
        match self.connection.release(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "Release after rollback failed"),
            Outcome::Cancelled(r) => tracing::warn!(reason = ?r, "Release cancelled"),
            Outcome::Panicked(p) => tracing::warn!(payload = ?p, "Release panicked"),
        }
    }

    /// Execute one prepared plan phase by phase.
    ///
    /// Operations that are ready up front run first; each insert then
    /// reconciles the operations that were waiting for its key. After-event
    /// listeners fire right after each row-level write.
    pub async fn run(
        &self,
        cx: &Cx,
        graph: &mut EntityGraph,
        prepared: &mut PreparedPlan,
        mut listeners: Option<&mut EntityListeners>,
        report: &mut PersistReport,
    ) -> Outcome<(), Error> {
        let PreparedPlan {
            set,
            plan,
            junctions,
        } = prepared;

        report.phases.extend(plan.phases.iter().map(|phase| {
            phase
                .iter()
                .filter_map(|id| set.get(*id))
                .map(|s| PhaseEntry {
                    entity: s.entity_name().to_string(),
                    kind: s.kind,
                })
                .collect::<Vec<_>>()
        }));

        match junctions.run_ready(cx, self.connection, set, report).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        for (index, phase) in plan.phases.iter().enumerate() {
            tracing::trace!(phase = index, subjects = phase.len(), "Executing phase");
            for id in phase {
                match self.write(cx, set, *id, report).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }

                if let Some(listeners) = listeners.as_deref_mut() {
                    if let Err(e) = fire_after(listeners, graph, set, *id) {
                        return Outcome::Err(e);
                    }
                }

                if set.get(*id).map(|s| s.kind) == Some(OperationKind::Insert) {
                    match junctions.reconcile(cx, self.connection, set, *id, report).await {
                        Outcome::Ok(_) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
            }
        }

        if let Err(e) = junctions.finish(set) {
            return Outcome::Err(e);
        }

        // Later chunks of the same call plan against the written graph.
        self.write_back(graph, set);
        Outcome::Ok(())
    }

    async fn write(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        id: SubjectId,
        report: &mut PersistReport,
    ) -> Outcome<(), Error> {
        let Some(subject) = set.get(id) else {
            return Outcome::Err(PersistError::persisted_entity_not_found("?", id).into());
        };
        let metadata = subject.metadata().clone();
        let table = metadata.table.as_str();

        match subject.kind {
            OperationKind::Insert => {
                let values = match resolve_changes(set, &subject.change_set) {
                    Ok(values) => values,
                    Err(e) => return Outcome::Err(e),
                };
                let returned = match self.connection.insert(cx, table, &values).await {
                    Outcome::Ok(row) => row,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let written = Row::from_pairs(values);
                let mut row = written.clone();
                row.merge(&returned);
                let Some(identifier) = metadata.identifier_from_row(&row) else {
                    return Outcome::Err(PersistError::missing_identifier(&metadata.name).into());
                };
                tracing::trace!(entity = %metadata.name, identifier = %identifier, "Inserted");

                if let Some(subject) = set.get_mut(id) {
                    subject.written = written;
                    subject.inserted_values = returned;
                    subject.identifier = Some(identifier);
                    subject.executed = true;
                }
                set.register_identity(id);
                report.inserts += 1;
            }
            OperationKind::Update => {
                if subject.change_set.is_empty() {
                    if let Some(subject) = set.get_mut(id) {
                        subject.executed = true;
                    }
                    return Outcome::Ok(());
                }
                let Some(identifier) = subject.identifier.clone().filter(Identifier::is_complete)
                else {
                    return Outcome::Err(PersistError::missing_identifier(&metadata.name).into());
                };
                let values = match resolve_changes(set, &subject.change_set) {
                    Ok(values) => values,
                    Err(e) => return Outcome::Err(e),
                };
                match self
                    .connection
                    .update(cx, table, &identifier, &values)
                    .await
                {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                tracing::trace!(entity = %metadata.name, identifier = %identifier, columns = values.len(), "Updated");
                if let Some(subject) = set.get_mut(id) {
                    for (column, value) in values {
                        subject.written.set(column, value);
                    }
                    subject.executed = true;
                }
                report.updates += 1;
            }
            OperationKind::Remove => {
                let Some(identifier) = subject.identifier.clone().filter(Identifier::is_complete)
                else {
                    return Outcome::Err(PersistError::missing_identifier(&metadata.name).into());
                };
                match self.connection.delete(cx, table, &identifier).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                tracing::trace!(entity = %metadata.name, identifier = %identifier, "Removed");
                if let Some(subject) = set.get_mut(id) {
                    subject.executed = true;
                }
                report.removes += 1;
            }
            OperationKind::NoOp => {}
        }
        Outcome::Ok(())
    }

    /// Write generated values and refreshed snapshots back into the graph.
    fn write_back(&self, graph: &mut EntityGraph, set: &SubjectSet) {
        for subject in set.iter() {
            let Some(entity) = subject.entity().and_then(|e| graph.get_mut(e)) else {
                continue;
            };
            let metadata = subject.metadata();

            match subject.kind {
                OperationKind::Remove => {
                    entity.set_snapshot(None);
                    continue;
                }
                OperationKind::NoOp if !subject.tracks_collections() => {
                    if entity.snapshot().is_none() {
                        entity.set_snapshot(subject.snapshot.clone());
                    }
                    continue;
                }
                _ => {}
            }

            for (column, value) in subject.written.iter().chain(subject.inserted_values.iter()) {
                let Some(column) = metadata.column_by_name(column) else {
                    continue;
                };
                let generated = column.primary || column.generation.is_some() || column.version;
                if generated || entity.value(&column.property).is_none() {
                    entity.set_value(column.property.clone(), column.from_database(value));
                }
            }

            let previous = subject.snapshot.clone().unwrap_or_default();
            let mut values = previous.values().clone();
            values.merge(&subject.written);
            values.merge(&subject.inserted_values);
            let mut snapshot = Snapshot::new(values);
            for relation in &metadata.relations {
                if let Some(known) = previous.relation(&relation.name) {
                    snapshot.set_relation(relation.name.clone(), known.to_vec());
                }
            }
            entity.set_snapshot(Some(snapshot));
        }

        // A claimed child now points at the collection that claimed it.
        for subject in set.iter().filter(|s| s.kind != OperationKind::Remove) {
            let Some(child) = subject.entity() else {
                continue;
            };
            for assignment in &subject.inverse_assignments {
                let Some(owner) = set.get(assignment.owner).and_then(Subject::entity) else {
                    continue;
                };
                if let Some(entity) = graph.get_mut(child) {
                    entity.set_relation(assignment.relation.clone(), RelationValue::one(owner));
                }
            }
        }

        // Collection members are only known once every key is written back.
        let mut collections = Vec::new();
        for subject in set.iter().filter(|s| s.tracks_collections()) {
            if subject.kind == OperationKind::Remove {
                continue;
            }
            let Some(entity_id) = subject.entity() else {
                continue;
            };
            let Some(entity) = graph.get(entity_id) else {
                continue;
            };
            for relation in subject
                .metadata()
                .relations
                .iter()
                .filter(|r| r.kind.is_to_many())
            {
                let Some(value) = entity.relation(&relation.name) else {
                    continue;
                };
                if matches!(value, RelationValue::Deferred(_)) {
                    continue;
                }
                let Some(target_meta) = self.metadata.entity(&relation.target) else {
                    continue;
                };
                let known: Vec<Identifier> = value
                    .targets()
                    .into_iter()
                    .filter_map(|target| match target {
                        RelationTarget::Entity(e) => graph
                            .get(*e)
                            .and_then(|t| target_meta.identifier_from_values(t.values())),
                        RelationTarget::Identifier(identifier) => Some(identifier.clone()),
                    })
                    .collect();
                collections.push((entity_id, relation.name.clone(), known));
            }
        }
        for (entity_id, relation, known) in collections {
            if let Some(entity) = graph.get_mut(entity_id) {
                let mut snapshot = entity.snapshot().cloned().unwrap_or_default();
                snapshot.set_relation(relation, known);
                entity.set_snapshot(Some(snapshot));
            }
        }
    }
}

/// Resolve a change set to concrete column values.
fn resolve_changes(
    set: &SubjectSet,
    changes: &[ColumnChange],
) -> persistgraph_core::Result<Vec<(String, Value)>> {
    changes
        .iter()
        .map(|change| {
            let value = match &change.new {
                ChangeValue::Value(value) => value.clone(),
                ChangeValue::Reference { subject, column } => set
                    .get(*subject)
                    .filter(|s| s.is_available())
                    .and_then(|s| s.identifier.as_ref())
                    .and_then(|id| id.get(column))
                    .cloned()
                    .ok_or_else(|| {
                        let entity = set.get(*subject).map_or("?", |s| s.entity_name());
                        Error::from(PersistError::persisted_entity_not_found(entity, subject))
                    })?,
            };
            Ok((change.column.clone(), value))
        })
        .collect()
}

/// Fire the after-event listeners for one written subject.
#[allow(clippy::result_large_err)]
pub(crate) fn fire_after(
    listeners: &mut EntityListeners,
    graph: &mut EntityGraph,
    set: &SubjectSet,
    id: SubjectId,
) -> Result<(), Error> {
    let Some(subject) = set.get(id) else {
        return Ok(());
    };
    let Some(event) = EntityEvent::after(subject.kind) else {
        return Ok(());
    };
    if subject.kind == OperationKind::Update && subject.change_set.is_empty() {
        return Ok(());
    }
    let Some(entity) = subject.entity().and_then(|e| graph.get_mut(e)) else {
        return Ok(());
    };
    listeners.fire(event, subject.metadata(), entity)?;
    Ok(())
}
