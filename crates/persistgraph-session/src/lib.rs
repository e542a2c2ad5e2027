//! Graph persistence for persistgraph.
//!
//! `persistgraph-session` turns an in-memory object graph into an ordered
//! sequence of row writes and runs them inside one transactional scope.
//!
//! # Pipeline
//!
//! Every `save`/`remove` call plans its roots in stages:
//!
//! 1. **Subjects** ([`SubjectBuilder`]): walk cascading relations and
//!    collect one [`Subject`] per affected row.
//! 2. **Snapshots** ([`SnapshotLoader`]): attach database state and decide
//!    whether each subject inserts, updates, removes or does nothing.
//! 3. **Change sets** ([`ChangeSetComputer`]): diff entities against their
//!    snapshots, column by column.
//! 4. **Collections** ([`JunctionManager`]): junction rows, foreign keys on
//!    rows outside the call, orphans.
//! 5. **Order** ([`DependencySorter`]): layer subjects into phases, breaking
//!    nullable cycles into deferred updates.
//! 6. **Execution** ([`TransactionExecutor`]): write phase by phase, commit
//!    or roll back as a whole.
//!
//! A failed call leaves the database untouched (when a scope is used) and
//! restores the graph to its state before the call.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(connection, loader, Arc::new(registry));
//!
//! let author = graph.add(Entity::new("Author").with_value("name", "Umed"));
//! let post = graph.add(
//!     Entity::new("Post")
//!         .with_value("title", "hello")
//!         .with_relation("author", RelationValue::one(author)),
//! );
//!
//! let report = session.save(&cx, &mut graph, &[post], &SaveOptions::default()).await;
//! ```

pub mod builder;
pub mod cascade;
pub mod change_set;
pub mod executor;
pub mod junction;
pub mod listeners;
pub mod options;
pub mod snapshot;
pub mod sorter;
pub mod subject;

pub use builder::{PersistOperation, SubjectBuilder};
pub use cascade::CascadeResolver;
pub use change_set::ChangeSetComputer;
pub use executor::{PersistReport, PhaseEntry, PreparedPlan, TransactionExecutor};
pub use junction::{AssignKind, Endpoint, JunctionManager, PendingOp, Source};
pub use listeners::{EntityEvent, EntityListeners};
pub use options::{RemoveOptions, SaveOptions, TransactionMode};
pub use snapshot::{SnapshotLoader, determine_kind};
pub use sorter::{BreakKind, BrokenEdge, DependencyEdge, DependencySorter, EdgeKind, SortedPlan};
pub use subject::{
    ChangeValue, ColumnChange, InverseAssignment, OperationKind, RelationUpdate, Subject,
    SubjectId, SubjectSet,
};

use asupersync::{Cx, Outcome};
use persistgraph_core::{
    Entity, EntityGraph, EntityId, EntityMetadata, Error, Identifier, IdentityKey,
    MetadataProvider, PersistError, RelationLoader, SqlExecutor, TransactionScope,
    resolve_relation,
};
use std::sync::Arc;
use std::time::Instant;

/// One independently planned slice of a call.
enum Chunk<'r> {
    /// Graph entities to save or remove.
    Entities(&'r [EntityId], PersistOperation),
    /// Rows of one entity type to remove by identifier.
    Identifiers(&'r Arc<EntityMetadata>, &'r [Identifier]),
}

/// Entry point for persisting object graphs.
///
/// A session holds the collaborators every call needs: the connection that
/// executes writes and owns the transactional scope, the loader used for
/// snapshots and lazy relations, the injected metadata provider, and the
/// registered entity listeners. Each call builds and discards its own
/// subject set; the session keeps no per-call state.
pub struct Session<C, L> {
    connection: C,
    loader: L,
    metadata: Arc<dyn MetadataProvider>,
    listeners: EntityListeners,
}

impl<C, L> std::fmt::Debug for Session<C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl<C, L> Session<C, L>
where
    C: SqlExecutor + TransactionScope,
    L: RelationLoader,
{
    /// Create a session over a connection, a relation loader and metadata.
    pub fn new(connection: C, loader: L, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            connection,
            loader,
            metadata,
            listeners: EntityListeners::new(),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }

    pub fn listeners(&self) -> &EntityListeners {
        &self.listeners
    }

    pub fn listeners_mut(&mut self) -> &mut EntityListeners {
        &mut self.listeners
    }

    /// Register a listener for `event` on every entity type.
    pub fn on(
        &mut self,
        event: EntityEvent,
        f: impl FnMut(&EntityMetadata, &mut Entity) -> Result<(), Error> + Send + 'static,
    ) {
        self.listeners.on(event, f);
    }

    /// Register a listener for `event` on one entity type.
    pub fn on_entity(
        &mut self,
        event: EntityEvent,
        entity: impl Into<String>,
        f: impl FnMut(&EntityMetadata, &mut Entity) -> Result<(), Error> + Send + 'static,
    ) {
        self.listeners.on_entity(event, entity, f);
    }

    /// Persist `roots` and everything reachable through cascading relations.
    ///
    /// Generated keys and values are written back into the graph and
    /// snapshots are refreshed, so saving the same graph again issues no
    /// writes.
    #[tracing::instrument(level = "info", skip(self, cx, graph, roots, options), fields(roots = roots.len()))]
    pub async fn save(
        &mut self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityId],
        options: &SaveOptions,
    ) -> Outcome<PersistReport, Error> {
        self.persist_entities(cx, graph, roots, PersistOperation::Save, options)
            .await
    }

    /// Remove `roots` and everything reachable through relations that
    /// cascade removal.
    #[tracing::instrument(level = "info", skip(self, cx, graph, roots, options), fields(roots = roots.len()))]
    pub async fn remove(
        &mut self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityId],
        options: &RemoveOptions,
    ) -> Outcome<PersistReport, Error> {
        self.persist_entities(cx, graph, roots, PersistOperation::Remove, options)
            .await
    }

    /// Remove rows of `entity_type` by primary key.
    ///
    /// Rows are not materialized, so nothing cascades from them and no
    /// entity listeners fire. Identifiers whose row does not exist are
    /// skipped.
    #[tracing::instrument(level = "info", skip(self, cx, ids, options), fields(ids = ids.len()))]
    pub async fn remove_by_id(
        &mut self,
        cx: &Cx,
        entity_type: &str,
        ids: &[Identifier],
        options: &RemoveOptions,
    ) -> Outcome<PersistReport, Error> {
        let metadata = match self.metadata.require(entity_type) {
            Ok(metadata) => metadata,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(incomplete) = ids.iter().find(|id| !id.is_complete()) {
            tracing::debug!(entity = entity_type, identifier = %incomplete, "Incomplete identifier");
            return Outcome::Err(PersistError::missing_identifier(entity_type).into());
        }

        let start = Instant::now();
        let chunks: Vec<Chunk<'_>> = split(ids, options)
            .map(|slice| Chunk::Identifiers(&metadata, slice))
            .collect();
        let mut graph = EntityGraph::new();
        let outcome = self.persist(cx, &mut graph, &chunks, options).await;
        log_outcome("Remove by identifier", &outcome, start);
        outcome
    }

    /// Load the row of `entity_type` with `id` into the graph and remove it.
    ///
    /// Unlike [`Session::remove_by_id`] the row becomes a graph entity, so
    /// removal cascades and listeners fire. Fails with `EntityNotFound` when
    /// the row does not exist.
    #[tracing::instrument(level = "info", skip(self, cx, graph, options), fields(identifier = %id))]
    pub async fn find_and_remove(
        &mut self,
        cx: &Cx,
        graph: &mut EntityGraph,
        entity_type: &str,
        id: &Identifier,
        options: &RemoveOptions,
    ) -> Outcome<PersistReport, Error> {
        let metadata = match self.metadata.require(entity_type) {
            Ok(metadata) => metadata,
            Err(e) => return Outcome::Err(e),
        };
        let row = match self.loader.load_row(cx, &metadata, id).await {
            Outcome::Ok(Some(row)) => row,
            Outcome::Ok(None) => {
                return Outcome::Err(PersistError::entity_not_found(entity_type, id).into());
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let root = graph.add(Entity::from_row(&metadata, row));
        self.persist_entities(cx, graph, &[root], PersistOperation::Remove, options)
            .await
    }

    /// Materialize the deferred relation `relation` of entity `id` into the
    /// graph and return the ids of its targets.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn load_relation(
        &self,
        cx: &Cx,
        graph: &mut EntityGraph,
        id: EntityId,
        relation: &str,
    ) -> Outcome<Vec<EntityId>, Error> {
        resolve_relation(cx, graph, id, relation, &self.loader, self.metadata.as_ref()).await
    }

    async fn persist_entities(
        &mut self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityId],
        operation: PersistOperation,
        options: &SaveOptions,
    ) -> Outcome<PersistReport, Error> {
        if let Err(e) = builder::check_roots(graph, roots) {
            return Outcome::Err(e);
        }
        let start = Instant::now();
        let chunks: Vec<Chunk<'_>> = split(roots, options)
            .map(|slice| Chunk::Entities(slice, operation))
            .collect();
        let outcome = self.persist(cx, graph, &chunks, options).await;
        let label = match operation {
            PersistOperation::Save => "Save",
            PersistOperation::Remove => "Remove",
        };
        log_outcome(label, &outcome, start);
        outcome
    }

    /// Run every chunk, restoring the graph if anything fails.
    ///
    /// Chunks always see the keys and snapshots written by earlier chunks.
    /// Without `reload` the graph is restored once the call succeeds too.
    async fn persist(
        &mut self,
        cx: &Cx,
        graph: &mut EntityGraph,
        chunks: &[Chunk<'_>],
        options: &SaveOptions,
    ) -> Outcome<PersistReport, Error> {
        let checkpoint = graph.checkpoint(graph.ids());
        let outcome = self.execute(cx, graph, chunks, options).await;
        if !matches!(outcome, Outcome::Ok(_)) {
            graph.restore(checkpoint);
            tracing::debug!("Graph restored after failed call");
        } else if !options.reload {
            graph.restore(checkpoint);
        }
        outcome
    }

    async fn execute(
        &mut self,
        cx: &Cx,
        graph: &mut EntityGraph,
        chunks: &[Chunk<'_>],
        options: &SaveOptions,
    ) -> Outcome<PersistReport, Error> {
        let Self {
            connection,
            loader,
            metadata,
            listeners,
        } = self;
        let metadata: &dyn MetadataProvider = &**metadata;
        let mut listeners = options.listeners.then_some(listeners);

        let Some((first, rest)) = chunks.split_first() else {
            return Outcome::Ok(PersistReport::default());
        };

        // Planning failures, cycles included, surface before any scope opens.
        let prepared = match prepare(cx, &*loader, metadata, graph, first, listeners.as_deref_mut())
            .await
        {
            Outcome::Ok(prepared) => prepared,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut executor = TransactionExecutor::new(&*connection, metadata, options);
        match executor.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let report = match run_chunks(
            cx,
            &executor,
            &*loader,
            metadata,
            graph,
            prepared,
            rest,
            listeners.as_deref_mut(),
        )
        .await
        {
            Outcome::Ok(report) => report,
            other => {
                executor.abort(cx).await;
                return other;
            }
        };

        match executor.commit(cx).await {
            Outcome::Ok(()) => Outcome::Ok(report),
            Outcome::Err(e) => {
                executor.abort(cx).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                executor.abort(cx).await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                executor.abort(cx).await;
                Outcome::Panicked(p)
            }
        }
    }
}

/// Split roots into chunks of at most `options.chunk_size`.
fn split<'r, T>(items: &'r [T], options: &SaveOptions) -> impl Iterator<Item = &'r [T]> + 'r {
    let size = match options.chunk_size {
        Some(size) if size > 0 => size,
        _ => items.len().max(1),
    };
    items.chunks(size)
}

/// Execute the first prepared plan, then plan and execute the remaining
/// chunks inside the same scope.
#[allow(clippy::too_many_arguments)]
async fn run_chunks<C, L>(
    cx: &Cx,
    executor: &TransactionExecutor<'_, C>,
    loader: &L,
    metadata: &dyn MetadataProvider,
    graph: &mut EntityGraph,
    mut prepared: PreparedPlan,
    rest: &[Chunk<'_>],
    mut listeners: Option<&mut EntityListeners>,
) -> Outcome<PersistReport, Error>
where
    C: SqlExecutor + TransactionScope,
    L: RelationLoader,
{
    let mut report = PersistReport::default();
    let mut remaining = rest.iter();
    loop {
        match executor
            .run(cx, graph, &mut prepared, listeners.as_deref_mut(), &mut report)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let Some(chunk) = remaining.next() else {
            return Outcome::Ok(report);
        };
        prepared = match prepare(cx, loader, metadata, graph, chunk, listeners.as_deref_mut()).await
        {
            Outcome::Ok(prepared) => prepared,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
    }
}

/// Plan one chunk: subjects, snapshots, change sets, collections, order.
#[tracing::instrument(level = "debug", skip_all)]
async fn prepare<L>(
    cx: &Cx,
    loader: &L,
    metadata: &dyn MetadataProvider,
    graph: &mut EntityGraph,
    chunk: &Chunk<'_>,
    listeners: Option<&mut EntityListeners>,
) -> Outcome<PreparedPlan, Error>
where
    L: RelationLoader,
{
    let built = match chunk {
        Chunk::Entities(roots, operation) => {
            SubjectBuilder::new(graph, metadata).build(roots, *operation)
        }
        Chunk::Identifiers(entity, ids) => Ok(removal_subjects(entity, ids)),
    };
    let mut set = match built {
        Ok(set) => set,
        Err(e) => return Outcome::Err(e),
    };

    match SnapshotLoader::new(loader, metadata)
        .load(cx, graph, &mut set)
        .await
    {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    }

    match plan(graph, metadata, set, listeners) {
        Ok(prepared) => Outcome::Ok(prepared),
        Err(e) => Outcome::Err(e),
    }
}

/// Entity-less removal subjects, one per distinct identifier.
fn removal_subjects(entity: &Arc<EntityMetadata>, ids: &[Identifier]) -> SubjectSet {
    let mut set = SubjectSet::new();
    for id in ids {
        if set
            .by_identity(&IdentityKey::new(entity.name.clone(), id))
            .is_some()
        {
            continue;
        }
        let subject = set.add(Arc::clone(entity), None, Some(id.clone()));
        if let Some(subject) = set.get_mut(subject) {
            subject.must_be_removed = true;
        }
    }
    set
}

#[allow(clippy::result_large_err)]
fn plan(
    graph: &mut EntityGraph,
    metadata: &dyn MetadataProvider,
    mut set: SubjectSet,
    listeners: Option<&mut EntityListeners>,
) -> Result<PreparedPlan, Error> {
    ChangeSetComputer::new(graph, metadata).compute(&mut set)?;

    if let Some(listeners) = listeners {
        if fire_before(listeners, graph, &set)? > 0 {
            ChangeSetComputer::new(graph, metadata).compute(&mut set)?;
        }
    }

    let mut junctions = JunctionManager::plan(graph, metadata, &mut set)?;
    let sorted = DependencySorter::sort(&mut set)?;
    junctions.defer(&set, &sorted.broken);

    tracing::debug!(
        subjects = set.len(),
        phases = sorted.phases.len(),
        broken = sorted.broken.len(),
        pending = junctions.ops().len(),
        "Chunk planned"
    );
    Ok(PreparedPlan {
        set,
        plan: sorted,
        junctions,
    })
}

/// Fire the before-event listeners of every writing subject. Returns how
/// many listeners ran.
#[allow(clippy::result_large_err)]
fn fire_before(
    listeners: &mut EntityListeners,
    graph: &mut EntityGraph,
    set: &SubjectSet,
) -> Result<usize, Error> {
    let mut fired = 0;
    for subject in set.iter() {
        let Some(event) = EntityEvent::before(subject.kind) else {
            continue;
        };
        if !listeners.listens_to(event) {
            continue;
        }
        let Some(entity) = subject.entity().and_then(|e| graph.get_mut(e)) else {
            continue;
        };
        fired += listeners.fire(event, subject.metadata(), entity)?;
    }
    Ok(fired)
}

fn log_outcome(label: &str, outcome: &Outcome<PersistReport, Error>, start: Instant) {
    match outcome {
        Outcome::Ok(report) => tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserts = report.inserts,
            updates = report.updates,
            removes = report.removes,
            junction_inserts = report.junction_inserts,
            junction_deletes = report.junction_deletes,
            deferred_updates = report.deferred_updates,
            phases = report.phases.len(),
            "{label} complete"
        ),
        Outcome::Err(e) => tracing::debug!(
            elapsed_ms = start.elapsed().as_millis(),
            error = %e,
            "{label} failed"
        ),
        Outcome::Cancelled(_) | Outcome::Panicked(_) => tracing::debug!(
            elapsed_ms = start.elapsed().as_millis(),
            "{label} aborted"
        ),
    }
}
