//! Snapshot loading and operation kind determination.

use crate::subject::{OperationKind, SubjectId, SubjectSet};
use asupersync::{Cx, Outcome};
use persistgraph_core::{
    EntityGraph, Error, Identifier, MetadataProvider, PersistError, RelationKind, RelationLoader,
    RelationValue, Snapshot,
};

/// Loads the database state each subject is diffed against and decides
/// whether the subject inserts, updates, removes or does nothing.
pub struct SnapshotLoader<'a, L: ?Sized> {
    loader: &'a L,
    metadata: &'a dyn MetadataProvider,
}

impl<'a, L> SnapshotLoader<'a, L>
where
    L: RelationLoader + ?Sized,
{
    pub fn new(loader: &'a L, metadata: &'a dyn MetadataProvider) -> Self {
        Self { loader, metadata }
    }

    /// Attach snapshots, assign operation kinds and load the previously
    /// known members of every collection that will be diffed.
    pub async fn load(
        &self,
        cx: &Cx,
        graph: &EntityGraph,
        set: &mut SubjectSet,
    ) -> Outcome<(), Error> {
        let ids: Vec<SubjectId> = set.ids().collect();

        for id in &ids {
            match self.load_snapshot(cx, graph, set, *id).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            set.register_identity(*id);
        }

        for id in &ids {
            if let Err(e) = determine_kind(set, *id) {
                return Outcome::Err(e);
            }
        }

        for id in &ids {
            match self.load_collections(cx, graph, set, *id).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(
            inserts = set.count(OperationKind::Insert),
            updates = set.count(OperationKind::Update),
            removes = set.count(OperationKind::Remove),
            "Operation kinds determined"
        );
        Outcome::Ok(())
    }

    async fn load_snapshot(
        &self,
        cx: &Cx,
        graph: &EntityGraph,
        set: &mut SubjectSet,
        id: SubjectId,
    ) -> Outcome<(), Error> {
        let Some(subject) = set.get(id) else {
            return Outcome::Err(PersistError::persisted_entity_not_found("?", id).into());
        };
        let metadata = subject.metadata().clone();

        let (identifier, snapshot) = match subject.entity().and_then(|e| graph.get(e)) {
            Some(entity) => (
                metadata.identifier_from_values(entity.values()),
                entity.snapshot().cloned(),
            ),
            None => (subject.identifier.clone(), None),
        };

        let snapshot = match (snapshot, &identifier) {
            (Some(snapshot), _) => Some(snapshot),
            (None, Some(identifier)) if identifier.is_complete() => {
                match self.loader.load_row(cx, &metadata, identifier).await {
                    Outcome::Ok(row) => row.map(Snapshot::new),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            (None, _) => None,
        };

        if let Some(subject) = set.get_mut(id) {
            subject.identifier = identifier;
            subject.snapshot = snapshot;
        }
        Outcome::Ok(())
    }

    async fn load_collections(
        &self,
        cx: &Cx,
        graph: &EntityGraph,
        set: &mut SubjectSet,
        id: SubjectId,
    ) -> Outcome<(), Error> {
        let Some(subject) = set.get(id) else {
            return Outcome::Ok(());
        };
        if !matches!(subject.kind, OperationKind::Update | OperationKind::Remove) {
            return Outcome::Ok(());
        }
        let (Some(identifier), Some(snapshot)) = (&subject.identifier, &subject.snapshot) else {
            return Outcome::Ok(());
        };
        let removing = subject.kind == OperationKind::Remove;
        let metadata = subject.metadata().clone();
        let identifier = identifier.clone();
        let mut snapshot = snapshot.clone();
        let entity = subject.entity().and_then(|e| graph.get(e));

        let mut loaded = false;
        for relation in &metadata.relations {
            if !relation.kind.is_to_many() || snapshot.relation(&relation.name).is_some() {
                continue;
            }
            let set_in_graph = entity
                .and_then(|e| e.relation(&relation.name))
                .is_some_and(|v| !matches!(v, RelationValue::Deferred(_)));
            let needed = if removing {
                relation.kind == RelationKind::ManyToMany
            } else {
                set_in_graph
            };
            if !needed {
                continue;
            }

            let target = match self.metadata.require(&relation.target) {
                Ok(target) => target,
                Err(e) => return Outcome::Err(e),
            };
            let rows = match self.loader.load(cx, &metadata, relation, &identifier).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let known: Vec<Identifier> = rows
                .iter()
                .filter_map(|row| target.identifier_from_row(row))
                .collect();
            tracing::trace!(
                entity = %metadata.name,
                relation = %relation.name,
                known = known.len(),
                "Loaded previous collection members"
            );
            snapshot.set_relation(relation.name.clone(), known);
            loaded = true;
        }

        if loaded {
            if let Some(subject) = set.get_mut(id) {
                subject.snapshot = Some(snapshot);
            }
        }
        Outcome::Ok(())
    }
}

/// Decide the operation kind of one subject from its flags and snapshot.
pub fn determine_kind(set: &mut SubjectSet, id: SubjectId) -> persistgraph_core::Result<()> {
    let Some(subject) = set.get_mut(id) else {
        return Ok(());
    };
    let exists = subject.snapshot.is_some();
    subject.kind = if subject.must_be_removed {
        if exists {
            OperationKind::Remove
        } else if subject.identifier.is_none() {
            return Err(PersistError::missing_identifier(subject.entity_name()).into());
        } else {
            OperationKind::NoOp
        }
    } else if exists {
        if subject.can_be_updated {
            OperationKind::Update
        } else {
            OperationKind::NoOp
        }
    } else if subject.can_be_inserted {
        OperationKind::Insert
    } else {
        OperationKind::NoOp
    };
    Ok(())
}
