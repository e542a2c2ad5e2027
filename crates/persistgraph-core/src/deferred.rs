//! Lazy relation handles.
//!
//! A [`Deferred`] stands in for a relation whose rows have not been read.
//! It remembers its owning entity (by graph id, never by pointer) and the
//! relation name, and resolves exactly once through a [`RelationLoader`].
//! Until the rows are materialized into the graph the persistence engine
//! treats the relation as untouched.

use crate::connection::RelationLoader;
use crate::entity::{Entity, EntityGraph, EntityId, RelationTarget, RelationValue};
use crate::error::{Error, PersistError};
use crate::identifier::Identifier;
use crate::metadata::{EntityMetadata, MetadataProvider};
use crate::row::Row;
use asupersync::{Cx, Outcome};
use std::sync::{Arc, OnceLock};

/// Resolve-once handle to the rows behind a relation.
///
/// Clones share the same cell, so whichever clone resolves first fills it
/// for all of them.
#[derive(Debug, Clone)]
pub struct Deferred {
    owner: EntityId,
    relation: String,
    rows: Arc<OnceLock<Vec<Row>>>,
}

impl Deferred {
    /// Create an unresolved handle.
    pub fn new(owner: EntityId, relation: impl Into<String>) -> Self {
        Self {
            owner,
            relation: relation.into(),
            rows: Arc::new(OnceLock::new()),
        }
    }

    /// Create a handle that is already resolved.
    pub fn resolved(owner: EntityId, relation: impl Into<String>, rows: Vec<Row>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(rows);
        Self {
            owner,
            relation: relation.into(),
            rows: Arc::new(cell),
        }
    }

    /// The entity that owns this relation.
    pub fn owner(&self) -> EntityId {
        self.owner
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn is_resolved(&self) -> bool {
        self.rows.get().is_some()
    }

    /// The loaded rows, if resolved.
    pub fn get(&self) -> Option<&[Row]> {
        self.rows.get().map(Vec::as_slice)
    }

    /// Load the rows through `loader` unless already resolved.
    ///
    /// Failures leave the handle unresolved so a later call may retry.
    pub async fn resolve<L>(
        &self,
        cx: &Cx,
        loader: &L,
        owner: &EntityMetadata,
        owner_id: &Identifier,
    ) -> Outcome<&[Row], Error>
    where
        L: RelationLoader + ?Sized,
    {
        if let Some(rows) = self.get() {
            return Outcome::Ok(rows);
        }

        let Some(relation) = owner.find_relation(&self.relation) else {
            return Outcome::Err(Error::unknown_entity(&format!(
                "{}.{}",
                owner.name, self.relation
            )));
        };

        tracing::debug!(
            entity = %owner.name,
            relation = %self.relation,
            owner_id = %owner_id,
            "Resolving deferred relation"
        );

        match loader.load(cx, owner, relation, owner_id).await {
            Outcome::Ok(rows) => {
                let _ = self.rows.set(rows);
                Outcome::Ok(self.get().unwrap_or_default())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

/// Resolve the deferred relation `relation` of entity `id` and replace it
/// in the graph with the materialized target entities.
///
/// Returns the ids of the entities now held by the relation. A relation
/// that is already concrete is returned as-is.
pub async fn resolve_relation<L>(
    cx: &Cx,
    graph: &mut EntityGraph,
    id: EntityId,
    relation: &str,
    loader: &L,
    metadata: &dyn MetadataProvider,
) -> Outcome<Vec<EntityId>, Error>
where
    L: RelationLoader + ?Sized,
{
    let Some(entity) = graph.get(id) else {
        return Outcome::Err(Error::Persist(PersistError::persisted_entity_not_found(
            "?",
            id,
        )));
    };
    let owner_meta = match metadata.require(entity.entity_type()) {
        Ok(m) => m,
        Err(e) => return Outcome::Err(e),
    };

    let deferred = match entity.relation(relation) {
        Some(RelationValue::Deferred(d)) => d.clone(),
        Some(value) => {
            let ids = value
                .targets()
                .into_iter()
                .filter_map(|t| match t {
                    RelationTarget::Entity(e) => Some(*e),
                    RelationTarget::Identifier(_) => None,
                })
                .collect();
            return Outcome::Ok(ids);
        }
        None => return Outcome::Ok(Vec::new()),
    };

    let Some(owner_id) = owner_meta.identifier_from_values(entity.values()) else {
        return Outcome::Err(Error::Persist(PersistError::missing_identifier(
            &owner_meta.name,
        )));
    };
    let Some(relation_meta) = owner_meta.find_relation(relation) else {
        return Outcome::Err(Error::unknown_entity(&format!(
            "{}.{relation}",
            owner_meta.name
        )));
    };
    let target_meta = match metadata.require(&relation_meta.target) {
        Ok(m) => m,
        Err(e) => return Outcome::Err(e),
    };
    let to_many = relation_meta.kind.is_to_many();

    let rows = match deferred.resolve(cx, loader, &owner_meta, &owner_id).await {
        Outcome::Ok(rows) => rows.to_vec(),
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let known: Vec<Identifier> = rows
        .iter()
        .filter_map(|row| target_meta.identifier_from_row(row))
        .collect();
    let ids: Vec<EntityId> = rows
        .into_iter()
        .map(|row| graph.add(Entity::from_row(&target_meta, row)))
        .collect();

    let value = if to_many {
        RelationValue::many(ids.iter().copied())
    } else {
        match ids.first() {
            Some(first) => RelationValue::one(*first),
            None => RelationValue::Null,
        }
    };

    if let Some(owner) = graph.get_mut(id) {
        owner.set_relation(relation, value);
        // The loaded collection is what the database holds now.
        if to_many {
            if let Some(snapshot) = owner.snapshot().cloned() {
                owner.set_snapshot(Some(snapshot.with_relation(relation, known)));
            }
        }
    }

    Outcome::Ok(ids)
}
