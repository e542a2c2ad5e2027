//! Collaborator traits consumed by the persistence engine.
//!
//! - [`SqlExecutor`] - insert/update/delete of single rows
//! - [`TransactionScope`] - begin/commit/rollback/release of one scope
//! - [`RelationLoader`] - reads related rows and snapshots
//!
//! Dialect-specific SQL generation lives behind these traits. All operations
//! integrate with asupersync's structured concurrency via `Cx`.

use crate::error::Error;
use crate::identifier::Identifier;
use crate::metadata::{EntityMetadata, RelationMetadata};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// Executes single-row writes inside the caller's transactional scope.
pub trait SqlExecutor: Send + Sync {
    /// Insert a row and return the values the database produced
    /// (generated keys, default expressions). The returned row may be empty.
    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Row, Error>> + Send;

    /// Update the row matching `identifier` and return rows affected.
    fn update(
        &self,
        cx: &Cx,
        table: &str,
        identifier: &Identifier,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete the row(s) matching `identifier` and return rows affected.
    fn delete(
        &self,
        cx: &Cx,
        table: &str,
        identifier: &Identifier,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;
}

/// One transactional scope on a connection.
pub trait TransactionScope: Send + Sync {
    /// Whether a scope is currently open.
    fn is_active(&self) -> bool;

    /// Open a scope.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the open scope.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the open scope.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Return the connection once the scope is finished.
    fn release(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

/// Reads rows needed to materialize lazy relations and snapshots.
pub trait RelationLoader: Send + Sync {
    /// Load the rows related to the owner row through `relation`.
    ///
    /// Returned rows belong to the relation's target entity and are keyed
    /// by column name.
    fn load(
        &self,
        cx: &Cx,
        owner: &EntityMetadata,
        relation: &RelationMetadata,
        owner_id: &Identifier,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Load the current row of `entity` matching `identifier`.
    fn load_row(
        &self,
        cx: &Cx,
        entity: &EntityMetadata,
        identifier: &Identifier,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;
}
