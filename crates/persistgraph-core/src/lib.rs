//! Core types and traits for persistgraph.
//!
//! This crate provides the foundations the persistence engine builds on:
//!
//! - `Value`, `Row` and `Identifier` for column data and row identity
//! - Entity metadata (`EntityMetadata`, `RelationMetadata`, cascade flags)
//!   and the injected `MetadataProvider`
//! - The in-memory object graph (`EntityGraph`) and lazy `Deferred` relations
//! - Collaborator traits: `SqlExecutor`, `TransactionScope`, `RelationLoader`
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod deferred;
pub mod entity;
pub mod error;
pub mod identifier;
pub mod metadata;
pub mod row;
pub mod value;

pub use connection::{RelationLoader, SqlExecutor, TransactionScope};
pub use deferred::{Deferred, resolve_relation};
pub use entity::{
    Entity, EntityGraph, EntityId, GraphCheckpoint, RelationTarget, RelationValue, Snapshot,
};
pub use error::{
    Error, MetadataError, PersistError, PersistErrorKind, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind,
};
pub use identifier::{Identifier, IdentityKey};
pub use metadata::{
    CascadeFlags, CascadeLookup, CascadeOperation, ColumnMetadata, DiffStrategy, EdgeDirection,
    EntityMetadata, Generation, JoinColumn, JunctionTable, MetadataProvider, MetadataRegistry,
    OrphanAction, RelationBehaviour, RelationKind, RelationMetadata, RelationSide,
    ValueTransformer,
};
pub use row::Row;
pub use value::Value;
