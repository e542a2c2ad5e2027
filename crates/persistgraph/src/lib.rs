//! persistgraph - persist graphs of related entities to a relational store.
//!
//! Hand the session a graph of entities and the roots to save or remove.
//! It works out which rows must be inserted, updated or deleted, follows
//! cascading relations, orders the writes so that every foreign key points
//! at an existing row, and runs them inside one transactional scope.
//!
//! - Entity and relation metadata live in a [`MetadataRegistry`].
//! - The store is reached through three traits: [`SqlExecutor`],
//!   [`TransactionScope`] and [`RelationLoader`].
//! - [`Session`] drives `save`, `remove`, `remove_by_id` and
//!   `find_and_remove`.
//!
//! # Quick Start
//!
//! ```ignore
//! use persistgraph::prelude::*;
//!
//! let registry = MetadataRegistry::new()
//!     .with(
//!         EntityMetadata::new("Author", "authors")
//!             .column(ColumnMetadata::new("id").primary_key().generated(Generation::Increment))
//!             .column(ColumnMetadata::new("name")),
//!     )
//!     .with(
//!         EntityMetadata::new("Post", "posts")
//!             .column(ColumnMetadata::new("id").primary_key().generated(Generation::Increment))
//!             .column(ColumnMetadata::new("title"))
//!             .relation(
//!                 RelationMetadata::many_to_one("author", "Author", "author_id")
//!                     .required()
//!                     .cascade(CascadeFlags::SAVE),
//!             ),
//!     );
//! registry.validate()?;
//!
//! let mut session = Session::new(connection.clone(), connection, Arc::new(registry));
//! let mut graph = EntityGraph::new();
//! let author = graph.add(Entity::new("Author").with_value("name", "Umed"));
//! let post = graph.add(
//!     Entity::new("Post")
//!         .with_value("title", "hello")
//!         .with_relation("author", RelationValue::one(author)),
//! );
//!
//! // INSERT INTO authors, then INSERT INTO posts with the generated author id.
//! let report = session.save(&cx, &mut graph, &[post], &SaveOptions::default()).await;
//! ```

pub use persistgraph_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Graph
    Deferred,
    Entity,
    EntityGraph,
    EntityId,
    GraphCheckpoint,
    RelationTarget,
    RelationValue,
    Snapshot,
    resolve_relation,
    // Errors
    Error,
    MetadataError,
    PersistError,
    PersistErrorKind,
    QueryError,
    QueryErrorKind,
    Result,
    TransactionError,
    TransactionErrorKind,
    // Metadata
    CascadeFlags,
    ColumnMetadata,
    EntityMetadata,
    Generation,
    JoinColumn,
    JunctionTable,
    MetadataProvider,
    MetadataRegistry,
    OrphanAction,
    RelationKind,
    RelationMetadata,
    RelationSide,
    ValueTransformer,
    // Store traits
    RelationLoader,
    SqlExecutor,
    TransactionScope,
    // Values
    Identifier,
    IdentityKey,
    Row,
    Value,
};
pub use persistgraph_session::{
    EntityEvent, EntityListeners, OperationKind, PersistReport, PhaseEntry, RemoveOptions,
    SaveOptions, Session, TransactionMode,
};

/// Lower-level access to the planning stages.
pub mod planning {
    pub use persistgraph_session::{
        BreakKind, BrokenEdge, CascadeResolver, ChangeSetComputer, ChangeValue, ColumnChange,
        DependencyEdge, DependencySorter, EdgeKind, JunctionManager, PendingOp, PersistOperation,
        PreparedPlan, SnapshotLoader, SortedPlan, Subject, SubjectBuilder, SubjectId, SubjectSet,
        TransactionExecutor, determine_kind,
    };
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        CascadeFlags, ColumnMetadata, Cx, Entity, EntityEvent, EntityGraph, EntityId,
        EntityMetadata, Error, Generation, Identifier, JunctionTable, MetadataProvider,
        MetadataRegistry, OrphanAction, Outcome, PersistReport, RelationLoader, RelationMetadata,
        RelationValue, RemoveOptions, Result, Row, SaveOptions, Session, SqlExecutor,
        TransactionMode, TransactionScope, Value,
    };
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn prelude_builds_a_valid_schema() {
        let registry = MetadataRegistry::new()
            .with(
                EntityMetadata::new("Author", "authors")
                    .column(
                        ColumnMetadata::new("id")
                            .primary_key()
                            .generated(Generation::Increment),
                    )
                    .column(ColumnMetadata::new("name"))
                    .relation(
                        RelationMetadata::one_to_many("posts", "Post", "author")
                            .cascade(CascadeFlags::ALL),
                    ),
            )
            .with(
                EntityMetadata::new("Post", "posts")
                    .column(
                        ColumnMetadata::new("id")
                            .primary_key()
                            .generated(Generation::Increment),
                    )
                    .relation(
                        RelationMetadata::many_to_one("author", "Author", "author_id")
                            .required()
                            .cascade(CascadeFlags::ALL)
                            .inverse("posts"),
                    ),
            );
        assert!(registry.validate().is_ok());
        assert!(registry.entity("Post").is_some());
    }

    #[test]
    fn report_serializes() {
        let report = PersistReport {
            inserts: 2,
            ..PersistReport::default()
        };
        let json = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(json["inserts"], 2);
        assert_eq!(report.writes(), 2);
    }

    #[test]
    fn default_options() {
        let options = SaveOptions::default();
        assert!(options.listeners);
        assert!(options.reload);
        assert_eq!(options.transaction, TransactionMode::Auto);
        assert_eq!(RemoveOptions::new().with_chunk_size(0).chunk_size, None);
    }
}
