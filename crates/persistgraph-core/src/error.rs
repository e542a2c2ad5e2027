//! Error types for persistence operations.

use std::fmt;

/// The primary error type for all persistgraph operations.
#[derive(Debug)]
pub enum Error {
    /// Failures reported by the SQL execution interface or relation loader
    Query(QueryError),
    /// Transaction scope errors
    Transaction(TransactionError),
    /// Missing or inconsistent entity metadata
    Metadata(MetadataError),
    /// Graph-to-operations translation errors
    Persist(PersistError),
    /// An entity listener rejected the operation
    Listener(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Connection lost during operation
    Connection,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A scope was required but none is active
    NotActive,
    /// A scope is already open on the connection
    AlreadyActive,
    /// Commit failed
    Commit,
    /// Rollback failed
    Rollback,
}

#[derive(Debug)]
pub struct MetadataError {
    pub entity: String,
    pub message: String,
}

/// Errors raised while turning an entity graph into write operations.
#[derive(Debug)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    /// Entity (or chain of entities) the error was raised for.
    pub entities: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    /// A dependency cycle contains no nullable edge to break it
    CircularRelations,
    /// A non-nullable relation has no resolvable target
    MissingRequiredRelation,
    /// A prepared subject vanished before execution (internal invariant)
    PersistedEntityNotFound,
    /// The target row of a find-then-remove flow does not exist
    EntityNotFound,
    /// A row has no complete primary key where one is needed
    MissingIdentifier,
}

impl PersistError {
    /// Create a persist error for a single entity.
    pub fn new(kind: PersistErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entities: vec![entity.into()],
            message: message.into(),
        }
    }

    /// Cycle without a nullable edge; `path` lists the entities around it.
    pub fn circular_relations(path: Vec<String>) -> Self {
        let message = format!(
            "circular relations without a nullable edge: {}",
            path.join(" -> ")
        );
        Self {
            kind: PersistErrorKind::CircularRelations,
            entities: path,
            message,
        }
    }

    /// A required relation could not be resolved.
    pub fn missing_required_relation(entity: &str, relation: &str) -> Self {
        Self::new(
            PersistErrorKind::MissingRequiredRelation,
            entity,
            format!("required relation '{entity}.{relation}' has no resolvable target"),
        )
    }

    /// A subject expected in the prepared set is missing.
    pub fn persisted_entity_not_found(entity: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            PersistErrorKind::PersistedEntityNotFound,
            entity,
            format!("prepared subject for '{entity}' not found at execution time: {detail}"),
        )
    }

    /// The row to remove does not exist.
    pub fn entity_not_found(entity: &str, identifier: impl fmt::Display) -> Self {
        Self::new(
            PersistErrorKind::EntityNotFound,
            entity,
            format!("no '{entity}' row matches {identifier}"),
        )
    }

    /// A row has no complete primary key.
    pub fn missing_identifier(entity: &str) -> Self {
        Self::new(
            PersistErrorKind::MissingIdentifier,
            entity,
            format!("'{entity}' has no complete primary key"),
        )
    }
}

impl Error {
    /// Get the persist error kind, if this is a persist error.
    pub fn persist_kind(&self) -> Option<PersistErrorKind> {
        match self {
            Error::Persist(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a `CircularRelations` error?
    pub fn is_circular_relations(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::CircularRelations)
    }

    /// Is this a `MissingRequiredRelation` error?
    pub fn is_missing_required_relation(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::MissingRequiredRelation)
    }

    /// Is this a `PersistedEntityNotFound` error?
    pub fn is_persisted_entity_not_found(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::PersistedEntityNotFound)
    }

    /// Is this an `EntityNotFound` error?
    pub fn is_entity_not_found(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::EntityNotFound)
    }

    /// Is this a constraint violation reported by the database?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Create an error for an unknown entity type.
    pub fn unknown_entity(entity: &str) -> Self {
        Error::Metadata(MetadataError {
            entity: entity.to_string(),
            message: format!("no metadata registered for entity '{entity}'"),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => match &e.table {
                Some(table) => write!(f, "Query error on '{}': {}", table, e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e.message),
            Error::Persist(e) => write!(f, "Persist error: {}", e.message),
            Error::Listener(msg) => write!(f, "Listener error: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        Error::Persist(err)
    }
}

/// Result type alias for persistgraph operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_kind_helpers() {
        let err = Error::from(PersistError::circular_relations(vec![
            "A".to_string(),
            "B".to_string(),
            "A".to_string(),
        ]));
        assert!(err.is_circular_relations());
        assert!(!err.is_missing_required_relation());
        assert_eq!(
            err.to_string(),
            "Persist error: circular relations without a nullable edge: A -> B -> A"
        );

        let err = Error::from(PersistError::missing_required_relation("Post", "author"));
        assert!(err.is_missing_required_relation());
        assert!(err.to_string().contains("Post.author"));
    }

    #[test]
    fn constraint_flag() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            table: Some("posts".to_string()),
            message: "foreign key violation".to_string(),
            source: None,
        });
        assert!(err.is_constraint_violation());
        assert_eq!(err.persist_kind(), None);
        assert_eq!(
            err.to_string(),
            "Query error on 'posts': foreign key violation"
        );
    }
}
