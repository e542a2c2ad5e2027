//! In-memory recording database shared by the session tests.
//!
//! Implements all three collaborator traits over one `Arc<Mutex<_>>` state:
//! tables of rows keyed by column name, auto-increment counters, a statement
//! log, a transactional snapshot restored on rollback, and one-shot failure
//! injection.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use persistgraph_core::{
    CascadeFlags, ColumnMetadata, EntityMetadata, Error, Generation, Identifier, JoinColumn,
    JunctionTable, MetadataProvider, MetadataRegistry, QueryError, QueryErrorKind,
    RelationKind, RelationLoader, RelationMetadata, Row, SqlExecutor, TransactionScope, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// One statement seen by the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    Release,
    Insert {
        table: String,
        values: Row,
    },
    Update {
        table: String,
        identifier: Identifier,
        values: Row,
    },
    Delete {
        table: String,
        identifier: Identifier,
    },
}

impl Statement {
    /// Whether the statement writes a row.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
        )
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Short form used in assertions, e.g. `insert authors`.
    pub fn label(&self) -> String {
        match self {
            Statement::Begin => "begin".to_string(),
            Statement::Commit => "commit".to_string(),
            Statement::Rollback => "rollback".to_string(),
            Statement::Release => "release".to_string(),
            Statement::Insert { table, .. } => format!("insert {table}"),
            Statement::Update { table, .. } => format!("update {table}"),
            Statement::Delete { table, .. } => format!("delete {table}"),
        }
    }
}

type Tables = BTreeMap<String, Vec<Row>>;

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    increments: HashMap<String, (String, i64)>,
    log: Vec<Statement>,
    active: bool,
    saved: Option<(Tables, HashMap<String, (String, i64)>)>,
    fail: Option<(String, String)>,
}

impl State {
    fn check_failure(&mut self, op: &str, table: &str) -> Result<(), Error> {
        let hit = self
            .fail
            .as_ref()
            .is_some_and(|(o, t)| o == op && t == table);
        if hit {
            self.fail = None;
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                table: Some(table.to_string()),
                message: format!("injected {op} failure"),
                source: None,
            }));
        }
        Ok(())
    }
}

fn row_matches(row: &Row, identifier: &Identifier) -> bool {
    identifier
        .pairs()
        .iter()
        .all(|(column, value)| row.get(column) == Some(value))
}

/// Cloneable handle to the shared in-memory database.
#[derive(Debug, Clone)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
    metadata: Arc<MetadataRegistry>,
}

impl MemoryDb {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            metadata,
        }
    }

    /// Let the database assign `column` of `table` on insert.
    pub fn with_increment(self, table: &str, column: &str) -> Self {
        self.state
            .lock()
            .expect("lock poisoned")
            .increments
            .insert(table.to_string(), (column.to_string(), 1));
        self
    }

    /// Store a row without logging it.
    pub fn seed(&self, table: &str, row: Row) {
        let mut guard = self.state.lock().expect("lock poisoned");
        if let Some((column, next)) = guard.increments.get_mut(table) {
            if let Some(id) = row.get(column).and_then(Value::as_i64) {
                *next = (*next).max(id + 1);
            }
        }
        guard.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        let guard = self.state.lock().expect("lock poisoned");
        guard.tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, identifier: &Identifier) -> Option<Row> {
        self.rows(table).into_iter().find(|r| row_matches(r, identifier))
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.state.lock().expect("lock poisoned").log.clone()
    }

    /// Row writes only, in order.
    pub fn writes(&self) -> Vec<Statement> {
        self.statements()
            .into_iter()
            .filter(Statement::is_write)
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.writes().iter().map(Statement::label).collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().expect("lock poisoned").log.clear();
    }

    /// Fail the next `op` ("insert", "update", "delete") on `table`.
    pub fn fail_on(&self, op: &str, table: &str) {
        self.state.lock().expect("lock poisoned").fail = Some((op.to_string(), table.to_string()));
    }

    pub fn is_scope_active(&self) -> bool {
        self.state.lock().expect("lock poisoned").active
    }

    fn load_related(
        &self,
        owner: &EntityMetadata,
        relation: &RelationMetadata,
        owner_id: &Identifier,
    ) -> Result<Vec<Row>, Error> {
        let target = self.metadata.require(&relation.target)?;
        let guard = self.state.lock().expect("lock poisoned");
        let table = |name: &str| guard.tables.get(name).cloned().unwrap_or_default();

        let by_columns = |rows: Vec<Row>, columns: &[JoinColumn], source: &Identifier| {
            rows.into_iter()
                .filter(|row| {
                    columns.iter().all(|jc| {
                        row.get(&jc.column).is_some()
                            && row.get(&jc.column) == source.get(&jc.referenced_column)
                    })
                })
                .collect::<Vec<_>>()
        };

        let through_junction = |junction: &JunctionTable, owner_side: bool| {
            let (mine, theirs) = if owner_side {
                (&junction.owner_columns, &junction.inverse_columns)
            } else {
                (&junction.inverse_columns, &junction.owner_columns)
            };
            let links = by_columns(table(&junction.table), mine.as_slice(), owner_id);
            let targets = table(&target.table);
            let mut found = Vec::new();
            for link in links {
                let key = Identifier::new(theirs.iter().filter_map(|jc| {
                    link.get(&jc.column)
                        .map(|v| (jc.referenced_column.clone(), v.clone()))
                }));
                found.extend(targets.iter().filter(|r| row_matches(r, &key)).cloned());
            }
            found
        };

        let rows = match (relation.kind, relation.is_owning()) {
            (RelationKind::ManyToMany, true) => match &relation.junction {
                Some(junction) => through_junction(junction, true),
                None => Vec::new(),
            },
            (RelationKind::ManyToMany, false) => {
                match self.metadata.counterpart(relation)? {
                    Some((_, owning)) => match &owning.junction {
                        Some(junction) => through_junction(junction, false),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                }
            }
            (_, true) => {
                let own = table(&owner.table)
                    .into_iter()
                    .find(|r| row_matches(r, owner_id));
                match own {
                    Some(own) => {
                        let key = Identifier::new(relation.join_columns.iter().filter_map(|jc| {
                            own.get(&jc.column)
                                .filter(|v| !v.is_null())
                                .map(|v| (jc.referenced_column.clone(), v.clone()))
                        }));
                        if key.is_empty() {
                            Vec::new()
                        } else {
                            table(&target.table)
                                .into_iter()
                                .filter(|r| row_matches(r, &key))
                                .collect()
                        }
                    }
                    None => Vec::new(),
                }
            }
            (_, false) => match self.metadata.counterpart(relation)? {
                Some((_, owning)) => {
                    by_columns(table(&target.table), owning.join_columns.as_slice(), owner_id)
                }
                None => Vec::new(),
            },
        };
        Ok(rows)
    }
}

impl SqlExecutor for MemoryDb {
    fn insert(
        &self,
        _cx: &Cx,
        table: &str,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Row, Error>> + Send {
        let state = Arc::clone(&self.state);
        let table = table.to_string();
        let values = values.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            if let Err(e) = guard.check_failure("insert", &table) {
                return Outcome::Err(e);
            }
            let mut row = Row::from_pairs(values);
            let mut returned = Row::new();
            if let Some((column, next)) = guard.increments.get_mut(&table) {
                if row.get(column).is_none_or(Value::is_null) {
                    returned.set(column.clone(), Value::BigInt(*next));
                    row.set(column.clone(), Value::BigInt(*next));
                    *next += 1;
                }
            }
            guard.log.push(Statement::Insert {
                table: table.clone(),
                values: row.clone(),
            });
            guard.tables.entry(table).or_default().push(row);
            Outcome::Ok(returned)
        }
    }

    fn update(
        &self,
        _cx: &Cx,
        table: &str,
        identifier: &Identifier,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let table = table.to_string();
        let identifier = identifier.clone();
        let values = values.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            if let Err(e) = guard.check_failure("update", &table) {
                return Outcome::Err(e);
            }
            let mut affected = 0;
            for row in guard.tables.entry(table.clone()).or_default() {
                if row_matches(row, &identifier) {
                    for (column, value) in &values {
                        row.set(column.clone(), value.clone());
                    }
                    affected += 1;
                }
            }
            guard.log.push(Statement::Update {
                table,
                identifier,
                values: Row::from_pairs(values),
            });
            Outcome::Ok(affected)
        }
    }

    fn delete(
        &self,
        _cx: &Cx,
        table: &str,
        identifier: &Identifier,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let table = table.to_string();
        let identifier = identifier.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            if let Err(e) = guard.check_failure("delete", &table) {
                return Outcome::Err(e);
            }
            let rows = guard.tables.entry(table.clone()).or_default();
            let before = rows.len();
            rows.retain(|r| !row_matches(r, &identifier));
            let affected = (before - rows.len()) as u64;
            guard.log.push(Statement::Delete { table, identifier });
            Outcome::Ok(affected)
        }
    }
}

impl TransactionScope for MemoryDb {
    fn is_active(&self) -> bool {
        self.is_scope_active()
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.active = true;
            guard.saved = Some((guard.tables.clone(), guard.increments.clone()));
            guard.log.push(Statement::Begin);
            Outcome::Ok(())
        }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.active = false;
            guard.saved = None;
            guard.log.push(Statement::Commit);
            Outcome::Ok(())
        }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            if let Some((tables, increments)) = guard.saved.take() {
                guard.tables = tables;
                guard.increments = increments;
            }
            guard.active = false;
            guard.log.push(Statement::Rollback);
            Outcome::Ok(())
        }
    }

    fn release(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").log.push(Statement::Release);
            Outcome::Ok(())
        }
    }
}

impl RelationLoader for MemoryDb {
    fn load(
        &self,
        _cx: &Cx,
        owner: &EntityMetadata,
        relation: &RelationMetadata,
        owner_id: &Identifier,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.load_related(owner, relation, owner_id);
        async move {
            match result {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn load_row(
        &self,
        _cx: &Cx,
        entity: &EntityMetadata,
        identifier: &Identifier,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let found = self.row(&entity.table, identifier);
        async move { Outcome::Ok(found) }
    }
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
    }
}

/// Run `f` on a fresh current-thread runtime.
pub fn run<F: Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

fn key() -> ColumnMetadata {
    ColumnMetadata::new("id")
        .primary_key()
        .generated(Generation::Increment)
}

/// Blog schema: authors write posts, posts carry tags and comments.
///
/// - `Post.author` is a required many-to-one with `cascade`.
/// - `Author.posts` is the matching one-to-many.
/// - `Post.tags` owns the `post_tags` junction, `Tag.posts` is its inverse.
/// - `Post.comments` is a one-to-many with `comment_orphans` as orphan action.
pub fn blog(author_cascade: CascadeFlags, comment_orphans: persistgraph_core::OrphanAction) -> MetadataRegistry {
    MetadataRegistry::new()
        .with(
            EntityMetadata::new("Author", "authors")
                .column(key())
                .column(ColumnMetadata::new("name"))
                .relation(
                    RelationMetadata::one_to_many("posts", "Post", "author")
                        .cascade(CascadeFlags::ALL),
                ),
        )
        .with(
            EntityMetadata::new("Post", "posts")
                .column(key())
                .column(ColumnMetadata::new("title"))
                .column(ColumnMetadata::new("version").version_column())
                .relation(
                    RelationMetadata::many_to_one("author", "Author", "author_id")
                        .required()
                        .cascade(author_cascade)
                        .inverse("posts"),
                )
                .relation(
                    RelationMetadata::many_to_many("tags", "Tag")
                        .junction(JunctionTable::new("post_tags", "post_id", "tag_id"))
                        .cascade(CascadeFlags::SAVE)
                        .inverse("posts"),
                )
                .relation(
                    RelationMetadata::one_to_many("comments", "Comment", "post")
                        .cascade(CascadeFlags::ALL)
                        .orphan(comment_orphans),
                ),
        )
        .with(
            EntityMetadata::new("Tag", "tags")
                .column(key())
                .column(ColumnMetadata::new("label"))
                .relation(RelationMetadata::many_to_many("posts", "Post").inverse("tags")),
        )
        .with(
            EntityMetadata::new("Comment", "comments")
                .column(key())
                .column(ColumnMetadata::new("body"))
                .relation(
                    RelationMetadata::many_to_one("post", "Post", "post_id")
                        .cascade(CascadeFlags::ALL)
                        .inverse("comments"),
                ),
        )
}

/// Database over `registry` with auto-increment keys on every blog table.
pub fn blog_db(registry: &Arc<MetadataRegistry>) -> MemoryDb {
    MemoryDb::new(Arc::clone(registry))
        .with_increment("authors", "id")
        .with_increment("posts", "id")
        .with_increment("tags", "id")
        .with_increment("comments", "id")
}
