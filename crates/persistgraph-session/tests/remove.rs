//! End-to-end `remove`, `remove_by_id` and `find_and_remove`.

mod common;

use asupersync::Cx;
use common::{MemoryDb, blog, blog_db, expect_err, run, unwrap_outcome};
use persistgraph_core::{
    CascadeFlags, ColumnMetadata, Deferred, Entity, EntityGraph, EntityId, EntityMetadata,
    Generation, Identifier, MetadataProvider, MetadataRegistry, OrphanAction, PersistErrorKind,
    RelationMetadata, RelationValue, Row, Value,
};
use persistgraph_session::{EntityEvent, RemoveOptions, Session};
use std::sync::{Arc, Mutex};

fn session(registry: &Arc<MetadataRegistry>, db: &MemoryDb) -> Session<MemoryDb, MemoryDb> {
    let metadata: Arc<dyn MetadataProvider> = registry.clone();
    Session::new(db.clone(), db.clone(), metadata)
}

fn entity_from_row(registry: &MetadataRegistry, entity: &str, row: Row) -> Entity {
    let metadata = registry.require(entity).expect("registered entity");
    Entity::from_row(&metadata, row)
}

fn post_row(id: i64) -> Row {
    Row::new()
        .with("id", id)
        .with("title", format!("p{id}"))
        .with("author_id", 1_i64)
        .with("version", 1_i64)
}

fn comment_row(id: i64, post: i64) -> Row {
    Row::new()
        .with("id", id)
        .with("body", format!("c{id}"))
        .with("post_id", post)
}

/// One author, post 1 with comments 1 and 2, tags 1 and 2 linked to post 1.
fn seeded() -> (Arc<MetadataRegistry>, MemoryDb) {
    let registry = Arc::new(blog(CascadeFlags::SAVE, OrphanAction::Nullify));
    let db = blog_db(&registry);
    db.seed("authors", Row::new().with("id", 1_i64).with("name", "Umed"));
    db.seed("posts", post_row(1));
    db.seed("comments", comment_row(1, 1));
    db.seed("comments", comment_row(2, 1));
    for tag in 1..=2_i64 {
        db.seed("tags", Row::new().with("id", tag).with("label", format!("t{tag}")));
        db.seed(
            "post_tags",
            Row::new().with("post_id", 1_i64).with("tag_id", tag),
        );
    }
    (registry, db)
}

#[test]
fn children_are_removed_before_their_parent() {
    let (registry, db) = seeded();
    let mut graph = EntityGraph::new();
    let comments: Vec<EntityId> = [1, 2]
        .into_iter()
        .map(|id| graph.add(entity_from_row(&registry, "Comment", comment_row(id, 1))))
        .collect();
    let post = graph.add(
        entity_from_row(&registry, "Post", post_row(1))
            .with_relation("comments", RelationValue::many(comments.iter().copied())),
    );

    let report = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        unwrap_outcome(
            session
                .remove(&cx, &mut graph, &[post], &RemoveOptions::default())
                .await,
        )
    });

    assert_eq!(
        db.labels(),
        vec![
            "delete post_tags",
            "delete post_tags",
            "delete comments",
            "delete comments",
            "delete posts"
        ]
    );
    assert_eq!(report.removes, 3);
    assert_eq!(report.junction_deletes, 2);
    assert!(db.rows("posts").is_empty());
    assert!(db.rows("comments").is_empty());
    assert!(db.rows("post_tags").is_empty());
    // Tags are not owned by the post.
    assert_eq!(db.rows("tags").len(), 2);
    assert_eq!(db.rows("authors").len(), 1);
    assert!(graph.get(post).and_then(Entity::snapshot).is_none());
}

#[test]
fn remove_by_id_skips_missing_rows_and_duplicates() {
    let (registry, db) = seeded();
    let ids = [
        Identifier::single("id", 1_i64),
        Identifier::single("id", 1_i64),
        Identifier::single("id", 99_i64),
    ];

    let report = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        unwrap_outcome(
            session
                .remove_by_id(&cx, "Tag", &ids, &RemoveOptions::default())
                .await,
        )
    });

    assert_eq!(db.labels(), vec!["delete post_tags", "delete tags"]);
    assert_eq!(report.removes, 1);
    assert_eq!(report.junction_deletes, 1);
    let remaining: Vec<i64> = db
        .rows("post_tags")
        .iter()
        .filter_map(|row| row.get("tag_id").and_then(Value::as_i64))
        .collect();
    assert_eq!(remaining, vec![2]);
}

#[test]
fn remove_by_id_does_not_fire_listeners() {
    let (registry, db) = seeded();
    let seen = Arc::new(Mutex::new(Vec::new()));

    run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        let log = Arc::clone(&seen);
        session.on(EntityEvent::BeforeRemove, move |meta, _| {
            log.lock().expect("lock poisoned").push(meta.name.clone());
            Ok(())
        });
        unwrap_outcome(
            session
                .remove_by_id(
                    &cx,
                    "Comment",
                    &[Identifier::single("id", 2_i64)],
                    &RemoveOptions::default(),
                )
                .await,
        );
    });

    assert!(seen.lock().expect("lock poisoned").is_empty());
    assert_eq!(db.labels(), vec!["delete comments"]);
}

#[test]
fn remove_by_id_rejects_incomplete_identifiers() {
    let (registry, db) = seeded();

    let err = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        expect_err(
            session
                .remove_by_id(
                    &cx,
                    "Tag",
                    &[Identifier::single("id", Value::Null)],
                    &RemoveOptions::default(),
                )
                .await,
        )
    });

    assert_eq!(err.persist_kind(), Some(PersistErrorKind::MissingIdentifier));
    assert!(db.statements().is_empty());
}

#[test]
fn find_and_remove_cascades_like_remove() {
    let (registry, db) = seeded();
    let removed = Arc::new(Mutex::new(Vec::new()));
    let mut graph = EntityGraph::new();

    let report = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        let log = Arc::clone(&removed);
        session.on(EntityEvent::AfterRemove, move |meta, _| {
            log.lock().expect("lock poisoned").push(meta.name.clone());
            Ok(())
        });
        unwrap_outcome(
            session
                .find_and_remove(
                    &cx,
                    &mut graph,
                    "Comment",
                    &Identifier::single("id", 1_i64),
                    &RemoveOptions::default(),
                )
                .await,
        )
    });

    assert_eq!(report.removes, 1);
    assert_eq!(db.labels(), vec!["delete comments"]);
    assert_eq!(*removed.lock().expect("lock poisoned"), vec!["Comment"]);
    assert_eq!(graph.len(), 1);
}

#[test]
fn find_and_remove_reports_missing_rows() {
    let (registry, db) = seeded();
    let mut graph = EntityGraph::new();

    let err = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        expect_err(
            session
                .find_and_remove(
                    &cx,
                    &mut graph,
                    "Post",
                    &Identifier::single("id", 42_i64),
                    &RemoveOptions::default(),
                )
                .await,
        )
    });

    assert!(err.is_entity_not_found());
    assert!(db.statements().is_empty());
}

/// `Left.right` and `Right.left` reference each other and both cascade.
fn pair(required: bool) -> MetadataRegistry {
    let side = |entity: &str, table: &str, relation: &str, target: &str, column: &str| {
        let mut relation = RelationMetadata::many_to_one(relation, target, column)
            .cascade(CascadeFlags::ALL);
        if required {
            relation = relation.required();
        }
        EntityMetadata::new(entity, table)
            .column(
                ColumnMetadata::new("id")
                    .primary_key()
                    .generated(Generation::Increment),
            )
            .relation(relation)
    };
    MetadataRegistry::new()
        .with(side("Left", "lefts", "right", "Right", "right_id"))
        .with(side("Right", "rights", "left", "Left", "left_id"))
}

fn seeded_pair(required: bool) -> (Arc<MetadataRegistry>, MemoryDb, EntityGraph, EntityId) {
    let registry = Arc::new(pair(required));
    let db = MemoryDb::new(Arc::clone(&registry));
    let left_row = Row::new().with("id", 1_i64).with("right_id", 1_i64);
    let right_row = Row::new().with("id", 1_i64).with("left_id", 1_i64);
    db.seed("lefts", left_row.clone());
    db.seed("rights", right_row.clone());

    let mut graph = EntityGraph::new();
    let left = graph.add(entity_from_row(&registry, "Left", left_row));
    let right = graph.add(
        entity_from_row(&registry, "Right", right_row)
            .with_relation("left", RelationValue::one(left)),
    );
    if let Some(entity) = graph.get_mut(left) {
        entity.set_relation("right", RelationValue::one(right));
    }
    (registry, db, graph, left)
}

#[test]
fn nullable_removal_cycle_detaches_first() {
    let (registry, db, mut graph, left) = seeded_pair(false);

    let report = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        unwrap_outcome(
            session
                .remove(&cx, &mut graph, &[left], &RemoveOptions::default())
                .await,
        )
    });

    let labels = db.labels();
    assert_eq!(labels.len(), 3);
    assert!(labels[0].starts_with("update "));
    assert_eq!(report.removes, 2);
    assert_eq!(report.deferred_updates, 1);
    assert!(db.rows("lefts").is_empty());
    assert!(db.rows("rights").is_empty());
}

#[test]
fn required_removal_cycle_is_rejected() {
    let (registry, db, mut graph, left) = seeded_pair(true);

    let err = run(async {
        let cx = Cx::for_testing();
        let mut session = session(&registry, &db);
        expect_err(
            session
                .remove(&cx, &mut graph, &[left], &RemoveOptions::default())
                .await,
        )
    });

    assert!(err.is_circular_relations());
    assert!(db.statements().is_empty());
    assert_eq!(db.rows("lefts").len(), 1);
}

#[test]
fn deferred_collection_loads_on_demand() {
    let (registry, db) = seeded();
    db.seed("posts", post_row(2));
    let mut graph = EntityGraph::new();
    let author = graph.add(entity_from_row(
        &registry,
        "Author",
        Row::new().with("id", 1_i64).with("name", "Umed"),
    ));
    if let Some(entity) = graph.get_mut(author) {
        entity.set_relation("posts", RelationValue::Deferred(Deferred::new(author, "posts")));
    }

    let posts = run(async {
        let cx = Cx::for_testing();
        let session = session(&registry, &db);
        unwrap_outcome(session.load_relation(&cx, &mut graph, author, "posts").await)
    });

    assert_eq!(posts.len(), 2);
    let titles: Vec<_> = posts
        .iter()
        .filter_map(|id| graph.value(*id, "title").and_then(Value::as_str))
        .collect();
    assert_eq!(titles, vec!["p1", "p2"]);
    assert!(matches!(
        graph.get(author).and_then(|e| e.relation("posts")),
        Some(RelationValue::Many(ids)) if ids.len() == 2
    ));
    assert!(db.writes().is_empty());
}
