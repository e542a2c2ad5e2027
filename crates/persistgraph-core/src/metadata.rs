//! Entity metadata: columns, relations and cascade policy.
//!
//! Metadata is supplied by the caller through a [`MetadataProvider`] that is
//! injected into every entry point; nothing here is process-global.
//!
//! Relation kinds form a closed set. Each kind (and side) maps to a fixed
//! [`RelationBehaviour`] row that the session engine consults instead of
//! inspecting relations ad hoc.

use crate::error::{Error, MetadataError, Result};
use crate::identifier::Identifier;
use crate::row::Row;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Converts a property value to and from its database representation.
///
/// Change detection compares database representations, so two value
/// objects with the same logical value never produce an update.
pub trait ValueTransformer: Send + Sync + fmt::Debug {
    /// Convert an entity property value into the value stored in the column.
    fn to_database(&self, value: &Value) -> Value;

    /// Convert a stored column value back into the property value.
    fn from_database(&self, value: &Value) -> Value;
}

/// How a column's value is produced when a row is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// The database assigns the value (auto-increment / identity).
    Increment,
    /// A v4 UUID is generated client side when the property is unset.
    Uuid,
    /// The database applies a default expression; returned values are merged.
    Default,
}

/// Description of one mapped column.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Property name on the entity.
    pub property: String,
    /// Column name in the table.
    pub column: String,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary: bool,
    /// Value generation strategy, if any.
    pub generation: Option<Generation>,
    /// Whether the column is a version counter.
    pub version: bool,
    /// Optional value transformer.
    pub transformer: Option<Arc<dyn ValueTransformer>>,
}

impl ColumnMetadata {
    /// Create a nullable column whose property and column names match.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            property: name.clone(),
            column: name,
            nullable: true,
            primary: false,
            generation: None,
            version: false,
            transformer: None,
        }
    }

    /// Mark the column as (part of) the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    /// Set the generation strategy.
    #[must_use]
    pub fn generated(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Mark the column as a version counter.
    #[must_use]
    pub fn version_column(mut self) -> Self {
        self.version = true;
        self.nullable = false;
        self
    }

    /// Mark the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Use a column name that differs from the property name.
    #[must_use]
    pub fn column_name(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Attach a value transformer.
    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn ValueTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Convert a property value into its database representation.
    pub fn to_database(&self, value: &Value) -> Value {
        match &self.transformer {
            Some(t) => t.to_database(value),
            None => value.clone(),
        }
    }

    /// Convert a database value into its property representation.
    pub fn from_database(&self, value: &Value) -> Value {
        match &self.transformer {
            Some(t) => t.from_database(value),
            None => value.clone(),
        }
    }
}

/// A foreign-key column and the target column it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    /// Column holding the reference.
    pub column: String,
    /// Primary-key column of the referenced entity.
    pub referenced_column: String,
}

impl JoinColumn {
    pub fn new(column: impl Into<String>, referenced_column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

/// Association table backing the owning side of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionTable {
    /// Junction table name.
    pub table: String,
    /// Columns referencing the owning entity's primary key.
    pub owner_columns: Vec<JoinColumn>,
    /// Columns referencing the target entity's primary key.
    pub inverse_columns: Vec<JoinColumn>,
}

impl JunctionTable {
    /// Single-column junction (`owner_column` -> owner `id`, `inverse_column` -> target `id`).
    pub fn new(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        inverse_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns: vec![JoinColumn::new(owner_column, "id")],
            inverse_columns: vec![JoinColumn::new(inverse_column, "id")],
        }
    }

    /// Junction with explicit (possibly composite) column mappings.
    pub fn composite(
        table: impl Into<String>,
        owner_columns: Vec<JoinColumn>,
        inverse_columns: Vec<JoinColumn>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns,
            inverse_columns,
        }
    }

    /// Build the junction row identifier for one (owner, inverse) pair.
    ///
    /// Returns `None` if either side lacks a referenced key column.
    pub fn row_identifier(&self, owner: &Identifier, inverse: &Identifier) -> Option<Identifier> {
        let mut values = Vec::new();
        for jc in &self.owner_columns {
            values.push((jc.column.clone(), owner.get(&jc.referenced_column)?.clone()));
        }
        for jc in &self.inverse_columns {
            values.push((jc.column.clone(), inverse.get(&jc.referenced_column)?.clone()));
        }
        Some(Identifier::new(values))
    }
}

/// The operations a cascade flag can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOperation {
    Insert,
    Update,
    Remove,
}

/// Per-relation cascade flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeFlags {
    pub insert: bool,
    pub update: bool,
    pub remove: bool,
}

impl CascadeFlags {
    /// No cascades.
    pub const NONE: Self = Self {
        insert: false,
        update: false,
        remove: false,
    };

    /// Cascade every operation.
    pub const ALL: Self = Self {
        insert: true,
        update: true,
        remove: true,
    };

    /// Cascade inserts and updates but not removals.
    pub const SAVE: Self = Self {
        insert: true,
        update: true,
        remove: false,
    };

    /// Check whether the flag for `operation` is set.
    pub const fn allows(&self, operation: CascadeOperation) -> bool {
        match operation {
            CascadeOperation::Insert => self.insert,
            CascadeOperation::Update => self.update,
            CascadeOperation::Remove => self.remove,
        }
    }
}

/// What happens to a child that left a one-to-many collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrphanAction {
    /// Set the child's foreign key to NULL.
    #[default]
    Nullify,
    /// Remove the child row.
    Delete,
    /// Leave the child row untouched.
    Ignore,
}

/// The kind of relation between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Which side of a relation stores the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationSide {
    /// This entity's row (or its junction) stores the reference.
    Owning,
    /// The target's row (or the target's junction) stores the reference.
    Inverse,
}

/// How cascade flags are looked up for a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeLookup {
    /// The relation's declared flags decide.
    Declared,
    /// The declared flag must also be set on the owning counterpart.
    RequireOwningSide,
}

/// Write ordering implied by a relation between holder and target rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// The target row is written before the holder row.
    TargetFirst,
    /// The holder row is written before the target rows.
    HolderFirst,
    /// No edge between the rows; junction rows follow both endpoints.
    JunctionAfterBoth,
}

/// How changes to the relation are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStrategy {
    /// Compare the join columns on the holder row.
    JoinColumns,
    /// Compare the foreign key stored on the target rows.
    InverseForeignKey,
    /// Set difference of junction rows.
    JunctionSet,
}

/// One row of the relation behaviour table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationBehaviour {
    pub cascade: CascadeLookup,
    pub edge: EdgeDirection,
    pub diff: DiffStrategy,
}

impl RelationKind {
    /// Look up the behaviour row for this kind on the given side.
    pub const fn behaviour(self, side: RelationSide) -> RelationBehaviour {
        match (self, side) {
            (RelationKind::ManyToOne, _) | (RelationKind::OneToOne, RelationSide::Owning) => {
                RelationBehaviour {
                    cascade: CascadeLookup::Declared,
                    edge: EdgeDirection::TargetFirst,
                    diff: DiffStrategy::JoinColumns,
                }
            }
            (RelationKind::OneToOne, RelationSide::Inverse) => RelationBehaviour {
                cascade: CascadeLookup::Declared,
                edge: EdgeDirection::HolderFirst,
                diff: DiffStrategy::InverseForeignKey,
            },
            (RelationKind::OneToMany, _) => RelationBehaviour {
                cascade: CascadeLookup::RequireOwningSide,
                edge: EdgeDirection::HolderFirst,
                diff: DiffStrategy::InverseForeignKey,
            },
            (RelationKind::ManyToMany, RelationSide::Owning) => RelationBehaviour {
                cascade: CascadeLookup::Declared,
                edge: EdgeDirection::JunctionAfterBoth,
                diff: DiffStrategy::JunctionSet,
            },
            (RelationKind::ManyToMany, RelationSide::Inverse) => RelationBehaviour {
                cascade: CascadeLookup::RequireOwningSide,
                edge: EdgeDirection::JunctionAfterBoth,
                diff: DiffStrategy::JunctionSet,
            },
        }
    }

    /// Whether the relation holds a collection.
    pub const fn is_to_many(self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Description of one relation declared on an entity.
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    /// Property name of the relation.
    pub name: String,
    pub kind: RelationKind,
    /// Target entity name.
    pub target: String,
    /// Join columns stored on this entity's row (owning to-one relations).
    pub join_columns: Vec<JoinColumn>,
    /// Junction table (owning many-to-many relations).
    pub junction: Option<JunctionTable>,
    /// Name of the counterpart relation on the target entity.
    pub inverse_relation: Option<String>,
    /// Whether the foreign key accepts NULL.
    pub nullable: bool,
    pub cascade: CascadeFlags,
    pub orphan: OrphanAction,
}

impl RelationMetadata {
    fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            join_columns: Vec::new(),
            junction: None,
            inverse_relation: None,
            nullable: true,
            cascade: CascadeFlags::NONE,
            orphan: OrphanAction::default(),
        }
    }

    /// A many-to-one relation stored in `join_column`, referencing the target's `id`.
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        join_column: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::ManyToOne, target).join_column(join_column, "id")
    }

    /// A one-to-many collection whose foreign key is the target's `inverse` relation.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::OneToMany, target).inverse(inverse)
    }

    /// A one-to-one relation. Add join columns for the owning side or an
    /// inverse relation name for the inverse side.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::OneToOne, target)
    }

    /// A many-to-many relation. Add a junction for the owning side or an
    /// inverse relation name for the inverse side.
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::ManyToMany, target)
    }

    /// Add a join column.
    #[must_use]
    pub fn join_column(
        mut self,
        column: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        self.join_columns
            .push(JoinColumn::new(column, referenced_column));
        self
    }

    /// Set the junction table.
    #[must_use]
    pub fn junction(mut self, junction: JunctionTable) -> Self {
        self.junction = Some(junction);
        self
    }

    /// Name the counterpart relation on the target entity.
    #[must_use]
    pub fn inverse(mut self, relation: impl Into<String>) -> Self {
        self.inverse_relation = Some(relation.into());
        self
    }

    /// Mark the foreign key as NOT NULL.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the cascade flags.
    #[must_use]
    pub fn cascade(mut self, cascade: CascadeFlags) -> Self {
        self.cascade = cascade;
        self
    }

    /// Set the orphan action for one-to-many collections.
    #[must_use]
    pub fn orphan(mut self, orphan: OrphanAction) -> Self {
        self.orphan = orphan;
        self
    }

    /// Which side of the relation this descriptor is on.
    pub fn side(&self) -> RelationSide {
        match self.kind {
            RelationKind::ManyToOne => RelationSide::Owning,
            RelationKind::OneToMany => RelationSide::Inverse,
            RelationKind::OneToOne if !self.join_columns.is_empty() => RelationSide::Owning,
            RelationKind::ManyToMany if self.junction.is_some() => RelationSide::Owning,
            RelationKind::OneToOne | RelationKind::ManyToMany => RelationSide::Inverse,
        }
    }

    /// Whether this side stores the reference.
    pub fn is_owning(&self) -> bool {
        self.side() == RelationSide::Owning
    }

    /// Behaviour table row for this relation.
    pub fn behaviour(&self) -> RelationBehaviour {
        self.kind.behaviour(self.side())
    }
}

/// Description of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    /// Entity name, used as the identity namespace.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Mapped columns in declaration order.
    pub columns: Vec<ColumnMetadata>,
    /// Relations in declaration order.
    pub relations: Vec<RelationMetadata>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Add a column.
    #[must_use]
    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a relation.
    #[must_use]
    pub fn relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    /// Primary-key columns in declaration order.
    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.primary)
    }

    /// Find a column by property name.
    pub fn column_by_property(&self, property: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.property == property)
    }

    /// Find a column by column name.
    pub fn column_by_name(&self, column: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.column == column)
    }

    /// Find a relation by name.
    pub fn find_relation(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// The version column, if one is declared.
    pub fn version_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.version)
    }

    /// Whether `column` is written by an owning relation's join columns.
    pub fn is_join_column(&self, column: &str) -> bool {
        self.relations
            .iter()
            .filter(|r| r.is_owning())
            .any(|r| r.join_columns.iter().any(|jc| jc.column == column))
    }

    /// Read the identifier from entity property values.
    pub fn identifier_from_values(&self, values: &Row) -> Option<Identifier> {
        let mut pairs = Vec::new();
        for column in self.primary_columns() {
            let value = values.get(&column.property)?;
            if value.is_null() {
                return None;
            }
            pairs.push((column.column.clone(), column.to_database(value)));
        }
        if pairs.is_empty() {
            return None;
        }
        Some(Identifier::new(pairs))
    }

    /// Read the identifier from a database row keyed by column name.
    pub fn identifier_from_row(&self, row: &Row) -> Option<Identifier> {
        Identifier::from_row(row, self.primary_columns().map(|c| c.column.as_str()))
    }
}

/// Supplies entity metadata to the persistence engine.
pub trait MetadataProvider: Send + Sync {
    /// Get the metadata for an entity, if registered.
    fn entity(&self, name: &str) -> Option<Arc<EntityMetadata>>;

    /// Get the metadata for an entity or fail with a metadata error.
    fn require(&self, name: &str) -> Result<Arc<EntityMetadata>> {
        self.entity(name).ok_or_else(|| Error::unknown_entity(name))
    }

    /// Resolve the counterpart of `relation` on its target entity.
    ///
    /// Returns the target metadata and the counterpart descriptor, or `None`
    /// when the relation declares no inverse.
    fn counterpart(
        &self,
        relation: &RelationMetadata,
    ) -> Result<Option<(Arc<EntityMetadata>, RelationMetadata)>> {
        let Some(inverse) = &relation.inverse_relation else {
            return Ok(None);
        };
        let target = self.require(&relation.target)?;
        let Some(found) = target.find_relation(inverse).cloned() else {
            return Err(Error::Metadata(MetadataError {
                entity: target.name.clone(),
                message: format!(
                    "relation '{}' declares inverse '{}.{}' which does not exist",
                    relation.name, target.name, inverse
                ),
            }));
        };
        Ok(Some((target, found)))
    }
}

/// A simple map-backed metadata provider.
#[derive(Debug, Default, Clone)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity (builder pattern).
    #[must_use]
    pub fn with(mut self, entity: EntityMetadata) -> Self {
        self.register(entity);
        self
    }

    /// Register an entity, replacing any previous registration.
    pub fn register(&mut self, entity: EntityMetadata) {
        self.entities.insert(entity.name.clone(), Arc::new(entity));
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check every registered entity for structural consistency.
    ///
    /// Verifies primary keys, relation targets, join-column references,
    /// junction definitions and inverse relation names.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&String> = self.entities.keys().collect();
        names.sort();
        for name in names {
            let entity = &self.entities[name];
            self.validate_entity(entity)?;
        }
        Ok(())
    }

    fn validate_entity(&self, entity: &EntityMetadata) -> Result<()> {
        let fail = |message: String| {
            Err(Error::Metadata(MetadataError {
                entity: entity.name.clone(),
                message,
            }))
        };

        if entity.primary_columns().next().is_none() {
            return fail(format!("entity '{}' has no primary key", entity.name));
        }

        for relation in &entity.relations {
            let Some(target) = self.entities.get(&relation.target) else {
                return fail(format!(
                    "relation '{}.{}' targets unknown entity '{}'",
                    entity.name, relation.name, relation.target
                ));
            };

            for jc in &relation.join_columns {
                if !target
                    .primary_columns()
                    .any(|c| c.column == jc.referenced_column)
                {
                    return fail(format!(
                        "join column '{}' of '{}.{}' must reference a primary key column of '{}'",
                        jc.column, entity.name, relation.name, target.name
                    ));
                }
            }

            if let Some(junction) = &relation.junction {
                let owner_ok = junction.owner_columns.iter().all(|jc| {
                    entity
                        .primary_columns()
                        .any(|c| c.column == jc.referenced_column)
                });
                let inverse_ok = junction.inverse_columns.iter().all(|jc| {
                    target
                        .primary_columns()
                        .any(|c| c.column == jc.referenced_column)
                });
                if !owner_ok || !inverse_ok || junction.owner_columns.is_empty() {
                    return fail(format!(
                        "junction '{}' of '{}.{}' does not map both primary keys",
                        junction.table, entity.name, relation.name
                    ));
                }
            }

            match (relation.kind, relation.side()) {
                (RelationKind::ManyToOne, _) if relation.join_columns.is_empty() => {
                    return fail(format!(
                        "many-to-one '{}.{}' has no join columns",
                        entity.name, relation.name
                    ));
                }
                (RelationKind::ManyToOne, _) | (_, RelationSide::Owning) => {}
                (kind, RelationSide::Inverse) => {
                    let Some((_, counterpart)) = self.counterpart(relation)? else {
                        return fail(format!(
                            "inverse relation '{}.{}' must name its owning counterpart",
                            entity.name, relation.name
                        ));
                    };
                    let expected = match kind {
                        RelationKind::OneToMany => RelationKind::ManyToOne,
                        other => other,
                    };
                    if counterpart.kind != expected
                        || !counterpart.is_owning()
                        || counterpart.target != entity.name
                    {
                        return fail(format!(
                            "'{}.{}' is not the owning counterpart of '{}.{}'",
                            relation.target, counterpart.name, entity.name, relation.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl MetadataProvider for MetadataRegistry {
    fn entity(&self, name: &str) -> Option<Arc<EntityMetadata>> {
        self.entities.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog() -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                EntityMetadata::new("Author", "authors")
                    .column(
                        ColumnMetadata::new("id")
                            .primary_key()
                            .generated(Generation::Increment),
                    )
                    .column(ColumnMetadata::new("name"))
                    .relation(RelationMetadata::one_to_many("posts", "Post", "author")),
            )
            .with(
                EntityMetadata::new("Post", "posts")
                    .column(
                        ColumnMetadata::new("id")
                            .primary_key()
                            .generated(Generation::Increment),
                    )
                    .column(ColumnMetadata::new("title"))
                    .relation(
                        RelationMetadata::many_to_one("author", "Author", "author_id")
                            .required()
                            .cascade(CascadeFlags::SAVE),
                    )
                    .relation(
                        RelationMetadata::many_to_many("tags", "Tag")
                            .junction(JunctionTable::new("post_tags", "post_id", "tag_id")),
                    ),
            )
            .with(
                EntityMetadata::new("Tag", "tags")
                    .column(ColumnMetadata::new("id").primary_key())
                    .relation(RelationMetadata::many_to_many("posts", "Post").inverse("tags")),
            )
    }

    #[test]
    fn behaviour_table_rows() {
        let registry = blog();
        let post = registry.entity("Post").unwrap();
        let author = post.find_relation("author").unwrap();
        assert!(author.is_owning());
        assert_eq!(author.behaviour().edge, EdgeDirection::TargetFirst);
        assert_eq!(author.behaviour().diff, DiffStrategy::JoinColumns);

        let posts = registry.entity("Author").unwrap();
        let posts = posts.find_relation("posts").unwrap();
        assert_eq!(posts.side(), RelationSide::Inverse);
        assert_eq!(posts.behaviour().cascade, CascadeLookup::RequireOwningSide);

        let tags = post.find_relation("tags").unwrap();
        assert_eq!(tags.behaviour().diff, DiffStrategy::JunctionSet);
        assert_eq!(tags.behaviour().cascade, CascadeLookup::Declared);
    }

    #[test]
    fn registry_validates() {
        assert!(blog().validate().is_ok());

        let broken = blog().with(
            EntityMetadata::new("Comment", "comments")
                .column(ColumnMetadata::new("id").primary_key())
                .relation(RelationMetadata::many_to_one("post", "Missing", "post_id")),
        );
        let err = broken.validate().unwrap_err();
        assert!(err.to_string().contains("unknown entity 'Missing'"));

        let no_pk = MetadataRegistry::new().with(EntityMetadata::new("Loose", "loose"));
        assert!(no_pk.validate().is_err());
    }

    #[test]
    fn counterpart_lookup() {
        let registry = blog();
        let tag = registry.entity("Tag").unwrap();
        let posts = tag.find_relation("posts").unwrap();
        let (target, owning) = registry.counterpart(posts).unwrap().unwrap();
        assert_eq!(target.name, "Post");
        assert_eq!(owning.name, "tags");
        assert!(owning.junction.is_some());
    }

    #[derive(Debug)]
    struct Cents;

    impl ValueTransformer for Cents {
        fn to_database(&self, value: &Value) -> Value {
            match value {
                Value::Double(d) => Value::BigInt((d * 100.0).round() as i64),
                other => other.clone(),
            }
        }

        fn from_database(&self, value: &Value) -> Value {
            match value {
                Value::BigInt(c) => Value::Double(*c as f64 / 100.0),
                other => other.clone(),
            }
        }
    }

    #[test]
    fn identifiers_use_database_representation() {
        let entity = EntityMetadata::new("Price", "prices")
            .column(
                ColumnMetadata::new("amount")
                    .primary_key()
                    .column_name("amount_cents")
                    .transformer(Arc::new(Cents)),
            );
        let values = Row::new().with("amount", 1.25);
        let id = entity.identifier_from_values(&values).unwrap();
        assert_eq!(id.get("amount_cents"), Some(&Value::BigInt(125)));
        assert!(entity.identifier_from_values(&Row::new()).is_none());

        let junction = JunctionTable::new("post_tags", "post_id", "tag_id");
        let row_id = junction
            .row_identifier(
                &Identifier::single("id", 1_i64),
                &Identifier::single("id", 2_i64),
            )
            .unwrap();
        assert_eq!(row_id.get("post_id"), Some(&Value::BigInt(1)));
        assert_eq!(row_id.get("tag_id"), Some(&Value::BigInt(2)));
    }
}
