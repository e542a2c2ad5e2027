//! Cascade policy lookup.

use persistgraph_core::{
    CascadeLookup, CascadeOperation, MetadataProvider, RelationMetadata, Result,
};

/// Decides whether a relation carries an operation over to its targets.
///
/// A pure lookup of the relation's declared flags, except for relations
/// whose behaviour row demands the owning side's agreement: a one-to-many
/// collection or the inverse side of a many-to-many only cascades when the
/// owning counterpart declares the same flag.
pub struct CascadeResolver<'a> {
    metadata: &'a dyn MetadataProvider,
}

impl<'a> CascadeResolver<'a> {
    pub fn new(metadata: &'a dyn MetadataProvider) -> Self {
        Self { metadata }
    }

    /// Check whether `operation` cascades through `relation`.
    pub fn should_cascade(
        &self,
        relation: &RelationMetadata,
        operation: CascadeOperation,
    ) -> Result<bool> {
        if !relation.cascade.allows(operation) {
            return Ok(false);
        }
        match relation.behaviour().cascade {
            CascadeLookup::Declared => Ok(true),
            CascadeLookup::RequireOwningSide => match self.metadata.counterpart(relation)? {
                Some((_, owning)) => Ok(owning.cascade.allows(operation)),
                None => Ok(false),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistgraph_core::{
        CascadeFlags, ColumnMetadata, EntityMetadata, JunctionTable, MetadataRegistry,
    };

    fn registry(owning: CascadeFlags, inverse: CascadeFlags) -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                EntityMetadata::new("Post", "posts")
                    .column(ColumnMetadata::new("id").primary_key())
                    .relation(
                        RelationMetadata::many_to_many("tags", "Tag")
                            .junction(JunctionTable::new("post_tags", "post_id", "tag_id"))
                            .cascade(owning),
                    )
                    .relation(
                        RelationMetadata::one_to_many("comments", "Comment", "post")
                            .cascade(inverse),
                    ),
            )
            .with(
                EntityMetadata::new("Tag", "tags")
                    .column(ColumnMetadata::new("id").primary_key())
                    .relation(
                        RelationMetadata::many_to_many("posts", "Post")
                            .inverse("tags")
                            .cascade(inverse),
                    ),
            )
            .with(
                EntityMetadata::new("Comment", "comments")
                    .column(ColumnMetadata::new("id").primary_key())
                    .relation(
                        RelationMetadata::many_to_one("post", "Post", "post_id").cascade(owning),
                    ),
            )
    }

    fn relation(registry: &MetadataRegistry, entity: &str, name: &str) -> RelationMetadata {
        registry
            .entity(entity)
            .unwrap()
            .find_relation(name)
            .unwrap()
            .clone()
    }

    #[test]
    fn owning_side_uses_declared_flags() {
        let registry = registry(CascadeFlags::SAVE, CascadeFlags::NONE);
        let resolver = CascadeResolver::new(&registry);
        let tags = relation(&registry, "Post", "tags");
        assert!(resolver.should_cascade(&tags, CascadeOperation::Insert).unwrap());
        assert!(!resolver.should_cascade(&tags, CascadeOperation::Remove).unwrap());
    }

    #[test]
    fn inverse_side_requires_owning_flag() {
        let registry = registry(CascadeFlags::NONE, CascadeFlags::ALL);
        let resolver = CascadeResolver::new(&registry);
        let posts = relation(&registry, "Tag", "posts");
        let comments = relation(&registry, "Post", "comments");
        assert!(!resolver.should_cascade(&posts, CascadeOperation::Insert).unwrap());
        assert!(!resolver.should_cascade(&comments, CascadeOperation::Insert).unwrap());

        let registry = registry_both();
        let resolver = CascadeResolver::new(&registry);
        let posts = relation(&registry, "Tag", "posts");
        assert!(resolver.should_cascade(&posts, CascadeOperation::Insert).unwrap());
    }

    fn registry_both() -> MetadataRegistry {
        registry(CascadeFlags::ALL, CascadeFlags::ALL)
    }
}
