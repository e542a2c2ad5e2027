//! Entity lifecycle listeners.

use crate::subject::OperationKind;
use persistgraph_core::{Entity, EntityMetadata, Error};

/// Row-level lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEvent {
    /// Fired before the change set is final; the listener may modify the entity.
    BeforeInsert,
    /// Fired after the row was inserted, inside the transactional scope.
    AfterInsert,
    /// Fired before the change set is final; the listener may modify the entity.
    BeforeUpdate,
    /// Fired after the row was updated, inside the transactional scope.
    AfterUpdate,
    /// Fired before the row is deleted.
    BeforeRemove,
    /// Fired after the row was deleted, inside the transactional scope.
    AfterRemove,
}

impl EntityEvent {
    /// The event fired before a write of `kind`.
    pub fn before(kind: OperationKind) -> Option<Self> {
        match kind {
            OperationKind::Insert => Some(EntityEvent::BeforeInsert),
            OperationKind::Update => Some(EntityEvent::BeforeUpdate),
            OperationKind::Remove => Some(EntityEvent::BeforeRemove),
            OperationKind::NoOp => None,
        }
    }

    /// The event fired after a write of `kind`.
    pub fn after(kind: OperationKind) -> Option<Self> {
        match kind {
            OperationKind::Insert => Some(EntityEvent::AfterInsert),
            OperationKind::Update => Some(EntityEvent::AfterUpdate),
            OperationKind::Remove => Some(EntityEvent::AfterRemove),
            OperationKind::NoOp => None,
        }
    }
}

type EntityListenerFn = Box<dyn FnMut(&EntityMetadata, &mut Entity) -> Result<(), Error> + Send>;

struct Registered {
    event: EntityEvent,
    /// Restrict to one entity type; `None` listens to all.
    entity: Option<String>,
    callback: EntityListenerFn,
}

/// Registered entity listeners.
///
/// A listener returning `Err` aborts the whole save/remove call; the
/// transactional scope is rolled back.
#[derive(Default)]
pub struct EntityListeners {
    listeners: Vec<Registered>,
}

impl std::fmt::Debug for EntityListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityListeners")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl EntityListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to `event` on every entity type.
    pub fn on(
        &mut self,
        event: EntityEvent,
        f: impl FnMut(&EntityMetadata, &mut Entity) -> Result<(), Error> + Send + 'static,
    ) {
        self.listeners.push(Registered {
            event,
            entity: None,
            callback: Box::new(f),
        });
    }

    /// Listen to `event` on one entity type.
    pub fn on_entity(
        &mut self,
        event: EntityEvent,
        entity: impl Into<String>,
        f: impl FnMut(&EntityMetadata, &mut Entity) -> Result<(), Error> + Send + 'static,
    ) {
        self.listeners.push(Registered {
            event,
            entity: Some(entity.into()),
            callback: Box::new(f),
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Whether any listener is registered for `event`.
    pub fn listens_to(&self, event: EntityEvent) -> bool {
        self.listeners.iter().any(|l| l.event == event)
    }

    /// Run the listeners for `event` on one entity. Returns how many ran.
    #[allow(clippy::result_large_err)]
    pub fn fire(
        &mut self,
        event: EntityEvent,
        metadata: &EntityMetadata,
        entity: &mut Entity,
    ) -> Result<usize, Error> {
        let mut fired = 0;
        for listener in self.listeners.iter_mut().filter(|l| {
            l.event == event && l.entity.as_deref().is_none_or(|name| name == metadata.name)
        }) {
            (listener.callback)(metadata, entity)?;
            fired += 1;
        }
        if fired > 0 {
            tracing::trace!(entity = %metadata.name, event = ?event, fired, "Entity listeners fired");
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistgraph_core::Value;

    #[test]
    fn filters_by_event_and_entity() {
        let mut listeners = EntityListeners::new();
        listeners.on(EntityEvent::BeforeInsert, |_, entity| {
            entity.set_value("touched", true);
            Ok(())
        });
        listeners.on_entity(EntityEvent::BeforeInsert, "Tag", |_, entity| {
            entity.set_value("tag_only", true);
            Ok(())
        });

        let meta = EntityMetadata::new("Post", "posts");
        let mut entity = Entity::new("Post");
        let fired = listeners
            .fire(EntityEvent::BeforeInsert, &meta, &mut entity)
            .unwrap();
        assert_eq!(fired, 1);
        assert_eq!(entity.value("touched"), Some(&Value::Bool(true)));
        assert!(entity.value("tag_only").is_none());
        assert_eq!(
            listeners
                .fire(EntityEvent::AfterInsert, &meta, &mut entity)
                .unwrap(),
            0
        );
        assert!(listeners.listens_to(EntityEvent::BeforeInsert));
        assert!(!listeners.listens_to(EntityEvent::AfterRemove));
    }

    #[test]
    fn errors_abort() {
        let mut listeners = EntityListeners::new();
        listeners.on(EntityEvent::BeforeRemove, |_, _| {
            Err(Error::Listener("removal blocked".into()))
        });
        let meta = EntityMetadata::new("Post", "posts");
        let mut entity = Entity::new("Post");
        let err = listeners
            .fire(EntityEvent::BeforeRemove, &meta, &mut entity)
            .unwrap_err();
        assert!(matches!(err, Error::Listener(_)));
        assert_eq!(EntityEvent::before(OperationKind::NoOp), None);
        assert_eq!(
            EntityEvent::after(OperationKind::Remove),
            Some(EntityEvent::AfterRemove)
        );
    }
}
