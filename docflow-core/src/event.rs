//! Lifecycle events and the per-collection event bus.
//!
//! Every write through a [`Collection`](crate::collection::Collection) is
//! bracketed by a *Before* and an *After* event. Listeners run one at a time in
//! registration order and the first failing listener stops the dispatch, so a
//! failing *Before* listener reliably prevents the physical write.
//!
//! # Example
//!
//! ```ignore
//! use docflow::event::{EventKind, LifecycleEvent};
//! use docflow::error::DocumentStoreError;
//!
//! posts.on(EventKind::BeforeUpdate, |event: LifecycleEvent| async move {
//!     if let LifecycleEvent::BeforeUpdate(update) = &event {
//!         if update.fields.touches("authorId") {
//!             return Err(DocumentStoreError::rejected("BeforeUpdate", "authorId is immutable"));
//!         }
//!     }
//!     Ok(())
//! }).await;
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use mea::rwlock::RwLock;
use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use crate::{
    backend::{DeleteResult, UpdateResult},
    context::ExecutionContext,
    error::DocumentStoreResult,
    fields::FieldDiffSummary,
};

/// Discriminant of a [`LifecycleEvent`], used as the listener registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BeforeInsert => "BeforeInsert",
            EventKind::AfterInsert => "AfterInsert",
            EventKind::BeforeUpdate => "BeforeUpdate",
            EventKind::AfterUpdate => "AfterUpdate",
            EventKind::BeforeRemove => "BeforeRemove",
            EventKind::AfterRemove => "AfterRemove",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted before a document is inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct BeforeInsert {
    pub collection: String,
    pub document: Document,
    pub context: ExecutionContext,
}

/// Emitted after a document was inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct AfterInsert {
    pub collection: String,
    pub document: Document,
    pub inserted_id: Bson,
    pub context: ExecutionContext,
}

/// Emitted before an update is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BeforeUpdate {
    pub collection: String,
    pub filter: Document,
    pub update: Document,
    pub fields: FieldDiffSummary,
    pub is_many: bool,
    pub context: ExecutionContext,
}

/// Emitted after an update was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AfterUpdate {
    pub collection: String,
    pub filter: Document,
    pub update: Document,
    pub fields: FieldDiffSummary,
    pub is_many: bool,
    pub context: ExecutionContext,
    pub result: UpdateResult,
}

/// Emitted before documents are removed.
#[derive(Debug, Clone, PartialEq)]
pub struct BeforeRemove {
    pub collection: String,
    pub filter: Document,
    pub is_many: bool,
    pub context: ExecutionContext,
}

/// Emitted after documents were removed.
#[derive(Debug, Clone, PartialEq)]
pub struct AfterRemove {
    pub collection: String,
    pub filter: Document,
    pub is_many: bool,
    pub context: ExecutionContext,
    pub result: DeleteResult,
}

/// A lifecycle notification bracketing a write operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    BeforeInsert(BeforeInsert),
    AfterInsert(AfterInsert),
    BeforeUpdate(BeforeUpdate),
    AfterUpdate(AfterUpdate),
    BeforeRemove(BeforeRemove),
    AfterRemove(AfterRemove),
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::BeforeInsert(_) => EventKind::BeforeInsert,
            LifecycleEvent::AfterInsert(_) => EventKind::AfterInsert,
            LifecycleEvent::BeforeUpdate(_) => EventKind::BeforeUpdate,
            LifecycleEvent::AfterUpdate(_) => EventKind::AfterUpdate,
            LifecycleEvent::BeforeRemove(_) => EventKind::BeforeRemove,
            LifecycleEvent::AfterRemove(_) => EventKind::AfterRemove,
        }
    }

    /// Name of the collection the event was emitted for.
    pub fn collection(&self) -> &str {
        match self {
            LifecycleEvent::BeforeInsert(e) => &e.collection,
            LifecycleEvent::AfterInsert(e) => &e.collection,
            LifecycleEvent::BeforeUpdate(e) => &e.collection,
            LifecycleEvent::AfterUpdate(e) => &e.collection,
            LifecycleEvent::BeforeRemove(e) => &e.collection,
            LifecycleEvent::AfterRemove(e) => &e.collection,
        }
    }

    /// The caller context of the operation that produced the event.
    pub fn context(&self) -> &ExecutionContext {
        match self {
            LifecycleEvent::BeforeInsert(e) => &e.context,
            LifecycleEvent::AfterInsert(e) => &e.context,
            LifecycleEvent::BeforeUpdate(e) => &e.context,
            LifecycleEvent::AfterUpdate(e) => &e.context,
            LifecycleEvent::BeforeRemove(e) => &e.context,
            LifecycleEvent::AfterRemove(e) => &e.context,
        }
    }
}

/// Receives lifecycle events.
///
/// Returning an error aborts the dispatch; for *Before* events it also aborts
/// the operation being guarded.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn handle(&self, event: &LifecycleEvent) -> DocumentStoreResult<()>;
}

#[async_trait]
impl<F, Fut> EventListener for F
where
    F: Fn(LifecycleEvent) -> Fut + Send + Sync,
    Fut: Future<Output = DocumentStoreResult<()>> + Send,
{
    async fn handle(&self, event: &LifecycleEvent) -> DocumentStoreResult<()> {
        (self)(event.clone()).await
    }
}

type ListenerMap = HashMap<EventKind, Vec<Arc<dyn EventListener>>>;

/// Ordered, sequential publish/subscribe registry for one collection.
///
/// Cloning an `EventBus` yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<ListenerMap>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a listener to one event kind.
    pub async fn on<L: EventListener + 'static>(&self, kind: EventKind, listener: L) {
        self.listeners
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Number of listeners subscribed to `kind`.
    pub async fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .await
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invokes every listener of the event's kind in registration order.
    ///
    /// Each listener is awaited before the next one starts. The first error is
    /// returned and the remaining listeners are skipped.
    pub async fn emit(&self, event: &LifecycleEvent) -> DocumentStoreResult<()> {
        // Snapshot so listeners may subscribe more listeners while we dispatch.
        let listeners = self
            .listeners
            .read()
            .await
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            listener.handle(event).await?;
        }

        Ok(())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DocumentStoreError;
    use bson::doc;
    use std::sync::Mutex;

    fn before_insert() -> LifecycleEvent {
        LifecycleEvent::BeforeInsert(BeforeInsert {
            collection: "posts".to_string(),
            document: doc! { "title": "hello" },
            context: ExecutionContext::system(),
        })
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let calls = calls.clone();
            bus.on(EventKind::BeforeInsert, move |_event: LifecycleEvent| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(i);
                    Ok(())
                }
            })
            .await;
        }

        bus.emit(&before_insert()).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failing_listener_stops_dispatch() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = calls.clone();
        bus.on(EventKind::BeforeInsert, move |_event: LifecycleEvent| {
            let first = first.clone();
            async move {
                first.lock().unwrap().push("first");
                Err(DocumentStoreError::rejected("BeforeInsert", "nope"))
            }
        })
        .await;

        let second = calls.clone();
        bus.on(EventKind::BeforeInsert, move |_event: LifecycleEvent| {
            let second = second.clone();
            async move {
                second.lock().unwrap().push("second");
                Ok(())
            }
        })
        .await;

        let err = bus.emit(&before_insert()).await.unwrap_err();

        assert_eq!(err, DocumentStoreError::rejected("BeforeInsert", "nope"));
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_emit_only_reaches_matching_kind() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        bus.on(EventKind::AfterInsert, move |_event: LifecycleEvent| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        })
        .await;

        bus.emit(&before_insert()).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(bus.listener_count(EventKind::AfterInsert).await, 1);
        assert_eq!(bus.listener_count(EventKind::BeforeInsert).await, 0);
    }

    #[test]
    fn test_event_accessors() {
        let event = before_insert();

        assert_eq!(event.kind(), EventKind::BeforeInsert);
        assert_eq!(event.collection(), "posts");
        assert_eq!(event.context(), &ExecutionContext::system());
    }
}
