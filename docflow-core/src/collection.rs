//! Collection types for document store operations.
//!
//! This module provides the canonical collection façade. A [`Collection`]
//! accepts an operation, pushes it through its installed
//! [behaviors](crate::behavior) and finally executes it in the
//! [`CollectionCore`], which brackets every write with lifecycle events.
//!
//! # Collection Types
//!
//! - [`CollectionCore`] - Executes operations against the backend with event emission
//! - [`Collection`] - Untyped façade over BSON documents with the behavior chain
//! - [`CollectionBuilder`] - Installs behaviors and runs their one-time setup
//! - [`TypedCollection`] - Type-safe wrapper for a [`Model`]
//!
//! # Example
//!
//! ```ignore
//! use docflow::{behavior::SoftDelete, context::ExecutionContext};
//! use bson::doc;
//!
//! let posts = store
//!     .collection_builder("posts")
//!     .behavior(SoftDelete::default())
//!     .build()
//!     .await?;
//!
//! let ctx = ExecutionContext::for_user("u1");
//! let inserted = posts.insert_one(doc! { "title": "Hello" }, &ctx).await?;
//! posts.delete_one(doc! { "_id": inserted.inserted_id }, &ctx).await?;
//! assert_eq!(posts.count(doc! {}, &ctx).await?, 0);
//! ```

use bson::Document;
use std::{fmt, marker::PhantomData, sync::Arc};
use tracing::debug;

use crate::{
    backend::{
        DeleteResult, DynStoreBackend, FindOneAndUpdateOptions, FindOptions, InsertManyResult,
        InsertOneResult, UpdateOptions, UpdateResult,
    },
    behavior::{Behavior, BehaviorRef, Next},
    context::ExecutionContext,
    error::DocumentStoreResult,
    event::{
        AfterInsert, AfterRemove, AfterUpdate, BeforeInsert, BeforeRemove, BeforeUpdate,
        EventBus, EventKind, EventListener, LifecycleEvent,
    },
    fields::FieldDiffSummary,
    model::{Model, ModelExt},
    operation::{Operation, OperationOutcome},
    query::Query,
    store::DocumentStore,
};

/// Executes operations against the backend, emitting lifecycle events around writes.
///
/// Writes follow one protocol: emit the *Before* event, perform the physical
/// operation only if every listener succeeded, then emit the *After* event.
/// A failing *After* listener is reported to the caller but does not undo the
/// write. Reads are passed straight through.
#[derive(Debug, Clone)]
pub struct CollectionCore {
    name: String,
    backend: Arc<dyn DynStoreBackend>,
    events: EventBus,
}

impl CollectionCore {
    pub(crate) fn new(name: String, backend: Arc<dyn DynStoreBackend>, events: EventBus) -> Self {
        Self { name, backend, events }
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw backend, bypassing events and behaviors.
    pub fn backend(&self) -> &dyn DynStoreBackend {
        self.backend.as_ref()
    }

    /// The event bus of this collection.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Emits an event to this collection's listeners.
    pub async fn emit(&self, event: &LifecycleEvent) -> DocumentStoreResult<()> {
        self.events.emit(event).await
    }

    /// Executes an operation.
    pub async fn execute(&self, op: Operation, ctx: &ExecutionContext) -> DocumentStoreResult<OperationOutcome> {
        match op {
            Operation::InsertOne { document } => self
                .insert_one(document, ctx)
                .await
                .map(OperationOutcome::InsertedOne),
            Operation::InsertMany { documents } => self
                .insert_many(documents, ctx)
                .await
                .map(OperationOutcome::InsertedMany),
            Operation::Update { filter, update, many, upsert } => self
                .update(filter, update, UpdateOptions { many, upsert }, ctx)
                .await
                .map(OperationOutcome::Updated),
            Operation::Delete { filter, many } => self
                .delete(filter, many, ctx)
                .await
                .map(OperationOutcome::Deleted),
            Operation::Find { filter, options } => self
                .backend
                .find(&self.name, filter, options)
                .await
                .map(OperationOutcome::Documents),
            Operation::FindOneAndUpdate { filter, update, options } => self
                .backend
                .find_one_and_update(&self.name, filter, update, options)
                .await
                .map(OperationOutcome::Document),
            Operation::FindOneAndDelete { filter } => self
                .backend
                .find_one_and_delete(&self.name, filter)
                .await
                .map(OperationOutcome::Document),
            Operation::Count { filter } => self
                .backend
                .count(&self.name, filter)
                .await
                .map(OperationOutcome::Count),
            Operation::Aggregate { pipeline } => self
                .backend
                .aggregate(&self.name, pipeline)
                .await
                .map(OperationOutcome::Documents),
        }
    }

    /// Inserts one document between `BeforeInsert` and `AfterInsert`.
    pub async fn insert_one(&self, document: Document, ctx: &ExecutionContext) -> DocumentStoreResult<InsertOneResult> {
        self.emit(&LifecycleEvent::BeforeInsert(BeforeInsert {
            collection: self.name.clone(),
            document: document.clone(),
            context: ctx.clone(),
        }))
        .await?;

        let result = self
            .backend
            .insert_one(&self.name, document.clone())
            .await?;

        self.emit(&LifecycleEvent::AfterInsert(AfterInsert {
            collection: self.name.clone(),
            document,
            inserted_id: result.inserted_id.clone(),
            context: ctx.clone(),
        }))
        .await?;

        Ok(result)
    }

    /// Inserts several documents. Every `BeforeInsert` runs before the write,
    /// every `AfterInsert` after it.
    pub async fn insert_many(
        &self,
        documents: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<InsertManyResult> {
        for document in &documents {
            self.emit(&LifecycleEvent::BeforeInsert(BeforeInsert {
                collection: self.name.clone(),
                document: document.clone(),
                context: ctx.clone(),
            }))
            .await?;
        }

        let result = self
            .backend
            .insert_many(&self.name, documents.clone())
            .await?;

        for (document, inserted_id) in documents.into_iter().zip(result.inserted_ids.iter()) {
            self.emit(&LifecycleEvent::AfterInsert(AfterInsert {
                collection: self.name.clone(),
                document,
                inserted_id: inserted_id.clone(),
                context: ctx.clone(),
            }))
            .await?;
        }

        Ok(result)
    }

    /// Applies an update between `BeforeUpdate` and `AfterUpdate`.
    pub async fn update(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<UpdateResult> {
        let fields = FieldDiffSummary::from_update(&update);

        self.emit(&LifecycleEvent::BeforeUpdate(BeforeUpdate {
            collection: self.name.clone(),
            filter: filter.clone(),
            update: update.clone(),
            fields: fields.clone(),
            is_many: options.many,
            context: ctx.clone(),
        }))
        .await?;

        let result = self
            .backend
            .update(&self.name, filter.clone(), update.clone(), options)
            .await?;

        self.emit(&LifecycleEvent::AfterUpdate(AfterUpdate {
            collection: self.name.clone(),
            filter,
            update,
            fields,
            is_many: options.many,
            context: ctx.clone(),
            result: result.clone(),
        }))
        .await?;

        Ok(result)
    }

    /// Removes documents between `BeforeRemove` and `AfterRemove`.
    pub async fn delete(&self, filter: Document, many: bool, ctx: &ExecutionContext) -> DocumentStoreResult<DeleteResult> {
        self.emit(&LifecycleEvent::BeforeRemove(BeforeRemove {
            collection: self.name.clone(),
            filter: filter.clone(),
            is_many: many,
            context: ctx.clone(),
        }))
        .await?;

        let result = self
            .backend
            .delete(&self.name, filter.clone(), many)
            .await?;

        self.emit(&LifecycleEvent::AfterRemove(AfterRemove {
            collection: self.name.clone(),
            filter,
            is_many: many,
            context: ctx.clone(),
            result: result.clone(),
        }))
        .await?;

        Ok(result)
    }
}

struct CollectionInner {
    core: CollectionCore,
    behaviors: Arc<[BehaviorRef]>,
}

/// An untyped collection with its behavior chain and event bus.
///
/// Cloning a `Collection` is cheap and yields a handle to the same listeners
/// and behaviors. Keep the handle around: calling
/// [`DocumentStore::collection`] again creates a fresh, listener-less façade.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    pub(crate) fn new(core: CollectionCore, behaviors: Arc<[BehaviorRef]>) -> Self {
        Self { inner: Arc::new(CollectionInner { core, behaviors }) }
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// The operation core, bypassing behaviors.
    pub fn core(&self) -> &CollectionCore {
        &self.inner.core
    }

    /// The event bus of this collection.
    pub fn events(&self) -> &EventBus {
        self.inner.core.events()
    }

    /// Names of the installed behaviors, in installation order.
    pub fn behavior_names(&self) -> Vec<&'static str> {
        self.inner
            .behaviors
            .iter()
            .map(|behavior| behavior.name())
            .collect()
    }

    /// Subscribes a lifecycle listener.
    pub async fn on<L: EventListener + 'static>(&self, kind: EventKind, listener: L) {
        self.events().on(kind, listener).await
    }

    /// Emits an event to this collection's listeners.
    pub async fn emit(&self, event: &LifecycleEvent) -> DocumentStoreResult<()> {
        self.events().emit(event).await
    }

    /// Returns a handle sharing listeners and behaviors but issuing operations
    /// through `store`'s backend, typically a transaction-scoped store.
    pub fn bind(&self, store: &DocumentStore) -> Collection {
        Collection::new(
            CollectionCore::new(
                self.name().to_string(),
                store.backend().clone(),
                self.events().clone(),
            ),
            self.inner.behaviors.clone(),
        )
    }

    /// Converts this collection to a typed view.
    pub fn typed<M: Model>(&self) -> TypedCollection<M> {
        TypedCollection::new(self.clone())
    }

    /// Pushes an operation through the behavior chain.
    pub async fn run(&self, op: Operation, ctx: &ExecutionContext) -> DocumentStoreResult<OperationOutcome> {
        debug!(
            collection = self.name(),
            operation = op.name(),
            behaviors = self.inner.behaviors.len(),
            "dispatching operation"
        );

        Next::new(&self.inner.behaviors, &self.inner.core)
            .run(op, ctx)
            .await
    }

    pub async fn insert_one(&self, document: Document, ctx: &ExecutionContext) -> DocumentStoreResult<InsertOneResult> {
        self.run(Operation::InsertOne { document }, ctx)
            .await?
            .into_inserted_one()
    }

    pub async fn insert_many(
        &self,
        documents: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<InsertManyResult> {
        self.run(Operation::InsertMany { documents }, ctx)
            .await?
            .into_inserted_many()
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<UpdateResult> {
        self.run(Operation::Update { filter, update, many: false, upsert: false }, ctx)
            .await?
            .into_updated()
    }

    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<UpdateResult> {
        self.run(Operation::Update { filter, update, many: true, upsert: false }, ctx)
            .await?
            .into_updated()
    }

    /// Updates the first matching document, inserting one when nothing matches.
    pub async fn upsert_one(
        &self,
        filter: Document,
        update: Document,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<UpdateResult> {
        self.run(Operation::Update { filter, update, many: false, upsert: true }, ctx)
            .await?
            .into_updated()
    }

    pub async fn delete_one(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<DeleteResult> {
        self.run(Operation::Delete { filter, many: false }, ctx)
            .await?
            .into_deleted()
    }

    pub async fn delete_many(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<DeleteResult> {
        self.run(Operation::Delete { filter, many: true }, ctx)
            .await?
            .into_deleted()
    }

    pub async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.run(Operation::Find { filter, options }, ctx)
            .await?
            .into_documents()
    }

    pub async fn find_one(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<Option<Document>> {
        Ok(self
            .find(filter, FindOptions::default().limit(1), ctx)
            .await?
            .into_iter()
            .next())
    }

    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<Option<Document>> {
        self.run(Operation::FindOneAndUpdate { filter, update, options }, ctx)
            .await?
            .into_document()
    }

    pub async fn find_one_and_delete(
        &self,
        filter: Document,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<Option<Document>> {
        self.run(Operation::FindOneAndDelete { filter }, ctx)
            .await?
            .into_document()
    }

    pub async fn count(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<u64> {
        self.run(Operation::Count { filter }, ctx)
            .await?
            .into_count()
    }

    pub async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.run(Operation::Aggregate { pipeline }, ctx)
            .await?
            .into_documents()
    }

    /// Runs a declarative [`Query`] as a `find`.
    pub async fn query(&self, query: Query, ctx: &ExecutionContext) -> DocumentStoreResult<Vec<Document>> {
        let (filter, options) = query.compile()?;

        self.find(filter, options, ctx).await
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name())
            .field("behaviors", &self.behavior_names())
            .finish()
    }
}

/// Installs behaviors on a collection and runs their one-time setup.
pub struct CollectionBuilder {
    name: String,
    backend: Arc<dyn DynStoreBackend>,
    behaviors: Vec<BehaviorRef>,
}

impl CollectionBuilder {
    pub(crate) fn new(name: String, backend: Arc<dyn DynStoreBackend>) -> Self {
        Self { name, backend, behaviors: Vec::new() }
    }

    /// Installs a behavior. Later behaviors wrap earlier ones.
    pub fn behavior(mut self, behavior: impl Behavior + 'static) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Installs an already shared behavior.
    pub fn behavior_ref(mut self, behavior: BehaviorRef) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Runs every behavior's `on_init` once, in installation order, and
    /// returns the finished collection.
    pub async fn build(self) -> DocumentStoreResult<Collection> {
        let core = CollectionCore::new(self.name, self.backend, EventBus::new());

        for behavior in &self.behaviors {
            debug!(
                collection = core.name(),
                behavior = behavior.name(),
                "installing behavior"
            );
            behavior.on_init(&core).await?;
        }

        Ok(Collection::new(core, self.behaviors.into()))
    }
}

/// A typed view of a [`Collection`].
///
/// Documents are converted with serde on the way in and out; filters and
/// update expressions stay BSON.
#[derive(Debug, Clone)]
pub struct TypedCollection<M: Model> {
    collection: Collection,
    _marker: PhantomData<M>,
}

impl<M: Model> TypedCollection<M> {
    pub fn new(collection: Collection) -> Self {
        Self { collection, _marker: PhantomData }
    }

    /// The untyped collection this view wraps.
    pub fn untyped(&self) -> &Collection {
        &self.collection
    }

    /// Converts this typed collection to a different model type.
    pub fn with_type<T: Model>(&self) -> TypedCollection<T> {
        TypedCollection::new(self.collection.clone())
    }

    pub async fn insert_one(&self, model: &M, ctx: &ExecutionContext) -> DocumentStoreResult<InsertOneResult> {
        self.collection
            .insert_one(model.to_document()?, ctx)
            .await
    }

    pub async fn insert_many(&self, models: &[M], ctx: &ExecutionContext) -> DocumentStoreResult<InsertManyResult> {
        self.collection
            .insert_many(
                models
                    .iter()
                    .map(ModelExt::to_document)
                    .collect::<DocumentStoreResult<Vec<_>>>()?,
                ctx,
            )
            .await
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<UpdateResult> {
        self.collection.update_one(filter, update, ctx).await
    }

    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<UpdateResult> {
        self.collection.update_many(filter, update, ctx).await
    }

    pub async fn delete_one(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<DeleteResult> {
        self.collection.delete_one(filter, ctx).await
    }

    pub async fn delete_many(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<DeleteResult> {
        self.collection.delete_many(filter, ctx).await
    }

    pub async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<Vec<M>> {
        self.collection
            .find(filter, options, ctx)
            .await?
            .into_iter()
            .map(M::from_document)
            .collect()
    }

    pub async fn find_one(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<Option<M>> {
        self.collection
            .find_one(filter, ctx)
            .await?
            .map(M::from_document)
            .transpose()
    }

    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<Option<M>> {
        self.collection
            .find_one_and_update(filter, update, options, ctx)
            .await?
            .map(M::from_document)
            .transpose()
    }

    pub async fn find_one_and_delete(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<Option<M>> {
        self.collection
            .find_one_and_delete(filter, ctx)
            .await?
            .map(M::from_document)
            .transpose()
    }

    pub async fn count(&self, filter: Document, ctx: &ExecutionContext) -> DocumentStoreResult<u64> {
        self.collection.count(filter, ctx).await
    }

    pub async fn query(&self, query: Query, ctx: &ExecutionContext) -> DocumentStoreResult<Vec<M>> {
        self.collection
            .query(query, ctx)
            .await?
            .into_iter()
            .map(M::from_document)
            .collect()
    }
}
