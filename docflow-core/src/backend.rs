//! Storage backend abstraction for the document store.
//!
//! This module defines the raw store contract the rest of the crate is built on.
//! Backends execute physical operations against named collections of BSON
//! documents: Mongo-style filters select documents, Mongo-style update
//! expressions modify them. Backends know nothing about lifecycle events or
//! behaviors; those live in [`crate::collection`] and [`crate::behavior`].
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`DynStoreBackend`]: A trait for dynamic dispatch over backend implementations
//! - [`StoreSession`]: A transaction scope opened by a backend
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use docflow::backend::{StoreBackend, UpdateOptions};
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.insert_one("users", doc! { "name": "Alice", "age": 30 }).await?;
//! backend
//!     .update(
//!         "users",
//!         doc! { "name": "Alice" },
//!         doc! { "$inc": { "age": 1 } },
//!         UpdateOptions::default(),
//!     )
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{any::Any, fmt::Debug, sync::Arc};

use crate::error::DocumentStoreResult;

/// Result of a single-document insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    /// The `_id` of the stored document, generated when the document had none.
    pub inserted_id: Bson,
}

/// Result of a multi-document insert.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertManyResult {
    /// The `_id`s of the stored documents, in input order.
    pub inserted_ids: Vec<Bson>,
}

/// Result of an update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    /// Number of documents matched by the filter.
    pub matched_count: u64,
    /// Number of documents actually changed.
    pub modified_count: u64,
    /// The `_id` of the document created by an upsert.
    pub upserted_id: Option<Bson>,
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    /// Number of documents removed (or flagged, for soft deletes).
    pub deleted_count: u64,
}

impl From<UpdateResult> for DeleteResult {
    /// Reinterprets a flagging update as a delete.
    fn from(result: UpdateResult) -> Self {
        Self { deleted_count: result.modified_count }
    }
}

/// Options for [`StoreBackend::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOptions {
    /// Update every matching document instead of the first one.
    pub many: bool,
    /// Insert a document built from the filter's equality fields when nothing matches.
    pub upsert: bool,
}

impl UpdateOptions {
    /// Options for a single-document update.
    pub fn one() -> Self {
        Self::default()
    }

    /// Options for a multi-document update.
    pub fn many() -> Self {
        Self { many: true, upsert: false }
    }

    /// Enables upserting.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

/// Options for [`StoreBackend::find`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOptions {
    /// Sort specification, e.g. `{ "createdAt": -1 }`.
    pub sort: Option<Document>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Maximum number of documents to return.
    pub limit: Option<u64>,
    /// Projection specification, e.g. `{ "title": 1 }`.
    pub projection: Option<Document>,
}

impl FindOptions {
    /// Sets the sort specification.
    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets the number of documents to skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the projection.
    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// Options for [`StoreBackend::find_one_and_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FindOneAndUpdateOptions {
    /// Return the document as it is after the update instead of before.
    pub return_new: bool,
    /// Insert a document when nothing matches.
    pub upsert: bool,
}

/// Options for [`StoreBackend::create_index`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexOptions {
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Explicit index name. Backends derive one from the keys when absent.
    pub name: Option<String>,
}

/// Abstract interface for document storage backends.
///
/// Implementers provide the physical operations the collection layer wraps
/// with lifecycle events and behaviors.
///
/// # Atomicity
///
/// A single [`update`](StoreBackend::update) must apply its filter check and
/// modification atomically for each document it touches. The migration lock
/// relies on this: a conditional update with `many: false` is the only
/// mutual-exclusion primitive this crate uses across processes.
///
/// # Error Handling
///
/// Operations return [`DocumentStoreResult<T>`](crate::error::DocumentStoreResult).
/// Errors are propagated to callers unmodified.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Inserts one document, generating an ObjectId `_id` when it has none.
    ///
    /// Fails with [`DocumentAlreadyExists`](crate::error::DocumentStoreError::DocumentAlreadyExists)
    /// when the `_id` is taken.
    async fn insert_one(&self, collection: &str, document: Document) -> DocumentStoreResult<InsertOneResult>;

    /// Inserts several documents in order, stopping at the first failure.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DocumentStoreResult<InsertManyResult>;

    /// Applies an update expression to the documents matching `filter`.
    ///
    /// # Arguments
    ///
    /// * `collection` - The collection to update
    /// * `filter` - Selects the documents to update
    /// * `update` - A document of update operators (`$set`, `$unset`, ...)
    /// * `options` - Multiplicity and upsert behaviour
    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DocumentStoreResult<UpdateResult>;

    /// Removes the first (or every, when `many` is set) document matching `filter`.
    async fn delete(&self, collection: &str, filter: Document, many: bool) -> DocumentStoreResult<DeleteResult>;

    /// Returns the documents matching `filter`.
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>>;

    /// Atomically updates the first matching document and returns it.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> DocumentStoreResult<Option<Document>>;

    /// Atomically removes the first matching document and returns it.
    async fn find_one_and_delete(&self, collection: &str, filter: Document) -> DocumentStoreResult<Option<Document>>;

    /// Counts the documents matching `filter`.
    async fn count(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64>;

    /// Runs an aggregation pipeline.
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> DocumentStoreResult<Vec<Document>>;

    /// Ensures an index exists. Creating an existing index is a no-op.
    async fn create_index(&self, collection: &str, keys: Document, options: IndexOptions) -> DocumentStoreResult<()>;

    /// Creates an empty collection. Creating an existing collection is a no-op.
    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()>;

    /// Drops a collection and all of its documents.
    ///
    /// # Warning
    ///
    /// This operation is irreversible.
    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()>;

    /// Lists the names of all collections in the store.
    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>>;

    /// Opens a session with a started transaction.
    ///
    /// Operations issued through [`StoreSession::backend`] run inside the
    /// transaction until it is committed or aborted.
    async fn start_transaction(&self) -> DocumentStoreResult<Box<dyn StoreSession>>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(&self) -> DocumentStoreResult<()> {
        Ok(())
    }
}

/// A transaction scope opened by [`StoreBackend::start_transaction`].
///
/// Callers must call [`end`](StoreSession::end) on every exit path;
/// [`DocumentStore::transact`](crate::store::DocumentStore::transact) does this for you.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// A backend whose operations are bound to this session.
    fn backend(&self) -> Arc<dyn DynStoreBackend>;

    /// Commits the transaction.
    async fn commit(&mut self) -> DocumentStoreResult<()>;

    /// Aborts the transaction, discarding its writes.
    async fn abort(&mut self) -> DocumentStoreResult<()>;

    /// Releases the session.
    async fn end(self: Box<Self>) -> DocumentStoreResult<()>;
}

/// Object-safe mirror of [`StoreBackend`], implemented for every backend.
pub trait DynStoreBackend: StoreBackend {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<B: StoreBackend + 'static> DynStoreBackend for B {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}
