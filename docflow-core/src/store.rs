//! Main document store interface.
//!
//! [`DocumentStore`] owns a backend behind dynamic dispatch and hands out
//! [`Collection`] façades. It also scopes work to a transaction with
//! [`DocumentStore::transact`].
//!
//! # Example
//!
//! ```ignore
//! use docflow::store::DocumentStore;
//! use docflow::memory::InMemoryStore;
//!
//! let store = DocumentStore::new(InMemoryStore::new());
//! let users = store.collection("users");
//! ```

use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

use crate::{
    backend::{DynStoreBackend, StoreBackend},
    collection::{Collection, CollectionBuilder, CollectionCore, TypedCollection},
    error::DocumentStoreResult,
    event::EventBus,
    model::Model,
};

/// A document store bound to a backend.
///
/// Cloning is cheap; clones share the backend.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    backend: Arc<dyn DynStoreBackend>,
}

impl DocumentStore {
    /// Creates a new document store with the given backend.
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self { backend: Arc::new(backend) }
    }

    /// Creates a store over an already shared backend.
    pub fn from_arc(backend: Arc<dyn DynStoreBackend>) -> Self {
        Self { backend }
    }

    /// The backend, without events or behaviors.
    pub fn backend(&self) -> &Arc<dyn DynStoreBackend> {
        &self.backend
    }

    /// Attempts to view the backend as a concrete type.
    pub fn backend_as<B: StoreBackend + 'static>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref::<B>()
    }

    /// Gets a collection with the given name and no behaviors.
    ///
    /// Every call returns a new façade with its own, empty listener registry.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(
            CollectionCore::new(name.to_string(), self.backend.clone(), EventBus::new()),
            Arc::from(Vec::new()),
        )
    }

    /// Starts building a collection with behaviors.
    pub fn collection_builder(&self, name: &str) -> CollectionBuilder {
        CollectionBuilder::new(name.to_string(), self.backend.clone())
    }

    /// Gets a typed collection named after the model.
    pub fn typed_collection<M: Model>(&self) -> TypedCollection<M> {
        self.collection(M::collection_name()).typed()
    }

    /// Creates a new collection with the given name.
    pub async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.backend.create_collection(name).await
    }

    /// Drops a collection and all of its documents.
    pub async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.backend.drop_collection(name).await
    }

    /// Lists all collections in the store.
    pub async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.backend.list_collections().await
    }

    /// Runs `work` inside a transaction.
    ///
    /// `work` receives a store bound to the transaction; collections obtained
    /// from it (or re-bound to it with [`Collection::bind`]) participate in the
    /// transaction. The transaction commits when `work` succeeds and is aborted
    /// when it fails, in which case the error of `work` is returned. The session
    /// is ended on every path.
    ///
    /// # Example
    ///
    /// ```ignore
    /// store.transact(|tx| async move {
    ///     let accounts = accounts.bind(&tx);
    ///     accounts.update_one(doc! { "_id": from }, doc! { "$inc": { "balance": -10 } }, &ctx).await?;
    ///     accounts.update_one(doc! { "_id": to }, doc! { "$inc": { "balance": 10 } }, &ctx).await?;
    ///     Ok(())
    /// }).await?;
    /// ```
    pub async fn transact<F, Fut, T>(&self, work: F) -> DocumentStoreResult<T>
    where
        F: FnOnce(DocumentStore) -> Fut,
        Fut: Future<Output = DocumentStoreResult<T>>,
    {
        let mut session = self.backend.start_transaction().await?;
        debug!("transaction started");

        let scoped = DocumentStore::from_arc(session.backend());
        let outcome = match work(scoped).await {
            Ok(value) => session.commit().await.map(|_| value),
            Err(err) => {
                if let Err(abort_err) = session.abort().await {
                    warn!(error = %abort_err, "failed to abort transaction");
                }
                Err(err)
            }
        };

        if let Err(end_err) = session.end().await {
            warn!(error = %end_err, "failed to end transaction session");
        }

        debug!(committed = outcome.is_ok(), "transaction finished");
        outcome
    }

    /// Shuts down the store and releases backend resources.
    pub async fn shutdown(&self) -> DocumentStoreResult<()> {
        self.backend.shutdown().await
    }
}
