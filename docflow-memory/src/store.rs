//! In-memory storage implementation for document stores.
//!
//! Documents live in insertion order in per-collection vectors behind one
//! async-aware read-write lock. Every write holds the write lock for its whole
//! duration, so a conditional update is atomic with respect to every other
//! operation on the same store.

use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use mea::rwlock::RwLock;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::debug;

use docflow_core::{
    backend::{
        DeleteResult, DynStoreBackend, FindOneAndUpdateOptions, FindOptions, IndexOptions,
        InsertManyResult, InsertOneResult, StoreBackend, StoreBackendBuilder, StoreSession,
        UpdateOptions, UpdateResult,
    },
    error::{DocumentStoreError, DocumentStoreResult},
};

use crate::{
    evaluator::{DocumentEvaluator, values_equal},
    pipeline::{aggregate, project, sort_documents},
    update::{apply_update, resolve_positional, seed_from_filter},
};

type CollectionData = Vec<Document>;
type StoreMap = HashMap<String, CollectionData>;

/// Thread-safe in-memory document storage backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, so
/// clones share the same underlying data.
///
/// # Performance
///
/// Queries scan every document of a collection; indexes are accepted and
/// ignored. Unique indexes are not enforced.
///
/// # Transactions
///
/// [`start_transaction`](StoreBackend::start_transaction) snapshots the whole
/// store. Operations in the transaction work on the snapshot; commit writes
/// back every collection the transaction changed, replacing concurrent changes
/// to those collections.
///
/// # Example
///
/// ```ignore
/// use docflow_memory::InMemoryStore;
/// use docflow::backend::StoreBackend;
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.insert_one("users", doc! { "name": "Alice", "age": 30 }).await?;
/// assert_eq!(store.count("users", doc! {}).await?, 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    fn from_map(map: StoreMap) -> Self {
        Self { store: Arc::new(RwLock::new(map)) }
    }

    async fn snapshot(&self) -> StoreMap {
        self.store.read().await.clone()
    }
}

fn with_id(document: Document) -> (Bson, Document) {
    match document.get("_id") {
        Some(id) => (id.clone(), document),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            let mut stored = Document::new();
            stored.insert("_id", id.clone());
            stored.extend(document);
            (id, stored)
        }
    }
}

fn insert_into(collection: &str, documents: &mut CollectionData, document: Document) -> DocumentStoreResult<Bson> {
    let (id, document) = with_id(document);

    let taken = documents
        .iter()
        .any(|existing| existing.get("_id").is_some_and(|other| values_equal(other, &id)));
    if taken {
        return Err(DocumentStoreError::DocumentAlreadyExists(
            id.to_string(),
            collection.to_string(),
        ));
    }

    documents.push(document);
    Ok(id)
}

fn position(documents: &CollectionData, filter: &Document) -> DocumentStoreResult<Option<usize>> {
    for (index, document) in documents.iter().enumerate() {
        if DocumentEvaluator::new(document).matches(filter)? {
            return Ok(Some(index));
        }
    }

    Ok(None)
}

/// Applies `update` to a copy of the document, refusing `_id` changes.
fn updated_copy(document: &Document, filter: &Document, update: &Document) -> DocumentStoreResult<(Document, bool)> {
    let update = resolve_positional(document, filter, update)?;
    let mut copy = document.clone();
    let modified = apply_update(&mut copy, &update, false)?;

    if copy.get("_id") != document.get("_id") {
        return Err(DocumentStoreError::InvalidDocument(
            "the _id field cannot be modified".to_string(),
        ));
    }

    Ok((copy, modified))
}

fn upserted(filter: &Document, update: &Document) -> DocumentStoreResult<Document> {
    let mut document = seed_from_filter(filter)?;
    let update = resolve_positional(&document, filter, update)?;
    apply_update(&mut document, &update, true)?;

    Ok(document)
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn insert_one(&self, collection: &str, document: Document) -> DocumentStoreResult<InsertOneResult> {
        let mut store = self.store.write().await;
        let documents = store.entry(collection.to_string()).or_default();

        let inserted_id = insert_into(collection, documents, document)?;

        Ok(InsertOneResult { inserted_id })
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DocumentStoreResult<InsertManyResult> {
        let mut store = self.store.write().await;
        let stored = store.entry(collection.to_string()).or_default();

        let mut inserted_ids = Vec::with_capacity(documents.len());
        for document in documents {
            inserted_ids.push(insert_into(collection, stored, document)?);
        }

        Ok(InsertManyResult { inserted_ids })
    }

    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DocumentStoreResult<UpdateResult> {
        let mut store = self.store.write().await;
        let documents = store.entry(collection.to_string()).or_default();

        let mut result = UpdateResult::default();
        for document in documents.iter_mut() {
            if !DocumentEvaluator::new(document).matches(&filter)? {
                continue;
            }

            let (copy, modified) = updated_copy(document, &filter, &update)?;
            *document = copy;

            result.matched_count += 1;
            if modified {
                result.modified_count += 1;
            }

            if !options.many {
                break;
            }
        }

        if result.matched_count == 0 && options.upsert {
            let document = upserted(&filter, &update)?;
            result.upserted_id = Some(insert_into(collection, documents, document)?);
        }

        Ok(result)
    }

    async fn delete(&self, collection: &str, filter: Document, many: bool) -> DocumentStoreResult<DeleteResult> {
        let mut store = self.store.write().await;
        let Some(documents) = store.get_mut(collection) else {
            return Ok(DeleteResult::default());
        };

        let mut doomed = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            if DocumentEvaluator::new(document).matches(&filter)? {
                doomed.push(index);
                if !many {
                    break;
                }
            }
        }

        for index in doomed.iter().rev() {
            documents.remove(*index);
        }
        let deleted_count = doomed.len() as u64;

        Ok(DeleteResult { deleted_count })
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        let store = self.store.read().await;
        let Some(documents) = store.get(collection) else {
            return Ok(vec![]);
        };

        let mut matched = DocumentEvaluator::filter_documents(documents.iter(), &filter)?;

        if let Some(sort) = &options.sort {
            sort_documents(&mut matched, sort)?;
        }

        let matched = matched
            .into_iter()
            .skip(options.skip.unwrap_or(0) as usize)
            .take(options.limit.map_or(usize::MAX, |limit| limit as usize));

        match &options.projection {
            Some(projection) => matched
                .map(|document| project(&document, projection))
                .collect(),
            None => Ok(matched.collect()),
        }
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> DocumentStoreResult<Option<Document>> {
        let mut store = self.store.write().await;
        let documents = store.entry(collection.to_string()).or_default();

        match position(documents, &filter)? {
            Some(index) => {
                let (copy, _) = updated_copy(&documents[index], &filter, &update)?;
                let before = std::mem::replace(&mut documents[index], copy);

                Ok(Some(match options.return_new {
                    true => documents[index].clone(),
                    false => before,
                }))
            }
            None if options.upsert => {
                let (_, document) = with_id(upserted(&filter, &update)?);
                insert_into(collection, documents, document.clone())?;

                Ok(options.return_new.then_some(document))
            }
            None => Ok(None),
        }
    }

    async fn find_one_and_delete(&self, collection: &str, filter: Document) -> DocumentStoreResult<Option<Document>> {
        let mut store = self.store.write().await;
        let Some(documents) = store.get_mut(collection) else {
            return Ok(None);
        };

        Ok(position(documents, &filter)?.map(|index| documents.remove(index)))
    }

    async fn count(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        let store = self.store.read().await;
        let Some(documents) = store.get(collection) else {
            return Ok(0);
        };

        let mut count = 0;
        for document in documents {
            if DocumentEvaluator::new(document).matches(&filter)? {
                count += 1;
            }
        }

        Ok(count)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> DocumentStoreResult<Vec<Document>> {
        let documents = self
            .store
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default();

        aggregate(documents, &pipeline)
    }

    async fn create_index(&self, collection: &str, keys: Document, options: IndexOptions) -> DocumentStoreResult<()> {
        debug!(collection, ?keys, unique = options.unique, "index requested on in-memory store");

        self.create_collection(collection).await
    }

    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.store
            .write()
            .await
            .entry(name.to_string())
            .or_default();

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.store.write().await.remove(name);

        Ok(())
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        let mut names = self
            .store
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }

    async fn start_transaction(&self) -> DocumentStoreResult<Box<dyn StoreSession>> {
        let base = self.snapshot().await;
        let scratch = InMemoryStore::from_map(base.clone());

        Ok(Box::new(InMemorySession {
            target: self.clone(),
            base,
            scratch,
            finished: false,
        }))
    }
}

/// A snapshot transaction over an [`InMemoryStore`].
pub struct InMemorySession {
    target: InMemoryStore,
    base: StoreMap,
    scratch: InMemoryStore,
    finished: bool,
}

impl InMemorySession {
    fn ensure_open(&self) -> DocumentStoreResult<()> {
        match self.finished {
            true => Err(DocumentStoreError::Backend("transaction already finished".to_string())),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    fn backend(&self) -> Arc<dyn DynStoreBackend> {
        Arc::new(self.scratch.clone())
    }

    async fn commit(&mut self) -> DocumentStoreResult<()> {
        self.ensure_open()?;
        self.finished = true;

        let changes = self.scratch.snapshot().await;
        let mut target = self.target.store.write().await;

        let names = self
            .base
            .keys()
            .chain(changes.keys())
            .cloned()
            .collect::<BTreeSet<_>>();

        for name in names {
            let after = changes.get(&name);
            if self.base.get(&name) == after {
                continue;
            }

            match after {
                Some(documents) => {
                    target.insert(name, documents.clone());
                }
                None => {
                    target.remove(&name);
                }
            }
        }

        Ok(())
    }

    async fn abort(&mut self) -> DocumentStoreResult<()> {
        self.ensure_open()?;
        self.finished = true;

        Ok(())
    }

    async fn end(self: Box<Self>) -> DocumentStoreResult<()> {
        if !self.finished {
            debug!("ending in-memory session without commit, discarding its writes");
        }

        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
#[derive(Default)]
pub struct InMemoryStoreBuilder {
    collections: Vec<(String, Vec<Document>)>,
}

impl InMemoryStoreBuilder {
    /// Seeds a collection with documents. `_id`s are generated where missing.
    pub fn with_collection(mut self, name: impl Into<String>, documents: Vec<Document>) -> Self {
        self.collections.push((name.into(), documents));
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        let store = InMemoryStore::new();

        for (name, documents) in self.collections {
            store.create_collection(&name).await?;
            store.insert_many(&name, documents).await?;
        }

        Ok(store)
    }
}
