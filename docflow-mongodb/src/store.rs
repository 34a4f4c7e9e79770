use async_trait::async_trait;
use bson::{Bson, Document};
use futures::TryStreamExt;
use mea::mutex::Mutex;
use mongodb::{
    Client, ClientSession, Collection as MongoCollection, IndexModel,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{self, ClientOptions, ReturnDocument},
};
use std::{fmt, sync::Arc};
use tracing::debug;

use docflow_core::{
    backend::{
        DeleteResult, DynStoreBackend, FindOneAndUpdateOptions, FindOptions, IndexOptions,
        InsertManyResult, InsertOneResult, StoreBackend, StoreBackendBuilder, StoreSession,
        UpdateOptions, UpdateResult,
    },
    error::{DocumentStoreError, DocumentStoreResult},
};

const DUPLICATE_KEY: i32 = 11000;
const NAMESPACE_EXISTS: i32 = 48;

/// Runs a driver action, bound to the store's session when it has one.
macro_rules! with_session {
    ($store:expr, $action:expr) => {
        match &$store.session {
            Some(session) => {
                let mut session = session.lock().await;
                $action.session(&mut *session).await
            }
            None => $action.await,
        }
    };
}

fn backend_error(error: MongoError) -> DocumentStoreError {
    DocumentStoreError::Backend(error.to_string())
}

fn write_error(error: MongoError, collection: &str, id: &Bson) -> DocumentStoreError {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
            DocumentStoreError::DocumentAlreadyExists(id.to_string(), collection.to_string())
        }
        _ => backend_error(error),
    }
}

fn find_options(options: FindOptions) -> options::FindOptions {
    let mut find_options = options::FindOptions::default();

    find_options.sort = options.sort;
    find_options.skip = options.skip;
    find_options.limit = options.limit.map(|limit| limit as i64);
    find_options.projection = options.projection;

    find_options
}

/// MongoDB-backed [`StoreBackend`].
///
/// A store returned by [`StoreSession::backend`] carries a client session with
/// a started transaction; every operation it issues runs in that transaction.
#[derive(Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
    session: Option<Arc<Mutex<ClientSession>>>,
}

impl fmt::Debug for MongoDbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoDbStore")
            .field("database", &self.database)
            .field("in_transaction", &self.session.is_some())
            .finish()
    }
}

impl MongoDbStore {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            session: None,
        }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    /// The underlying driver client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(collection_name)
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn insert_one(&self, collection: &str, document: Document) -> DocumentStoreResult<InsertOneResult> {
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);
        let result = with_session!(self, self.get_collection(collection).insert_one(document))
            .map_err(|e| write_error(e, collection, &id))?;

        Ok(InsertOneResult { inserted_id: result.inserted_id })
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DocumentStoreResult<InsertManyResult> {
        if documents.is_empty() {
            return Ok(InsertManyResult::default());
        }

        let result = with_session!(self, self.get_collection(collection).insert_many(documents))
            .map_err(backend_error)?;

        let mut inserted = result.inserted_ids.into_iter().collect::<Vec<_>>();
        inserted.sort_by_key(|(index, _)| *index);

        Ok(InsertManyResult {
            inserted_ids: inserted.into_iter().map(|(_, id)| id).collect(),
        })
    }

    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DocumentStoreResult<UpdateResult> {
        let mongo = self.get_collection(collection);
        let result = match options.many {
            true => with_session!(self, mongo.update_many(filter, update).upsert(options.upsert)),
            false => with_session!(self, mongo.update_one(filter, update).upsert(options.upsert)),
        }
        .map_err(backend_error)?;

        Ok(UpdateResult {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn delete(&self, collection: &str, filter: Document, many: bool) -> DocumentStoreResult<DeleteResult> {
        let mongo = self.get_collection(collection);
        let result = match many {
            true => with_session!(self, mongo.delete_many(filter)),
            false => with_session!(self, mongo.delete_one(filter)),
        }
        .map_err(backend_error)?;

        Ok(DeleteResult { deleted_count: result.deleted_count })
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        let mongo = self.get_collection(collection);
        let find = mongo.find(filter).with_options(find_options(options));

        match &self.session {
            Some(session) => {
                let mut session = session.lock().await;
                let mut cursor = find.session(&mut *session).await.map_err(backend_error)?;

                cursor
                    .stream(&mut *session)
                    .try_collect::<Vec<Document>>()
                    .await
                    .map_err(backend_error)
            }
            None => find
                .await
                .map_err(backend_error)?
                .try_collect::<Vec<Document>>()
                .await
                .map_err(backend_error),
        }
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> DocumentStoreResult<Option<Document>> {
        let return_document = match options.return_new {
            true => ReturnDocument::After,
            false => ReturnDocument::Before,
        };

        with_session!(
            self,
            self.get_collection(collection)
                .find_one_and_update(filter, update)
                .return_document(return_document)
                .upsert(options.upsert)
        )
        .map_err(backend_error)
    }

    async fn find_one_and_delete(&self, collection: &str, filter: Document) -> DocumentStoreResult<Option<Document>> {
        with_session!(self, self.get_collection(collection).find_one_and_delete(filter))
            .map_err(backend_error)
    }

    async fn count(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        with_session!(self, self.get_collection(collection).count_documents(filter))
            .map_err(backend_error)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> DocumentStoreResult<Vec<Document>> {
        let mongo = self.get_collection(collection);
        let aggregate = mongo.aggregate(pipeline);

        match &self.session {
            Some(session) => {
                let mut session = session.lock().await;
                let mut cursor = aggregate.session(&mut *session).await.map_err(backend_error)?;

                cursor
                    .stream(&mut *session)
                    .try_collect::<Vec<Document>>()
                    .await
                    .map_err(backend_error)
            }
            None => aggregate
                .await
                .map_err(backend_error)?
                .try_collect::<Vec<Document>>()
                .await
                .map_err(backend_error),
        }
    }

    async fn create_index(&self, collection: &str, keys: Document, options: IndexOptions) -> DocumentStoreResult<()> {
        let model = IndexModel::builder()
            .keys(keys)
            .options(
                options::IndexOptions::builder()
                    .unique(options.unique)
                    .name(options.name)
                    .build()
            )
            .build();

        with_session!(self, self.get_collection(collection).create_index(model))
            .map_err(backend_error)?;

        Ok(())
    }

    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        let database = self.client.database(&self.database);

        match with_session!(self, database.create_collection(name)) {
            Ok(()) => Ok(()),
            Err(error) if matches!(error.kind.as_ref(), ErrorKind::Command(command) if command.code == NAMESPACE_EXISTS) => {
                debug!(collection = name, "collection already exists");
                Ok(())
            }
            Err(error) => Err(backend_error(error)),
        }
    }

    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        with_session!(self, self.get_collection(name).drop())
            .map_err(backend_error)
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        let database = self.client.database(&self.database);
        let mut names = with_session!(self, database.list_collection_names())
            .map_err(backend_error)?;
        names.sort();

        Ok(names)
    }

    async fn start_transaction(&self) -> DocumentStoreResult<Box<dyn StoreSession>> {
        if self.session.is_some() {
            return Err(DocumentStoreError::Backend("nested transactions are not supported".to_string()));
        }

        let mut session = self.client.start_session().await.map_err(backend_error)?;
        session.start_transaction().await.map_err(backend_error)?;

        Ok(Box::new(MongoDbSession {
            store: MongoDbStore {
                client: self.client.clone(),
                database: self.database.clone(),
                session: Some(Arc::new(Mutex::new(session))),
            },
        }))
    }

    async fn shutdown(&self) -> DocumentStoreResult<()> {
        self.client.clone().shutdown().await;

        Ok(())
    }
}

/// A MongoDB client session with a started transaction.
pub struct MongoDbSession {
    store: MongoDbStore,
}

impl MongoDbSession {
    fn client_session(&self) -> DocumentStoreResult<&Arc<Mutex<ClientSession>>> {
        self.store
            .session
            .as_ref()
            .ok_or_else(|| DocumentStoreError::Backend("session is not bound to a transaction".to_string()))
    }
}

#[async_trait]
impl StoreSession for MongoDbSession {
    fn backend(&self) -> Arc<dyn DynStoreBackend> {
        Arc::new(self.store.clone())
    }

    async fn commit(&mut self) -> DocumentStoreResult<()> {
        let mut session = self.client_session()?.lock().await;

        session.commit_transaction().await.map_err(backend_error)
    }

    async fn abort(&mut self) -> DocumentStoreResult<()> {
        let mut session = self.client_session()?.lock().await;

        session.abort_transaction().await.map_err(backend_error)
    }

    async fn end(self: Box<Self>) -> DocumentStoreResult<()> {
        debug!(database = %self.store.database, "ending client session");

        Ok(())
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            )
            .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_find_options_translation() {
        let options = find_options(
            FindOptions::default()
                .sort(doc! { "n": -1 })
                .skip(5)
                .limit(10)
                .projection(doc! { "n": 1 }),
        );

        assert_eq!(options.sort, Some(doc! { "n": -1 }));
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.projection, Some(doc! { "n": 1 }));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_dsn() {
        let result = MongoDbStore::builder("not-a-dsn", "db").build().await;

        assert!(matches!(result, Err(DocumentStoreError::Initialization(_))));
    }
}
