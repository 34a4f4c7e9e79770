use docflow::{
    async_trait,
    backend::{DeleteResult, IndexOptions, InsertManyResult, InsertOneResult, UpdateResult},
    bson::{Bson, Document, doc},
    memory::InMemoryStore,
    prelude::*,
};
use futures::future::{Ready, ready};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: &str) -> impl Fn(MigrateOp) -> Ready<DocumentStoreResult<()>> + Send + Sync + 'static {
    let log = log.clone();
    let entry = entry.to_string();

    move |_op| {
        log.lock().unwrap().push(entry.clone());
        ready(Ok(()))
    }
}

fn runner(store: &DocumentStore) -> MigrationRunner {
    MigrationRunner::new(store.clone(), MigrationConfig::default())
}

fn reversible(log: &Log, version: u32) -> MigrationStep {
    MigrationStep::new(version, record(log, &format!("up{}", version)))
        .with_down(record(log, &format!("down{}", version)))
}

#[tokio::test]
async fn test_migrates_up_and_down() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    for version in [2, 1, 3] {
        runner.add(reversible(&log, version)).unwrap();
    }

    assert_eq!(runner.versions(), vec![1, 2, 3]);
    assert_eq!(runner.current_version().await.unwrap(), 0);

    runner.migrate_to(2).await.unwrap();
    assert_eq!(runner.current_version().await.unwrap(), 2);

    runner.migrate_to_latest().await.unwrap();
    runner.migrate_to(0).await.unwrap();

    let status = runner.get_status().await.unwrap();
    assert_eq!(status.version, 0);
    assert!(!status.locked);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["up1", "up2", "up3", "down3", "down2", "down1"]
    );
}

#[tokio::test]
async fn test_schema_helpers_edit_documents() {
    let store = DocumentStore::new(InMemoryStore::new());
    let users = store.collection("users");
    let ctx = ExecutionContext::system();
    users
        .insert_many(vec![doc! { "_id": 1, "name": "a" }, doc! { "_id": 2, "name": "b", "age": 7 }], &ctx)
        .await
        .unwrap();

    let mut runner = runner(&store);
    runner
        .add(
            MigrationStep::new(1, |op: MigrateOp| async move { op.add_field("users", "age", 0).await })
                .with_down(|op: MigrateOp| async move { op.drop_field("users", "age").await }),
        )
        .unwrap();
    runner
        .add(
            MigrationStep::new(2, |op: MigrateOp| async move {
                op.rename_field("users", "name", "fullName").await?;
                op.add_index("users", "fullName", true).await
            })
            .with_down(|op: MigrateOp| async move { op.rename_field("users", "fullName", "name").await }),
        )
        .unwrap();

    runner.migrate_to_latest().await.unwrap();
    assert_eq!(
        users.find(doc! {}, FindOptions::default().sort(doc! { "_id": 1 }), &ctx).await.unwrap(),
        vec![doc! { "_id": 1, "age": 0, "fullName": "a" }, doc! { "_id": 2, "age": 7, "fullName": "b" }]
    );

    runner.migrate_to(0).await.unwrap();
    assert_eq!(
        users.find(doc! {}, FindOptions::default().sort(doc! { "_id": 1 }), &ctx).await.unwrap(),
        vec![doc! { "_id": 1, "name": "a" }, doc! { "_id": 2, "name": "b" }]
    );
}

#[tokio::test]
async fn test_exactly_one_concurrent_lock_wins() {
    let store = DocumentStore::new(InMemoryStore::new());
    let runner = Arc::new(runner(&store));

    let attempts = (0..8)
        .map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.lock().await.unwrap() })
        })
        .collect::<Vec<_>>();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let locked_at = runner.get_status().await.unwrap().locked_at;
    assert!(locked_at.is_some());
    assert!(!runner.lock().await.unwrap());
    assert_eq!(runner.get_status().await.unwrap().locked_at, locked_at);
}

#[tokio::test]
async fn test_locked_store_is_not_migrated() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(reversible(&log, 1)).unwrap();

    assert!(runner.lock().await.unwrap());
    runner.migrate_to_latest().await.unwrap();

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(runner.current_version().await.unwrap(), 0);

    runner.unlock(0).await.unwrap();
    runner.migrate_to_latest().await.unwrap();
    assert_eq!(runner.current_version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failing_step_leaves_migrations_locked() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(reversible(&log, 1)).unwrap();
    runner
        .add(MigrationStep::new(2, |_op: MigrateOp| async {
            Err(DocumentStoreError::Backend("disk full".to_string()))
        }))
        .unwrap();
    runner.add(reversible(&log, 3)).unwrap();

    let err = runner.migrate_to_latest().await.unwrap_err();
    assert_eq!(err, DocumentStoreError::Backend("disk full".to_string()));

    let status = runner.get_status().await.unwrap();
    assert!(status.locked);
    assert!(status.locked_at.is_some());
    let last_error = status.last_error.unwrap();
    assert_eq!(last_error.from_version, 1);
    assert!(last_error.message.contains("disk full"));

    // Later runs back off until an operator unlocks.
    runner.migrate_to_latest().await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["up1"]);

    runner.unlock(1).await.unwrap();
    assert_eq!(runner.get_status().await.unwrap().last_error, None);
}

#[tokio::test]
async fn test_missing_down_unlocks_at_reached_version() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(reversible(&log, 1)).unwrap();
    runner.add(MigrationStep::new(2, record(&log, "up2"))).unwrap();
    runner.add(reversible(&log, 3)).unwrap();

    runner.migrate_to_latest().await.unwrap();
    let err = runner.migrate_to(0).await.unwrap_err();

    assert!(matches!(
        err,
        DocumentStoreError::MigrationStepMissingDirection { version: 2, .. }
    ));

    let status = runner.get_status().await.unwrap();
    assert_eq!(status.version, 2);
    assert!(!status.locked);
    assert_eq!(status.last_error, None);
    assert_eq!(*log.lock().unwrap(), vec!["up1", "up2", "up3", "down3"]);
}

/// In-memory backend whose lock-releasing writes fail once `refuse_unlock` is set.
#[derive(Debug, Clone, Default)]
struct StubbornLock {
    inner: InMemoryStore,
    refuse_unlock: Arc<AtomicBool>,
}

impl StubbornLock {
    fn releases_lock(update: &Document) -> bool {
        update
            .get_document("$set")
            .is_ok_and(|set| set.get("locked") == Some(&Bson::Boolean(false)))
    }
}

#[async_trait]
impl StoreBackend for StubbornLock {
    async fn insert_one(&self, collection: &str, document: Document) -> DocumentStoreResult<InsertOneResult> {
        self.inner.insert_one(collection, document).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> DocumentStoreResult<InsertManyResult> {
        self.inner.insert_many(collection, documents).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DocumentStoreResult<UpdateResult> {
        if self.refuse_unlock.load(Ordering::SeqCst) && Self::releases_lock(&update) {
            return Err(DocumentStoreError::Unknown("store unavailable".to_string()));
        }
        self.inner.update(collection, filter, update, options).await
    }

    async fn delete(&self, collection: &str, filter: Document, many: bool) -> DocumentStoreResult<DeleteResult> {
        self.inner.delete(collection, filter, many).await
    }

    async fn find(&self, collection: &str, filter: Document, options: FindOptions) -> DocumentStoreResult<Vec<Document>> {
        self.inner.find(collection, filter, options).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> DocumentStoreResult<Option<Document>> {
        self.inner.find_one_and_update(collection, filter, update, options).await
    }

    async fn find_one_and_delete(&self, collection: &str, filter: Document) -> DocumentStoreResult<Option<Document>> {
        self.inner.find_one_and_delete(collection, filter).await
    }

    async fn count(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        self.inner.count(collection, filter).await
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> DocumentStoreResult<Vec<Document>> {
        self.inner.aggregate(collection, pipeline).await
    }

    async fn create_index(&self, collection: &str, keys: Document, options: IndexOptions) -> DocumentStoreResult<()> {
        self.inner.create_index(collection, keys, options).await
    }

    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.inner.create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.inner.drop_collection(name).await
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.inner.list_collections().await
    }

    async fn start_transaction(&self) -> DocumentStoreResult<Box<dyn StoreSession>> {
        self.inner.start_transaction().await
    }
}

#[tokio::test]
async fn test_missing_down_error_survives_failed_unlock() {
    let backend = StubbornLock::default();
    let refuse_unlock = backend.refuse_unlock.clone();
    let store = DocumentStore::new(backend);
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(MigrationStep::new(1, record(&log, "up1"))).unwrap();

    runner.migrate_to_latest().await.unwrap();
    refuse_unlock.store(true, Ordering::SeqCst);
    let err = runner.migrate_to(0).await.unwrap_err();

    assert!(matches!(
        err,
        DocumentStoreError::MigrationStepMissingDirection { version: 1, .. }
    ));

    let status = runner.get_status().await.unwrap();
    assert!(status.locked);
    assert_eq!(status.version, 1);
}

#[tokio::test]
async fn test_registry_rejects_duplicates_and_baseline() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(reversible(&log, 1)).unwrap();

    assert_eq!(
        runner.add(reversible(&log, 1)).unwrap_err(),
        DocumentStoreError::DuplicateMigrationVersion(1)
    );
    assert!(runner.add(reversible(&log, 0)).is_err());
    assert_eq!(runner.versions(), vec![1]);
    assert_eq!(runner.latest_version(), Some(1));
}

#[tokio::test]
async fn test_unknown_target_is_an_error() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(reversible(&log, 1)).unwrap();

    assert!(matches!(runner.migrate_to(7).await, Err(DocumentStoreError::Migration(_))));
    assert!(!runner.get_status().await.unwrap().locked);
    assert!(runner.rerun(7).await.is_err());
}

#[tokio::test]
async fn test_rerun_keeps_the_recorded_version() {
    let store = DocumentStore::new(InMemoryStore::new());
    let log = Log::default();
    let mut runner = runner(&store);
    runner.add(reversible(&log, 1)).unwrap();
    runner.add(reversible(&log, 2)).unwrap();

    runner.migrate_to_latest().await.unwrap();
    runner.rerun(1).await.unwrap();

    assert_eq!(runner.current_version().await.unwrap(), 2);
    assert_eq!(*log.lock().unwrap(), vec!["up1", "up2", "up1"]);
    assert!(!runner.get_status().await.unwrap().locked);
}

#[tokio::test]
async fn test_empty_registry_is_a_no_op() {
    let store = DocumentStore::new(InMemoryStore::new());
    let runner = runner(&store);

    runner.migrate_to_latest().await.unwrap();

    assert!(store.list_collections().await.unwrap().is_empty());
}

struct CreateAudit;

#[async_trait]
impl Migration for CreateAudit {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> Option<&str> {
        Some("create_audit")
    }

    async fn up(&self, op: &MigrateOp) -> DocumentStoreResult<()> {
        op.create_collection("audit").await
    }

    async fn down(&self, op: &MigrateOp) -> DocumentStoreResult<()> {
        op.drop_collection("audit").await
    }
}

struct AppMigrations;

impl Migrations for AppMigrations {
    fn migrations() -> Vec<MigrationRef> {
        vec![Arc::new(CreateAudit)]
    }
}

#[tokio::test]
async fn test_registered_migration_sets() {
    let store = DocumentStore::new(InMemoryStore::new());
    let mut runner = MigrationRunner::new(
        store.clone(),
        MigrationConfig { collection: "schema".to_string(), log_if_latest: false },
    );
    runner.register::<AppMigrations>().unwrap();

    runner.migrate_to_latest().await.unwrap();
    assert_eq!(store.list_collections().await.unwrap(), vec!["audit", "schema"]);

    runner.migrate_to(0).await.unwrap();
    assert_eq!(store.list_collections().await.unwrap(), vec!["schema"]);
}
