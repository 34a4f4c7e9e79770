//! Versioned schema migrations with a store-backed lock.
//!
//! Migrations are numbered steps with an `up` and an optional `down` function.
//! A [`MigrationRunner`] walks the registered steps from the version recorded
//! in a single status document to a target version. The status document also
//! carries a lock flag; acquiring it is one conditional update, so at most one
//! process migrates at a time no matter how many start together.
//!
//! # Migration Traits
//!
//! - [`Migration`] - Individual migration step
//! - [`Migrations`] - Static provider of a set of steps
//! - [`MigrationStep`] - Closure-backed [`Migration`]
//!
//! # Example
//!
//! ```ignore
//! use docflow::migrate::{MigrationConfig, MigrationRunner, MigrationStep};
//!
//! let mut runner = MigrationRunner::new(store.clone(), MigrationConfig::default());
//!
//! runner.add(
//!     MigrationStep::new(1, |op| async move {
//!         op.add_field("users", "active", true).await
//!     })
//!     .with_name("users.active")
//!     .with_down(|op| async move { op.drop_field("users", "active").await }),
//! )?;
//!
//! runner.migrate_to_latest().await?;
//! ```
//!
//! # Failure handling
//!
//! When a step fails, the runner records `lastError` on the status document,
//! leaves the lock engaged and returns the step's error. Nothing migrates
//! again until an operator fixes the cause and calls
//! [`MigrationRunner::unlock`].

use async_trait::async_trait;
use bson::{Bson, DateTime, Document, doc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc};
use tracing::{error, info, warn};

use crate::{
    backend::{FindOptions, IndexOptions, UpdateOptions},
    collection::{Collection, TypedCollection},
    error::{DocumentStoreError, DocumentStoreResult},
    model::Model,
    store::DocumentStore,
};

/// `_id` of the status document.
pub const STATUS_ID: &str = "status";

/// Direction of a migration walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Towards higher versions.
    Up,
    /// Towards lower versions.
    Down,
}

impl MigrationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::Up => "up",
            MigrationDirection::Down => "down",
        }
    }
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single migration step.
///
/// Version `0` is the implicit baseline of an empty schema and cannot be
/// registered.
#[async_trait]
pub trait Migration: Send + Sync {
    /// The version this step migrates to.
    fn version(&self) -> u32;

    /// Optional human readable name, used in logs.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Migrates from the previous version to [`version`](Migration::version).
    async fn up(&self, op: &MigrateOp) -> DocumentStoreResult<()>;

    /// Reverts [`up`](Migration::up).
    ///
    /// Steps that cannot be reverted keep the default, which fails with
    /// [`MigrationStepMissingDirection`](DocumentStoreError::MigrationStepMissingDirection).
    async fn down(&self, _op: &MigrateOp) -> DocumentStoreResult<()> {
        Err(DocumentStoreError::MigrationStepMissingDirection {
            version: self.version(),
            direction: MigrationDirection::Down.to_string(),
        })
    }
}

pub type MigrationRef = Arc<dyn Migration>;

/// A static set of migration steps.
pub trait Migrations: Send + Sync {
    fn migrations() -> Vec<MigrationRef>;
}

type StepFn = Arc<dyn Fn(MigrateOp) -> BoxFuture<'static, DocumentStoreResult<()>> + Send + Sync>;

fn step_fn<F, Fut>(f: F) -> StepFn
where
    F: Fn(MigrateOp) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DocumentStoreResult<()>> + Send + 'static,
{
    Arc::new(move |op: MigrateOp| -> BoxFuture<'static, DocumentStoreResult<()>> { Box::pin(f(op)) })
}

/// A [`Migration`] built from closures.
#[derive(Clone)]
pub struct MigrationStep {
    version: u32,
    name: Option<String>,
    up: StepFn,
    down: Option<StepFn>,
}

impl MigrationStep {
    pub fn new<F, Fut>(version: u32, up: F) -> Self
    where
        F: Fn(MigrateOp) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DocumentStoreResult<()>> + Send + 'static,
    {
        Self { version, name: None, up: step_fn(up), down: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_down<F, Fut>(mut self, down: F) -> Self
    where
        F: Fn(MigrateOp) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DocumentStoreResult<()>> + Send + 'static,
    {
        self.down = Some(step_fn(down));
        self
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("reversible", &self.down.is_some())
            .finish()
    }
}

#[async_trait]
impl Migration for MigrationStep {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn up(&self, op: &MigrateOp) -> DocumentStoreResult<()> {
        (self.up)(op.clone()).await
    }

    async fn down(&self, op: &MigrateOp) -> DocumentStoreResult<()> {
        match &self.down {
            Some(down) => down(op.clone()).await,
            None => Err(DocumentStoreError::MigrationStepMissingDirection {
                version: self.version,
                direction: MigrationDirection::Down.to_string(),
            }),
        }
    }
}

/// Context handed to a running migration step.
///
/// Schema helpers write through the raw backend; no lifecycle events fire and
/// no behaviors apply.
#[derive(Debug, Clone)]
pub struct MigrateOp {
    store: DocumentStore,
    version: u32,
    direction: MigrationDirection,
}

impl MigrateOp {
    pub fn new(store: DocumentStore, version: u32, direction: MigrationDirection) -> Self {
        Self { store, version, direction }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Version of the running step.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn direction(&self) -> MigrationDirection {
        self.direction
    }

    /// A collection without behaviors.
    pub fn collection(&self, name: &str) -> Collection {
        self.store.collection(name)
    }

    pub fn typed_collection<M: Model>(&self) -> TypedCollection<M> {
        self.store.typed_collection::<M>()
    }

    pub async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.store.create_collection(name).await
    }

    pub async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.store.drop_collection(name).await
    }

    pub async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.store.list_collections().await
    }

    /// Sets `field` to `default` on every document that lacks it.
    pub async fn add_field(
        &self,
        collection: &str,
        field: &str,
        default: impl Into<Bson>,
    ) -> DocumentStoreResult<()> {
        let default: Bson = default.into();

        self.store
            .backend()
            .update(
                collection,
                doc! { field: { "$exists": false } },
                doc! { "$set": { field: default } },
                UpdateOptions::many(),
            )
            .await
            .map(|_| ())
    }

    /// Removes `field` from every document.
    pub async fn drop_field(&self, collection: &str, field: &str) -> DocumentStoreResult<()> {
        self.store
            .backend()
            .update(
                collection,
                doc! { field: { "$exists": true } },
                doc! { "$unset": { field: "" } },
                UpdateOptions::many(),
            )
            .await
            .map(|_| ())
    }

    /// Renames `field` to `new` on every document that has it.
    pub async fn rename_field(&self, collection: &str, field: &str, new: &str) -> DocumentStoreResult<()> {
        self.store
            .backend()
            .update(
                collection,
                doc! { field: { "$exists": true } },
                doc! { "$rename": { field: new } },
                UpdateOptions::many(),
            )
            .await
            .map(|_| ())
    }

    /// Ensures an ascending index on `field`.
    pub async fn add_index(&self, collection: &str, field: &str, unique: bool) -> DocumentStoreResult<()> {
        self.store
            .backend()
            .create_index(
                collection,
                doc! { field: 1 },
                IndexOptions { unique, name: None },
            )
            .await
    }
}

/// Diagnostic left on the status document by a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationError {
    /// The last version that was reached successfully.
    pub from_version: u32,
    pub message: String,
}

/// The persisted migration state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub version: u32,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub locked_at: Option<DateTime>,
    #[serde(default)]
    pub last_error: Option<MigrationError>,
}

impl MigrationStatus {
    /// When the lock was taken, for operators deciding whether a lock is stale.
    pub fn locked_since(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self.locked {
            true => self.locked_at.map(DateTime::to_chrono),
            false => None,
        }
    }
}

/// Configuration of a [`MigrationRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MigrationConfig {
    /// Collection holding the status document.
    pub collection: String,
    /// Log when a run finds the store already at the target version.
    pub log_if_latest: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            collection: "migrations".to_string(),
            log_if_latest: true,
        }
    }
}

/// Registers migration steps and walks the store between versions.
pub struct MigrationRunner {
    store: DocumentStore,
    config: MigrationConfig,
    steps: Vec<MigrationRef>,
}

impl MigrationRunner {
    pub fn new(store: DocumentStore, config: MigrationConfig) -> Self {
        Self { store, config, steps: Vec::new() }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Registers a step, keeping the registry sorted by version.
    ///
    /// # Errors
    ///
    /// Fails with [`DuplicateMigrationVersion`](DocumentStoreError::DuplicateMigrationVersion)
    /// when the version is taken, and with a `Migration` error for version `0`.
    /// The registry is unchanged on failure.
    pub fn add(&mut self, step: impl Migration + 'static) -> DocumentStoreResult<()> {
        self.add_ref(Arc::new(step))
    }

    pub fn add_ref(&mut self, step: MigrationRef) -> DocumentStoreResult<()> {
        let version = step.version();

        if version == 0 {
            return Err(DocumentStoreError::Migration(
                "Migration version must be greater than 0".to_string(),
            ));
        }

        match self
            .steps
            .binary_search_by_key(&version, |step| step.version())
        {
            Ok(_) => Err(DocumentStoreError::DuplicateMigrationVersion(version)),
            Err(index) => {
                self.steps.insert(index, step);
                Ok(())
            }
        }
    }

    /// Registers every step of a [`Migrations`] set.
    pub fn register<M: Migrations>(&mut self) -> DocumentStoreResult<()> {
        for step in M::migrations() {
            self.add_ref(step)?;
        }

        Ok(())
    }

    /// Registered versions in ascending order.
    pub fn versions(&self) -> Vec<u32> {
        self.steps.iter().map(|step| step.version()).collect()
    }

    /// The highest registered version.
    pub fn latest_version(&self) -> Option<u32> {
        self.steps.last().map(|step| step.version())
    }

    fn find(&self, version: u32) -> Option<&MigrationRef> {
        self.steps
            .binary_search_by_key(&version, |step| step.version())
            .ok()
            .map(|index| &self.steps[index])
    }

    /// The registered version directly below `version`, or the baseline.
    fn previous_version(&self, version: u32) -> u32 {
        self.steps
            .iter()
            .map(|step| step.version())
            .take_while(|v| *v < version)
            .last()
            .unwrap_or(0)
    }

    fn status_filter() -> Document {
        doc! { "_id": STATUS_ID }
    }

    /// Returns the status document, creating it at version `0`, unlocked, on
    /// first access.
    pub async fn get_status(&self) -> DocumentStoreResult<MigrationStatus> {
        let backend = self.store.backend();

        backend
            .update(
                &self.config.collection,
                Self::status_filter(),
                doc! { "$setOnInsert": { "version": 0_i64, "locked": false } },
                UpdateOptions::one().upsert(),
            )
            .await?;

        let status = backend
            .find(
                &self.config.collection,
                Self::status_filter(),
                FindOptions::default().limit(1),
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DocumentStoreError::Migration("Migration status document is missing".to_string()))?;

        Ok(bson::deserialize_from_document(status)?)
    }

    /// The version the store is at.
    pub async fn current_version(&self) -> DocumentStoreResult<u32> {
        Ok(self.get_status().await?.version)
    }

    /// Tries to take the migration lock. Returns whether this caller got it.
    pub async fn lock(&self) -> DocumentStoreResult<bool> {
        self.get_status().await?;

        let result = self
            .store
            .backend()
            .update(
                &self.config.collection,
                doc! { "_id": STATUS_ID, "locked": false },
                doc! { "$set": { "locked": true, "lockedAt": DateTime::now() } },
                UpdateOptions::one(),
            )
            .await?;

        Ok(result.modified_count == 1)
    }

    /// Releases the lock, records `version` and clears `lastError`.
    pub async fn unlock(&self, version: u32) -> DocumentStoreResult<()> {
        self.store
            .backend()
            .update(
                &self.config.collection,
                Self::status_filter(),
                doc! {
                    "$set": {
                        "locked": false,
                        "version": i64::from(version),
                        "lastError": Bson::Null,
                    }
                },
                UpdateOptions::one().upsert(),
            )
            .await
            .map(|_| ())
    }

    /// Leaves the lock engaged and records why the run stopped.
    async fn record_failure(&self, from_version: u32, err: &DocumentStoreError) {
        let recorded = self
            .store
            .backend()
            .update(
                &self.config.collection,
                Self::status_filter(),
                doc! {
                    "$set": {
                        "locked": true,
                        "lockedAt": DateTime::now(),
                        "lastError": {
                            "fromVersion": i64::from(from_version),
                            "message": err.to_string(),
                        },
                    }
                },
                UpdateOptions::one(),
            )
            .await;

        if let Err(record_err) = recorded {
            warn!(error = %record_err, "failed to record migration failure");
        }
    }

    async fn run_step(&self, step: &MigrationRef, direction: MigrationDirection) -> DocumentStoreResult<()> {
        info!(
            version = step.version(),
            name = step.name().unwrap_or_default(),
            direction = direction.as_str(),
            "running migration step"
        );

        let op = MigrateOp::new(self.store.clone(), step.version(), direction);
        match direction {
            MigrationDirection::Up => step.up(&op).await,
            MigrationDirection::Down => step.down(&op).await,
        }
    }

    /// Handles a failed step. Missing directions release the lock at the last
    /// reached version; every other failure leaves it engaged.
    async fn fail(&self, current: u32, err: DocumentStoreError) -> DocumentStoreResult<()> {
        match &err {
            DocumentStoreError::MigrationStepMissingDirection { .. } => {
                if let Err(unlock_err) = self.unlock(current).await {
                    warn!(version = current, error = %unlock_err, "failed to release migrations lock");
                }
            }
            _ => {
                error!(from_version = current, error = %err, "migration step failed, leaving migrations locked");
                self.record_failure(current, &err).await;
            }
        }

        Err(err)
    }

    /// Migrates the store to `target`.
    ///
    /// Returns without doing anything when another run holds the lock.
    pub async fn migrate_to(&self, target: u32) -> DocumentStoreResult<()> {
        if !self.lock().await? {
            info!("Not migrating, control is locked");
            return Ok(());
        }

        let mut current = self.get_status().await?.version;

        if current == target {
            if self.config.log_if_latest {
                info!(version = target, "Not migrating, already at version");
            }
            return self.unlock(current).await;
        }

        if target != 0 && self.find(target).is_none() {
            self.unlock(current).await?;
            return Err(DocumentStoreError::Migration(format!(
                "Can't find migration version {}",
                target
            )));
        }

        info!(from = current, to = target, "Migrating");

        if current < target {
            let pending = self
                .steps
                .iter()
                .filter(move |step| step.version() > current && step.version() <= target);

            for step in pending {
                if let Err(err) = self.run_step(step, MigrationDirection::Up).await {
                    return self.fail(current, err).await;
                }
                current = step.version();
            }
        } else {
            let pending = self
                .steps
                .iter()
                .rev()
                .filter(move |step| step.version() > target && step.version() <= current);

            for step in pending {
                if let Err(err) = self.run_step(step, MigrationDirection::Down).await {
                    return self.fail(current, err).await;
                }
                current = self.previous_version(step.version());
            }
        }

        self.unlock(current).await?;
        info!(version = current, "Finished migrating");

        Ok(())
    }

    /// Migrates to the highest registered version. A no-op without steps.
    pub async fn migrate_to_latest(&self) -> DocumentStoreResult<()> {
        match self.latest_version() {
            Some(latest) => self.migrate_to(latest).await,
            None => Ok(()),
        }
    }

    /// Runs the `up` function of one step again without moving the recorded
    /// version. The step must be idempotent.
    pub async fn rerun(&self, version: u32) -> DocumentStoreResult<()> {
        let step = self.find(version).ok_or_else(|| {
            DocumentStoreError::Migration(format!("Can't find migration version {}", version))
        })?;

        if !self.lock().await? {
            info!("Not rerunning, control is locked");
            return Ok(());
        }

        let current = self.get_status().await?.version;

        info!(version, "Rerunning version");
        if let Err(err) = self.run_step(step, MigrationDirection::Up).await {
            return self.fail(current, err).await;
        }

        self.unlock(current).await?;
        info!(version, "Finished rerunning");

        Ok(())
    }
}

impl fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("config", &self.config)
            .field("versions", &self.versions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reads_camel_case() {
        let status: MigrationStatus = bson::deserialize_from_document(doc! {
            "_id": STATUS_ID,
            "version": 3_i64,
            "locked": true,
            "lastError": { "fromVersion": 2_i64, "message": "boom" },
        })
        .unwrap();

        assert_eq!(status.version, 3);
        assert!(status.locked);
        assert_eq!(status.locked_at, None);
        assert_eq!(
            status.last_error,
            Some(MigrationError { from_version: 2, message: "boom".to_string() })
        );
    }

    #[test]
    fn test_status_treats_null_error_as_absent() {
        let status: MigrationStatus = bson::deserialize_from_document(doc! {
            "version": 0,
            "locked": false,
            "lastError": Bson::Null,
        })
        .unwrap();

        assert_eq!(status.last_error, None);
    }

    #[test]
    fn test_locked_since_requires_lock() {
        let at = DateTime::from_millis(1_700_000_000_000);
        let mut status = MigrationStatus {
            version: 1,
            locked: true,
            locked_at: Some(at),
            last_error: None,
        };

        assert_eq!(status.locked_since().map(|t| t.timestamp_millis()), Some(1_700_000_000_000));

        status.locked = false;
        assert_eq!(status.locked_since(), None);
    }

    #[test]
    fn test_config_defaults() {
        let config: MigrationConfig =
            bson::deserialize_from_document(doc! { "logIfLatest": false }).unwrap();

        assert_eq!(config.collection, "migrations");
        assert!(!config.log_if_latest);
    }

    #[test]
    fn test_step_metadata() {
        let step = MigrationStep::new(4, |_op| async { Ok(()) }).with_name("seed");

        assert_eq!(step.version(), 4);
        assert_eq!(Migration::name(&step), Some("seed"));
        assert!(step.down.is_none());
    }
}
