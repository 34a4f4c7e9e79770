//! Convenient re-exports of commonly used types from docflow.
//!
//! ```ignore
//! use docflow::prelude::*;
//! ```

pub use docflow_core::{
    backend::{StoreBackend, DynStoreBackend, StoreBackendBuilder, StoreSession, FindOptions, FindOneAndUpdateOptions, UpdateOptions},
    behavior::{Behavior, BehaviorRef, Blameable, BlameableOptions, SoftDelete, Timestamps, Validate, DocumentValidator},
    collection::{Collection, CollectionBuilder, TypedCollection},
    context::ExecutionContext,
    event::{EventKind, EventListener, LifecycleEvent},
    fields::FieldDiffSummary,
    model::{Model, ModelExt},
    operation::{Operation, OperationOutcome},
    store::DocumentStore,
    query::{Query, QueryBuilder, Expr, Filter, Sort, SortDirection, FieldOp},
    migrate::{Migration, MigrationConfig, MigrationDirection, MigrationRef, MigrationStatus, MigrationStep, MigrateOp, MigrationRunner, Migrations},
    error::{DocumentStoreError, DocumentStoreResult},
};
