//! An operation layer over document stores.
//!
//! Collections obtained from a [`store::DocumentStore`] wrap every write in
//! lifecycle events and run reads and writes through the behaviors installed
//! on them. The backend crates are re-exported under [`memory`] and `mongodb`.
//!
//! # Features
//!
//! - **Lifecycle events** - Before/After listeners around every insert, update and removal
//! - **Behaviors** - Soft deletion, timestamps, blame and validation installed per collection
//! - **Multiple backends** - In-memory and MongoDB storage behind one trait
//! - **Schema migrations** - Versioned steps with a store-backed lock so only one process migrates
//! - **Transactions** - Run a closure against a transaction-bound store
//!
//! # Quick Start
//!
//! ```ignore
//! use docflow::{prelude::*, memory::InMemoryStore};
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let store = DocumentStore::new(InMemoryStore::new());
//!
//!     let posts = store
//!         .collection_builder("posts")
//!         .behavior(Timestamps::default())
//!         .behavior(SoftDelete::default())
//!         .build()
//!         .await?;
//!
//!     posts
//!         .on(EventKind::AfterInsert, |event: LifecycleEvent| async move {
//!             println!("inserted into {}", event.collection());
//!             Ok(())
//!         })
//!         .await;
//!
//!     let ctx = ExecutionContext::for_user("u-1");
//!     posts.insert_one(doc! { "title": "Hello" }, &ctx).await?;
//!     posts.delete_one(doc! { "title": "Hello" }, &ctx).await?;
//!
//!     // Soft-deleted documents are hidden from reads.
//!     assert_eq!(posts.count(doc! {}, &ctx).await?, 0);
//!
//!     store.shutdown().await
//! }
//! ```
//!
//! # Migrations
//!
//! ```ignore
//! use docflow::{prelude::*, memory::InMemoryStore};
//!
//! let store = DocumentStore::new(InMemoryStore::new());
//! let mut runner = MigrationRunner::new(store.clone(), MigrationConfig::default());
//!
//! runner.add(
//!     MigrationStep::new(1, |op: MigrateOp| async move { op.add_field("users", "age", 0).await })
//!         .with_down(|op: MigrateOp| async move { op.drop_field("users", "age").await }),
//! )?;
//!
//! runner.migrate_to_latest().await?;
//! runner.migrate_to(0).await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - process-local, with snapshot transactions
//! - `mongodb` - MongoDB through the official driver (`mongodb` feature)

pub mod prelude;

pub use docflow_core::{
    backend, behavior, collection, context, error, event, fields, migrate, model, operation, query, store,
};

// Re-export BSON types for convenience
pub use bson;
pub use async_trait::async_trait;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docflow_memory::{InMemorySession, InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docflow_mongodb::{MongoDbSession, MongoDbStore, MongoDbStoreBuilder};
}
