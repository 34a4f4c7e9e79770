//! MongoDB backend implementation for docflow.
//!
//! Filters, update expressions and aggregation pipelines are handed to the server
//! unchanged, so every operator MongoDB supports is available.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docflow = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Atomic conditional updates** - The migration lock relies on single-document update atomicity
//! - **Transactions** - Client sessions with multi-document transactions (requires a replica set)
//! - **Indexing** - Unique and named indexes
//!
//! # Example
//!
//! ```ignore
//! use docflow::{backend::StoreBackendBuilder, mongodb::MongoDbStore, prelude::*};
//!
//! let backend = MongoDbStore::builder("mongodb://localhost:27017", "app").build().await?;
//! let store = DocumentStore::new(backend);
//! MigrationRunner::new(store.clone(), MigrationConfig::default()).migrate_to_latest().await?;
//! ```

pub mod store;

pub use store::{MongoDbSession, MongoDbStore, MongoDbStoreBuilder};
