//! In-memory document storage backend for docflow.
//!
//! Collections are ordered vectors of documents held behind a single `mea`
//! read-write lock. Writes take the lock for their whole duration, so a
//! conditional update is atomic with respect to every other operation.
//!
//! # Features
//!
//! - **Mongo-style filters** - Comparison, logical, array and regex operators
//! - **Update operators** - `$set`, `$unset`, `$inc`, `$push`, `$addToSet`, `$pull`, `$rename`, `$setOnInsert`
//! - **Aggregation** - `$match`, `$sort`, `$skip`, `$limit`, `$project` and `$count` stages
//! - **Snapshot transactions** - Writes become visible on commit
//!
//! ```ignore
//! use docflow::{context::ExecutionContext, memory::InMemoryStore, store::DocumentStore};
//!
//! let store = DocumentStore::new(InMemoryStore::new());
//! store
//!     .collection("users")
//!     .insert_one(bson::doc! { "name": "Alice" }, &ExecutionContext::default())
//!     .await?;
//! ```

mod evaluator;
mod pipeline;
mod store;
mod update;

pub use store::{InMemorySession, InMemoryStore, InMemoryStoreBuilder};
