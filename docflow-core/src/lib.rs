//! An event-driven operation layer over document stores.
//!
//! This crate is the core of the docflow project and provides:
//!
//! - **Store backend abstraction** ([`backend`]) - The raw store contract backends implement
//! - **Lifecycle events** ([`event`]) - Before/After events bracketing every write
//! - **Collections interface** ([`collection`]) - The operation core and the collection façade
//! - **Behaviors** ([`behavior`]) - Soft deletion, timestamps, blame and validation as composable interceptors
//! - **Document store** ([`store`]) - Main entry point, including transactions
//! - **Schema migrations** ([`migrate`]) - Versioned migration steps guarded by a store-backed lock
//! - **Query and filtering API** ([`query`]) - Declarative queries compiled to store filters
//! - **Models** ([`model`]) - Typed documents and their serialization
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docflow::{behavior::{SoftDelete, Timestamps}, context::ExecutionContext, store::DocumentStore};
//! use bson::doc;
//!
//! let store = DocumentStore::new(backend);
//! let posts = store
//!     .collection_builder("posts")
//!     .behavior(Timestamps::default())
//!     .behavior(SoftDelete::default())
//!     .build()
//!     .await?;
//!
//! posts.insert_one(doc! { "title": "Hello" }, &ExecutionContext::for_user("u1")).await?;
//! ```

pub mod backend;
pub mod behavior;
pub mod collection;
pub mod context;
pub mod error;
pub mod event;
pub mod fields;
pub mod migrate;
pub mod model;
pub mod operation;
pub mod query;
pub mod store;
