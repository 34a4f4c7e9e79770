//! Composable behaviors that intercept collection operations.
//!
//! A [`Behavior`] wraps every operation issued through a
//! [`Collection`](crate::collection::Collection). Behaviors are installed once
//! when the collection is built and form an explicit chain: the last installed
//! behavior sees an operation first, may rewrite it or answer it directly, and
//! otherwise hands it to [`Next`], which continues with the previously installed
//! behavior and finally reaches the [`CollectionCore`].
//!
//! ```text
//! caller -> behavior[n-1] -> ... -> behavior[0] -> CollectionCore -> backend
//! ```
//!
//! # Shipped behaviors
//!
//! - [`SoftDelete`] - flags documents instead of removing them and hides flagged documents
//! - [`Timestamps`] - maintains `createdAt` / `updatedAt`
//! - [`Blameable`] - maintains `createdBy` / `updatedBy` from the execution context
//! - [`Validate`] - validates (and optionally casts) inserted documents and updates

use async_trait::async_trait;
use bson::{Bson, Document};
use std::sync::Arc;

use crate::{
    collection::CollectionCore,
    context::ExecutionContext,
    error::DocumentStoreResult,
    operation::{Operation, OperationOutcome},
};

mod blameable;
mod soft_delete;
mod timestamps;
mod validate;

pub use blameable::{BlameFields, Blameable, BlameableOptions};
pub use soft_delete::{SoftDelete, SoftDeleteFields, exclude_deleted, exclude_deleted_in_pipeline};
pub use timestamps::{TimestampFields, Timestamps};
pub use validate::{DocumentValidator, ModelValidator, Validate};

/// Shared handle to an installed behavior.
pub type BehaviorRef = Arc<dyn Behavior>;

/// A cross-cutting policy applied to every operation of a collection.
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// One-time setup, run when the collection is built.
    ///
    /// Must be idempotent: several processes build the same collection.
    async fn on_init(&self, _core: &CollectionCore) -> DocumentStoreResult<()> {
        Ok(())
    }

    /// Handles an operation, usually by delegating to `next`.
    async fn process(
        &self,
        op: Operation,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> DocumentStoreResult<OperationOutcome>;
}

/// The remainder of the behavior chain.
pub struct Next<'a> {
    behaviors: &'a [BehaviorRef],
    core: &'a CollectionCore,
}

impl<'a> Next<'a> {
    pub(crate) fn new(behaviors: &'a [BehaviorRef], core: &'a CollectionCore) -> Self {
        Self { behaviors, core }
    }

    /// The operation core at the bottom of the chain.
    ///
    /// Behaviors that replace an operation outright (such as soft deletion)
    /// use it to emit events and reach the raw store directly.
    pub fn core(&self) -> &'a CollectionCore {
        self.core
    }

    /// Runs the next behavior, or the core when the chain is exhausted.
    pub async fn run(self, op: Operation, ctx: &ExecutionContext) -> DocumentStoreResult<OperationOutcome> {
        match self.behaviors.split_last() {
            Some((outer, rest)) => {
                outer
                    .process(op, ctx, Next::new(rest, self.core))
                    .await
            }
            None => self.core.execute(op, ctx).await,
        }
    }
}

/// Adds `field: value` under an update operator, merging with any fields the
/// caller already put there.
pub(crate) fn merge_operator(update: &mut Document, operator: &str, field: &str, value: impl Into<Bson>) {
    match update.get_mut(operator) {
        Some(Bson::Document(fields)) => {
            fields.insert(field, value);
        }
        _ => {
            let mut fields = Document::new();
            fields.insert(field, value);
            update.insert(operator, fields);
        }
    }
}
