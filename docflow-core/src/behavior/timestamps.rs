use async_trait::async_trait;
use bson::DateTime;
use serde::Deserialize;

use super::{Behavior, Next, merge_operator};
use crate::{
    context::ExecutionContext,
    error::DocumentStoreResult,
    operation::{Operation, OperationOutcome},
};

/// Field names written by [`Timestamps`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimestampFields {
    pub created_at: String,
    pub updated_at: String,
}

impl Default for TimestampFields {
    fn default() -> Self {
        Self {
            created_at: "createdAt".to_string(),
            updated_at: "updatedAt".to_string(),
        }
    }
}

/// Maintains creation and modification times.
///
/// Inserted documents get both fields set to the current time. Updates set the
/// modification time; upserts additionally set the creation time on the
/// document they create.
#[derive(Debug, Clone, Default)]
pub struct Timestamps {
    fields: TimestampFields,
}

impl Timestamps {
    pub fn new(fields: TimestampFields) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Behavior for Timestamps {
    fn name(&self) -> &'static str {
        "timestamps"
    }

    async fn process(
        &self,
        mut op: Operation,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> DocumentStoreResult<OperationOutcome> {
        let now = DateTime::now();

        for document in op.documents_mut() {
            document.insert(&self.fields.created_at, now);
            document.insert(&self.fields.updated_at, now);
        }

        let upsert = match &op {
            Operation::Update { upsert, .. } => *upsert,
            Operation::FindOneAndUpdate { options, .. } => options.upsert,
            _ => false,
        };

        if let Some(update) = op.update_mut() {
            merge_operator(update, "$set", &self.fields.updated_at, now);
            if upsert {
                merge_operator(update, "$setOnInsert", &self.fields.created_at, now);
            }
        }

        next.run(op, ctx).await
    }
}
