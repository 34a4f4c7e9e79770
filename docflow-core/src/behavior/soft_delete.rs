use async_trait::async_trait;
use bson::{Bson, Document, doc};
use serde::Deserialize;

use super::{Behavior, Next};
use crate::{
    backend::{DeleteResult, IndexOptions, UpdateOptions},
    collection::CollectionCore,
    context::ExecutionContext,
    error::DocumentStoreResult,
    event::{AfterRemove, BeforeRemove, LifecycleEvent},
    operation::{Operation, OperationOutcome},
};

/// Field names written by [`SoftDelete`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SoftDeleteFields {
    pub is_deleted: String,
    pub deleted_at: String,
    pub deleted_by: String,
}

impl Default for SoftDeleteFields {
    fn default() -> Self {
        Self {
            is_deleted: "isDeleted".to_string(),
            deleted_at: "deletedAt".to_string(),
            deleted_by: "deletedBy".to_string(),
        }
    }
}

/// Flags documents as deleted instead of removing them.
///
/// Deletes become a `$set` of the flag, the deletion time and the acting user,
/// still bracketed by `BeforeRemove` / `AfterRemove`. Reads, counts, updates
/// and aggregations skip flagged documents unless the caller filters on the
/// flag explicitly.
#[derive(Debug, Clone, Default)]
pub struct SoftDelete {
    fields: SoftDeleteFields,
}

impl SoftDelete {
    pub fn new(fields: SoftDeleteFields) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &SoftDeleteFields {
        &self.fields
    }

    async fn flag(
        &self,
        core: &CollectionCore,
        filter: Document,
        many: bool,
        ctx: &ExecutionContext,
    ) -> DocumentStoreResult<OperationOutcome> {
        core.emit(&LifecycleEvent::BeforeRemove(BeforeRemove {
            collection: core.name().to_string(),
            filter: filter.clone(),
            is_many: many,
            context: ctx.clone(),
        }))
        .await?;

        let update = doc! {
            "$set": {
                &self.fields.is_deleted: true,
                &self.fields.deleted_at: bson::DateTime::now(),
                &self.fields.deleted_by: ctx.user_id(),
            }
        };
        let options = if many { UpdateOptions::many() } else { UpdateOptions::one() };

        let result: DeleteResult = core
            .backend()
            .update(
                core.name(),
                exclude_deleted(&filter, &self.fields.is_deleted),
                update,
                options,
            )
            .await?
            .into();

        core.emit(&LifecycleEvent::AfterRemove(AfterRemove {
            collection: core.name().to_string(),
            filter,
            is_many: many,
            context: ctx.clone(),
            result: result.clone(),
        }))
        .await?;

        Ok(OperationOutcome::Deleted(result))
    }
}

#[async_trait]
impl Behavior for SoftDelete {
    fn name(&self) -> &'static str {
        "soft_delete"
    }

    async fn on_init(&self, core: &CollectionCore) -> DocumentStoreResult<()> {
        core.backend()
            .create_index(
                core.name(),
                doc! { &self.fields.is_deleted: 1 },
                IndexOptions::default(),
            )
            .await
    }

    async fn process(
        &self,
        mut op: Operation,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> DocumentStoreResult<OperationOutcome> {
        match op {
            Operation::Delete { filter, many } => self.flag(next.core(), filter, many, ctx).await,
            Operation::Aggregate { pipeline } => {
                let pipeline = exclude_deleted_in_pipeline(pipeline, &self.fields.is_deleted);
                next.run(Operation::Aggregate { pipeline }, ctx).await
            }
            _ => {
                if let Some(filter) = op.filter_mut() {
                    *filter = exclude_deleted(filter, &self.fields.is_deleted);
                }
                next.run(op, ctx).await
            }
        }
    }
}

/// Adds `{ field: { $ne: true } }` to a filter that does not mention `field`.
///
/// Only top-level keys are inspected; a filter that names the flag anywhere at
/// the top level is returned unchanged.
pub fn exclude_deleted(filter: &Document, field: &str) -> Document {
    let mut filter = filter.clone();

    if !filter.contains_key(field) {
        filter.insert(field, doc! { "$ne": true });
    }

    filter
}

/// Prepends a `$match` excluding flagged documents, unless some `$match`
/// stage already filters on `field`.
pub fn exclude_deleted_in_pipeline(mut pipeline: Vec<Document>, field: &str) -> Vec<Document> {
    let filtered = pipeline.iter().any(|stage| match stage.get("$match") {
        Some(Bson::Document(matcher)) => matcher.contains_key(field),
        _ => false,
    });

    if !filtered {
        pipeline.insert(0, doc! { "$match": { field: { "$ne": true } } });
    }

    pipeline
}
