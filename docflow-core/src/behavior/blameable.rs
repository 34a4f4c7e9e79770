use async_trait::async_trait;
use serde::Deserialize;

use super::{Behavior, Next, merge_operator};
use crate::{
    context::ExecutionContext,
    error::{DocumentStoreError, DocumentStoreResult},
    operation::{Operation, OperationOutcome},
};

/// Field names written by [`Blameable`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlameFields {
    pub created_by: String,
    pub updated_by: String,
}

impl Default for BlameFields {
    fn default() -> Self {
        Self {
            created_by: "createdBy".to_string(),
            updated_by: "updatedBy".to_string(),
        }
    }
}

/// Configuration of [`Blameable`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlameableOptions {
    pub fields: BlameFields,
    /// Refuse writes whose context carries no user id at all.
    ///
    /// An explicit null id still passes; it marks a system-initiated write.
    pub throw_error_when_missing: bool,
}

/// Records which user created and last modified a document.
#[derive(Debug, Clone, Default)]
pub struct Blameable {
    options: BlameableOptions,
}

impl Blameable {
    pub fn new(options: BlameableOptions) -> Self {
        Self { options }
    }

    /// A blameable behavior that refuses unattributed writes.
    pub fn strict() -> Self {
        Self::new(BlameableOptions {
            throw_error_when_missing: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Behavior for Blameable {
    fn name(&self) -> &'static str {
        "blameable"
    }

    async fn process(
        &self,
        mut op: Operation,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> DocumentStoreResult<OperationOutcome> {
        let writes = matches!(
            op,
            Operation::InsertOne { .. }
                | Operation::InsertMany { .. }
                | Operation::Update { .. }
                | Operation::FindOneAndUpdate { .. }
        );

        if !writes {
            return next.run(op, ctx).await;
        }

        if self.options.throw_error_when_missing && !ctx.has_user_id() {
            return Err(DocumentStoreError::InvalidDocument(format!(
                "{} requires a user id in the execution context",
                op.name()
            )));
        }

        let user_id = ctx.user_id();
        let fields = &self.options.fields;

        for document in op.documents_mut() {
            document.insert(&fields.created_by, user_id.clone());
            document.insert(&fields.updated_by, user_id.clone());
        }

        if let Some(update) = op.update_mut() {
            merge_operator(update, "$set", &fields.updated_by, user_id);
        }

        next.run(op, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: BlameableOptions = bson::deserialize_from_document(doc! {
            "throwErrorWhenMissing": true,
            "fields": { "updatedBy": "editor" },
        })
        .unwrap();

        assert!(options.throw_error_when_missing);
        assert_eq!(options.fields.created_by, "createdBy");
        assert_eq!(options.fields.updated_by, "editor");
    }
}
