use async_trait::async_trait;
use bson::Document;
use std::{fmt, marker::PhantomData, sync::Arc};

use super::{Behavior, Next};
use crate::{
    context::ExecutionContext,
    error::{DocumentStoreError, DocumentStoreResult},
    model::{Model, ModelExt},
    operation::{Operation, OperationOutcome},
};

/// Checks documents before they are written.
pub trait DocumentValidator: Send + Sync {
    /// Validates a document about to be inserted.
    ///
    /// Returns the document in its cast form: with defaults applied and
    /// unknown fields dropped, as far as the validator models them.
    fn validate(&self, document: &Document) -> DocumentStoreResult<Document>;

    /// Validates an update expression. Accepts everything by default.
    fn validate_update(&self, _update: &Document) -> DocumentStoreResult<()> {
        Ok(())
    }
}

impl<F> DocumentValidator for F
where
    F: Fn(&Document) -> DocumentStoreResult<()> + Send + Sync,
{
    fn validate(&self, document: &Document) -> DocumentStoreResult<Document> {
        (self)(document)?;
        Ok(document.clone())
    }
}

/// Validates documents by deserializing them into a [`Model`].
pub struct ModelValidator<M: Model> {
    _marker: PhantomData<fn() -> M>,
}

impl<M: Model> ModelValidator<M> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<M: Model> Default for ModelValidator<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> DocumentValidator for ModelValidator<M> {
    fn validate(&self, document: &Document) -> DocumentStoreResult<Document> {
        let model = M::from_document(document.clone()).map_err(|err| {
            DocumentStoreError::InvalidDocument(format!("{}: {}", M::collection_name(), err))
        })?;

        let mut cast = model.to_document()?;
        // Models without an `_id` field would otherwise lose the caller's id.
        if let Some(id) = document.get("_id") {
            if !cast.contains_key("_id") {
                cast.insert("_id", id.clone());
            }
        }

        Ok(cast)
    }
}

/// Validates inserted documents and update expressions before they reach the store.
///
/// With `cast` enabled, inserted documents are replaced by the validator's
/// cast form. Validation errors are returned unchanged.
#[derive(Clone)]
pub struct Validate {
    validator: Arc<dyn DocumentValidator>,
    cast: bool,
}

impl Validate {
    pub fn new(validator: impl DocumentValidator + 'static) -> Self {
        Self { validator: Arc::new(validator), cast: false }
    }

    /// Validates against a serde model.
    pub fn model<M: Model>() -> Self {
        Self::new(ModelValidator::<M>::new())
    }

    /// Stores the cast form of inserted documents.
    pub fn cast(mut self, cast: bool) -> Self {
        self.cast = cast;
        self
    }
}

impl fmt::Debug for Validate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validate")
            .field("cast", &self.cast)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Behavior for Validate {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn process(
        &self,
        mut op: Operation,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> DocumentStoreResult<OperationOutcome> {
        for document in op.documents_mut() {
            let cast = self.validator.validate(document)?;
            if self.cast {
                *document = cast;
            }
        }

        if let Some(update) = op.update_mut() {
            self.validator.validate_update(update)?;
        }

        next.run(op, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Post {
        title: String,
        #[serde(default)]
        views: i32,
    }

    impl Model for Post {
        fn collection_name() -> &'static str {
            "posts"
        }
    }

    #[test]
    fn test_model_validator_casts() {
        let cast = ModelValidator::<Post>::new()
            .validate(&doc! { "_id": 1, "title": "a", "junk": true })
            .unwrap();

        assert_eq!(cast, doc! { "title": "a", "views": 0, "_id": 1 });
    }

    #[test]
    fn test_model_validator_rejects() {
        let err = ModelValidator::<Post>::new()
            .validate(&doc! { "views": 3 })
            .unwrap_err();

        assert!(matches!(err, DocumentStoreError::InvalidDocument(_)));
    }

    #[test]
    fn test_closure_validator_passes_errors_through() {
        let validator = |document: &Document| {
            if document.contains_key("title") {
                Ok(())
            } else {
                Err(DocumentStoreError::InvalidDocument("title is required".to_string()))
            }
        };

        assert!(validator.validate(&doc! { "title": "x" }).is_ok());
        assert_eq!(
            validator.validate(&doc! {}).unwrap_err(),
            DocumentStoreError::InvalidDocument("title is required".to_string())
        );
    }
}
