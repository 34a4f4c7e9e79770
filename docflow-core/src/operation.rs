//! Collection operations as values.
//!
//! Every collection call is turned into an [`Operation`] and pushed through the
//! behavior chain. Behaviors inspect and rewrite operations (inject filter
//! clauses, add fields) before handing them on, and the innermost stage,
//! [`CollectionCore`](crate::collection::CollectionCore), executes them.

use bson::Document;

use crate::{
    backend::{
        DeleteResult, FindOneAndUpdateOptions, FindOptions, InsertManyResult, InsertOneResult,
        UpdateResult,
    },
    error::{DocumentStoreError, DocumentStoreResult},
};

/// A single collection operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    InsertOne {
        document: Document,
    },
    InsertMany {
        documents: Vec<Document>,
    },
    Update {
        filter: Document,
        update: Document,
        many: bool,
        upsert: bool,
    },
    Delete {
        filter: Document,
        many: bool,
    },
    Find {
        filter: Document,
        options: FindOptions,
    },
    FindOneAndUpdate {
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    },
    FindOneAndDelete {
        filter: Document,
    },
    Count {
        filter: Document,
    },
    Aggregate {
        pipeline: Vec<Document>,
    },
}

impl Operation {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::InsertOne { .. } => "insert_one",
            Operation::InsertMany { .. } => "insert_many",
            Operation::Update { many: false, .. } => "update_one",
            Operation::Update { many: true, .. } => "update_many",
            Operation::Delete { many: false, .. } => "delete_one",
            Operation::Delete { many: true, .. } => "delete_many",
            Operation::Find { .. } => "find",
            Operation::FindOneAndUpdate { .. } => "find_one_and_update",
            Operation::FindOneAndDelete { .. } => "find_one_and_delete",
            Operation::Count { .. } => "count",
            Operation::Aggregate { .. } => "aggregate",
        }
    }

    /// The filter of operations that select documents by filter.
    pub fn filter_mut(&mut self) -> Option<&mut Document> {
        match self {
            Operation::Update { filter, .. }
            | Operation::Delete { filter, .. }
            | Operation::Find { filter, .. }
            | Operation::FindOneAndUpdate { filter, .. }
            | Operation::FindOneAndDelete { filter }
            | Operation::Count { filter } => Some(filter),
            Operation::InsertOne { .. }
            | Operation::InsertMany { .. }
            | Operation::Aggregate { .. } => None,
        }
    }

    /// The update expression of operations that modify documents in place.
    pub fn update_mut(&mut self) -> Option<&mut Document> {
        match self {
            Operation::Update { update, .. } | Operation::FindOneAndUpdate { update, .. } => {
                Some(update)
            }
            _ => None,
        }
    }

    /// The documents of insert operations.
    pub fn documents_mut(&mut self) -> Vec<&mut Document> {
        match self {
            Operation::InsertOne { document } => vec![document],
            Operation::InsertMany { documents } => documents.iter_mut().collect(),
            _ => Vec::new(),
        }
    }
}

/// The result of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    InsertedOne(InsertOneResult),
    InsertedMany(InsertManyResult),
    Updated(UpdateResult),
    Deleted(DeleteResult),
    Documents(Vec<Document>),
    Document(Option<Document>),
    Count(u64),
}

impl OperationOutcome {
    fn kind(&self) -> &'static str {
        match self {
            OperationOutcome::InsertedOne(_) => "inserted_one",
            OperationOutcome::InsertedMany(_) => "inserted_many",
            OperationOutcome::Updated(_) => "updated",
            OperationOutcome::Deleted(_) => "deleted",
            OperationOutcome::Documents(_) => "documents",
            OperationOutcome::Document(_) => "document",
            OperationOutcome::Count(_) => "count",
        }
    }

    fn mismatch(self, expected: &str) -> DocumentStoreError {
        DocumentStoreError::Unknown(format!(
            "expected {} outcome, behavior chain produced {}",
            expected,
            self.kind()
        ))
    }

    pub fn into_inserted_one(self) -> DocumentStoreResult<InsertOneResult> {
        match self {
            OperationOutcome::InsertedOne(result) => Ok(result),
            other => Err(other.mismatch("inserted_one")),
        }
    }

    pub fn into_inserted_many(self) -> DocumentStoreResult<InsertManyResult> {
        match self {
            OperationOutcome::InsertedMany(result) => Ok(result),
            other => Err(other.mismatch("inserted_many")),
        }
    }

    pub fn into_updated(self) -> DocumentStoreResult<UpdateResult> {
        match self {
            OperationOutcome::Updated(result) => Ok(result),
            other => Err(other.mismatch("updated")),
        }
    }

    pub fn into_deleted(self) -> DocumentStoreResult<DeleteResult> {
        match self {
            OperationOutcome::Deleted(result) => Ok(result),
            other => Err(other.mismatch("deleted")),
        }
    }

    pub fn into_documents(self) -> DocumentStoreResult<Vec<Document>> {
        match self {
            OperationOutcome::Documents(documents) => Ok(documents),
            other => Err(other.mismatch("documents")),
        }
    }

    pub fn into_document(self) -> DocumentStoreResult<Option<Document>> {
        match self {
            OperationOutcome::Document(document) => Ok(document),
            other => Err(other.mismatch("document")),
        }
    }

    pub fn into_count(self) -> DocumentStoreResult<u64> {
        match self {
            OperationOutcome::Count(count) => Ok(count),
            other => Err(other.mismatch("count")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_filter_access() {
        let mut op = Operation::Count { filter: doc! { "a": 1 } };
        op.filter_mut().unwrap().insert("b", 2);

        assert_eq!(op, Operation::Count { filter: doc! { "a": 1, "b": 2 } });
        assert!(Operation::Aggregate { pipeline: vec![] }.filter_mut().is_none());
    }

    #[test]
    fn test_names_follow_multiplicity() {
        let one = Operation::Delete { filter: doc! {}, many: false };
        let many = Operation::Delete { filter: doc! {}, many: true };

        assert_eq!(one.name(), "delete_one");
        assert_eq!(many.name(), "delete_many");
    }

    #[test]
    fn test_outcome_mismatch_is_an_error() {
        assert!(OperationOutcome::Count(3).into_documents().is_err());
        assert_eq!(OperationOutcome::Count(3).into_count().unwrap(), 3);
    }
}
