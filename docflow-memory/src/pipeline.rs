//! Sorting, projection and aggregation stages for in-memory documents.

use bson::{Bson, Document, doc};
use std::cmp::Ordering;

use docflow_core::error::{DocumentStoreError, DocumentStoreResult};

use crate::{
    evaluator::{Comparable, DocumentEvaluator, get_path},
    update::set_path,
};

fn invalid(message: impl Into<String>) -> DocumentStoreError {
    DocumentStoreError::InvalidDocument(message.into())
}

fn as_count(value: &Bson, stage: &str) -> DocumentStoreResult<usize> {
    match value {
        Bson::Int32(n) if *n >= 0 => Ok(*n as usize),
        Bson::Int64(n) if *n >= 0 => Ok(*n as usize),
        Bson::Double(n) if *n >= 0.0 => Ok(*n as usize),
        _ => Err(invalid(format!("{} expects a non-negative number", stage))),
    }
}

/// Sorts documents by a `{ field: 1 | -1, ... }` specification. Stable.
pub(crate) fn sort_documents(documents: &mut [Document], spec: &Document) -> DocumentStoreResult<()> {
    let mut keys = Vec::with_capacity(spec.len());
    for (field, direction) in spec {
        let descending = match direction {
            Bson::Int32(-1) | Bson::Int64(-1) => true,
            Bson::Double(d) if *d == -1.0 => true,
            Bson::Int32(1) | Bson::Int64(1) => false,
            Bson::Double(d) if *d == 1.0 => false,
            _ => return Err(invalid(format!("invalid sort direction for {}", field))),
        };
        keys.push((field.as_str(), descending));
    }

    let null = Bson::Null;
    documents.sort_by(|a, b| {
        for (field, descending) in &keys {
            let left = Comparable::from(get_path(a, field).unwrap_or(&null));
            let right = Comparable::from(get_path(b, field).unwrap_or(&null));

            let ordering = match descending {
                false => left.total_cmp(&right),
                true => right.total_cmp(&left),
            };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    });

    Ok(())
}

/// Applies an inclusion or exclusion projection.
///
/// `_id` is kept unless excluded explicitly. Mixing inclusion and exclusion
/// of other fields is an error.
pub(crate) fn project(document: &Document, spec: &Document) -> DocumentStoreResult<Document> {
    let mut include_id = true;
    let mut included = Vec::new();
    let mut excluded = Vec::new();

    for (field, flag) in spec {
        let on = match flag {
            Bson::Boolean(b) => *b,
            Bson::Int32(n) => *n != 0,
            Bson::Int64(n) => *n != 0,
            Bson::Double(n) => *n != 0.0,
            _ => return Err(invalid(format!("unsupported projection for {}", field))),
        };

        if field == "_id" {
            include_id = on;
        } else if on {
            included.push(field.as_str());
        } else {
            excluded.push(field.as_str());
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(invalid("cannot mix inclusion and exclusion in a projection"));
    }

    if included.is_empty() {
        let mut projected = document.clone();
        for field in excluded {
            crate::update::unset_path(&mut projected, field);
        }
        if !include_id {
            projected.remove("_id");
        }
        return Ok(projected);
    }

    let mut projected = Document::new();
    if include_id {
        if let Some(id) = document.get("_id") {
            projected.insert("_id", id.clone());
        }
    }
    for field in included {
        if let Some(value) = get_path(document, field) {
            set_path(&mut projected, field, value.clone())?;
        }
    }

    Ok(projected)
}

/// Runs an aggregation pipeline over `documents`.
///
/// Supported stages: `$match`, `$sort`, `$skip`, `$limit`, `$project`, `$count`.
pub(crate) fn aggregate(mut documents: Vec<Document>, pipeline: &[Document]) -> DocumentStoreResult<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(invalid("each pipeline stage must have exactly one operator"));
        };

        documents = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                DocumentEvaluator::filter_documents(documents.iter(), filter)?
            }
            ("$sort", Bson::Document(spec)) => {
                sort_documents(&mut documents, spec)?;
                documents
            }
            ("$skip", value) => {
                let skip = as_count(value, "$skip")?;
                documents.into_iter().skip(skip).collect()
            }
            ("$limit", value) => {
                let limit = as_count(value, "$limit")?;
                documents.into_iter().take(limit).collect()
            }
            ("$project", Bson::Document(spec)) => documents
                .iter()
                .map(|document| project(document, spec))
                .collect::<DocumentStoreResult<_>>()?,
            ("$count", Bson::String(field)) => {
                vec![doc! { field: (documents.len() as i64) }]
            }
            (other, _) => return Err(invalid(format!("unsupported pipeline stage {}", other))),
        };
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_mixed_and_missing_values() {
        let mut documents = vec![doc! { "n": 2 }, doc! {}, doc! { "n": 1.5 }, doc! { "n": "x" }];
        sort_documents(&mut documents, &doc! { "n": 1 }).unwrap();

        assert_eq!(documents, vec![doc! {}, doc! { "n": 1.5 }, doc! { "n": 2 }, doc! { "n": "x" }]);
    }

    #[test]
    fn test_sort_by_several_keys() {
        let mut documents = vec![
            doc! { "a": 1, "b": 1 },
            doc! { "a": 2, "b": 0 },
            doc! { "a": 1, "b": 2 },
        ];
        sort_documents(&mut documents, &doc! { "a": -1, "b": -1 }).unwrap();

        assert_eq!(
            documents,
            vec![doc! { "a": 2, "b": 0 }, doc! { "a": 1, "b": 2 }, doc! { "a": 1, "b": 1 }]
        );
    }

    #[test]
    fn test_projection() {
        let document = doc! { "_id": 1, "a": { "b": 1, "c": 2 }, "d": 3 };

        assert_eq!(project(&document, &doc! { "a.b": 1 }).unwrap(), doc! { "_id": 1, "a": { "b": 1 } });
        assert_eq!(project(&document, &doc! { "d": 0, "_id": 0 }).unwrap(), doc! { "a": { "b": 1, "c": 2 } });
        assert!(project(&document, &doc! { "a": 1, "d": 0 }).is_err());
    }

    #[test]
    fn test_pipeline_stages() {
        let documents = (1..=5).map(|n| doc! { "n": n }).collect::<Vec<_>>();

        let result = aggregate(
            documents.clone(),
            &[
                doc! { "$match": { "n": { "$gt": 1 } } },
                doc! { "$sort": { "n": -1 } },
                doc! { "$skip": 1 },
                doc! { "$limit": 2 },
            ],
        )
        .unwrap();
        assert_eq!(result, vec![doc! { "n": 4 }, doc! { "n": 3 }]);

        let counted = aggregate(documents, &[doc! { "$count": "total" }]).unwrap();
        assert_eq!(counted, vec![doc! { "total": 5_i64 }]);
    }

    #[test]
    fn test_unknown_stage_is_an_error() {
        assert!(aggregate(vec![], &[doc! { "$lookup": {} }]).is_err());
    }
}
