//! Update-operator application for in-memory documents.
//!
//! Supports `$set`, `$unset`, `$inc`, `$push` (with `$each`), `$addToSet`,
//! `$pull`, `$rename` and `$setOnInsert`. Paths are dotted; numeric segments
//! index into arrays. A `$` segment is the positional operator: it stands for
//! the first element of that array matched by the update's filter.

use bson::{Bson, Document};

use docflow_core::error::{DocumentStoreError, DocumentStoreResult};

use crate::evaluator::{DocumentEvaluator, get_path, values_equal};

/// How far past the end of an array a path may write. The gap is filled with nulls.
const MAX_ARRAY_PADDING: usize = 1024;

fn invalid(message: impl Into<String>) -> DocumentStoreError {
    DocumentStoreError::InvalidDocument(message.into())
}

/// Applies an update expression to `document`.
///
/// `inserting` enables `$setOnInsert`; it is set when the document is being
/// created by an upsert. Returns whether the document changed.
pub(crate) fn apply_update(document: &mut Document, update: &Document, inserting: bool) -> DocumentStoreResult<bool> {
    if update.is_empty() || update.keys().any(|key| !key.starts_with('$')) {
        return Err(invalid("update document requires update operators"));
    }

    let before = document.clone();

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(invalid(format!("{} expects a document", operator)));
        };

        for (path, value) in fields {
            match operator.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(document, path, value.clone())?;
                    }
                }
                "$unset" => unset_path(document, path),
                "$inc" => {
                    let current = get_path(document, path).cloned().unwrap_or(Bson::Int32(0));
                    set_path(document, path, add(&current, value, path)?)?;
                }
                "$push" => {
                    let mut items = array_at(document, path)?;
                    match value {
                        Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                            Some(Bson::Array(values)) => items.extend(values.iter().cloned()),
                            _ => return Err(invalid("$each expects an array")),
                        },
                        other => items.push(other.clone()),
                    }
                    set_path(document, path, Bson::Array(items))?;
                }
                "$addToSet" => {
                    let mut items = array_at(document, path)?;
                    let values = match value {
                        Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                            Some(Bson::Array(values)) => values.clone(),
                            _ => return Err(invalid("$each expects an array")),
                        },
                        other => vec![other.clone()],
                    };
                    for value in values {
                        if !items.iter().any(|item| values_equal(item, &value)) {
                            items.push(value);
                        }
                    }
                    set_path(document, path, Bson::Array(items))?;
                }
                "$pull" => {
                    if get_path(document, path).is_none() {
                        continue;
                    }
                    let items = array_at(document, path)?;
                    let mut kept = Vec::with_capacity(items.len());
                    for item in items {
                        if !pull_matches(&item, value)? {
                            kept.push(item);
                        }
                    }
                    set_path(document, path, Bson::Array(kept))?;
                }
                "$rename" => {
                    let Bson::String(target) = value else {
                        return Err(invalid("$rename expects a string target"));
                    };
                    if let Some(moved) = get_path(document, path).cloned() {
                        unset_path(document, path);
                        set_path(document, target, moved)?;
                    }
                }
                other => return Err(invalid(format!("unsupported update operator {}", other))),
            }
        }
    }

    Ok(before != *document)
}

/// Rewrites `$` path segments in `update` to the index of the first array
/// element that `filter` matched in `document`. Only top-level filter clauses
/// on the array's path take part in the match.
pub(crate) fn resolve_positional(
    document: &Document,
    filter: &Document,
    update: &Document,
) -> DocumentStoreResult<Document> {
    let mut resolved = Document::new();

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            resolved.insert(operator.clone(), fields.clone());
            continue;
        };

        let mut rewritten = Document::new();
        for (path, value) in fields {
            let segments = path.split('.').collect::<Vec<_>>();
            let path = match segments.iter().position(|segment| *segment == "$") {
                Some(at) => {
                    let index = matched_index(document, filter, &segments[..at].join("."))?.to_string();
                    let mut parts = segments[..at].to_vec();
                    parts.push(&index);
                    parts.extend_from_slice(&segments[at + 1..]);
                    parts.join(".")
                }
                None => path.clone(),
            };
            rewritten.insert(path, value.clone());
        }
        resolved.insert(operator.clone(), rewritten);
    }

    Ok(resolved)
}

fn matched_index(document: &Document, filter: &Document, array_path: &str) -> DocumentStoreResult<usize> {
    let Some(Bson::Array(items)) = get_path(document, array_path) else {
        return Err(invalid(format!("positional operator needs an array at {}", array_path)));
    };

    let nested = format!("{}.", array_path);
    let clauses = filter
        .iter()
        .filter(|(key, _)| key.as_str() == array_path || key.starts_with(&nested))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Document>();

    if !clauses.is_empty() {
        for (index, item) in items.iter().enumerate() {
            let mut candidate = Document::new();
            set_path(&mut candidate, array_path, Bson::Array(vec![item.clone()]))?;
            if DocumentEvaluator::new(&candidate).matches(&clauses)? {
                return Ok(index);
            }
        }
    }

    Err(invalid(format!("the filter matched no element of {} for the positional operator", array_path)))
}

/// Builds the initial document of an upsert from the filter's equality clauses.
pub(crate) fn seed_from_filter(filter: &Document) -> DocumentStoreResult<Document> {
    let mut seed = Document::new();

    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }

        match value {
            Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => {
                if let Some(eq) = ops.get("$eq") {
                    set_path(&mut seed, key, eq.clone())?;
                }
            }
            other => set_path(&mut seed, key, other.clone())?,
        }
    }

    Ok(seed)
}

fn pull_matches(item: &Bson, condition: &Bson) -> DocumentStoreResult<bool> {
    match (item, condition) {
        (Bson::Document(doc), Bson::Document(filter))
            if !filter.keys().next().is_some_and(|k| k.starts_with('$')) =>
        {
            DocumentEvaluator::new(doc).matches(filter)
        }
        (_, Bson::Document(ops)) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => {
            let mut wrapper = Document::new();
            wrapper.insert("v", item.clone());
            let mut filter = Document::new();
            filter.insert("v", condition.clone());
            DocumentEvaluator::new(&wrapper).matches(&filter)
        }
        (_, expected) => Ok(values_equal(item, expected)),
    }
}

fn array_at(document: &Document, path: &str) -> DocumentStoreResult<Vec<Bson>> {
    match get_path(document, path) {
        None | Some(Bson::Null) => Ok(Vec::new()),
        Some(Bson::Array(items)) => Ok(items.clone()),
        Some(_) => Err(invalid(format!("field {} is not an array", path))),
    }
}

fn add(current: &Bson, delta: &Bson, path: &str) -> DocumentStoreResult<Bson> {
    let long = |a: i64, b: i64| {
        a.checked_add(b)
            .map(Bson::Int64)
            .ok_or_else(|| invalid(format!("$inc overflows 64-bit integer field {}", path)))
    };

    Ok(match (current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Bson::Int32(a), Bson::Int64(b)) => long(i64::from(*a), *b)?,
        (Bson::Int64(a), Bson::Int32(b)) => long(*a, i64::from(*b))?,
        (Bson::Int64(a), Bson::Int64(b)) => long(*a, *b)?,
        (Bson::Double(a), Bson::Double(b)) => Bson::Double(a + b),
        (Bson::Double(a), Bson::Int32(b)) => Bson::Double(a + *b as f64),
        (Bson::Double(a), Bson::Int64(b)) => Bson::Double(a + *b as f64),
        (Bson::Int32(a), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        (Bson::Int64(a), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        _ => return Err(invalid(format!("cannot $inc non-numeric field {}", path))),
    })
}

/// Sets the value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> DocumentStoreResult<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(child) => set_in(child, rest, value, path),
                None => Err(invalid(format!("cannot create field {}", head))),
            }
        }
    }
}

fn set_in(target: &mut Bson, path: &str, value: Bson, full: &str) -> DocumentStoreResult<()> {
    match target {
        Bson::Document(doc) => set_path(doc, path, value),
        Bson::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let index = head
                .parse::<usize>()
                .map_err(|_| invalid(format!("cannot create field {} inside array at {}", head, full)))?;

            if index.saturating_sub(items.len()) > MAX_ARRAY_PADDING {
                return Err(invalid(format!("array index {} is too far past the end on path {}", head, full)));
            }
            if items.len() <= index {
                items.resize(index + 1, Bson::Null);
            }

            match rest {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(rest) => {
                    if matches!(items[index], Bson::Null) {
                        items[index] = Bson::Document(Document::new());
                    }
                    set_in(&mut items[index], rest, value, full)
                }
            }
        }
        _ => Err(invalid(format!("cannot traverse scalar on path {}", full))),
    }
}

/// Removes the value at a dotted path. Array elements are nulled, not removed.
pub(crate) fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(child) = document.get_mut(head) {
                unset_in(child, rest);
            }
        }
    }
}

fn unset_in(target: &mut Bson, path: &str) {
    match target {
        Bson::Document(doc) => unset_path(doc, path),
        Bson::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let Ok(index) = head.parse::<usize>() else {
                return;
            };
            match (items.get_mut(index), rest) {
                (Some(item), None) => *item = Bson::Null,
                (Some(item), Some(rest)) => unset_in(item, rest),
                (None, _) => {}
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn updated(mut document: Document, update: Document) -> Document {
        apply_update(&mut document, &update, false).unwrap();
        document
    }

    #[test]
    fn test_set_and_unset_paths() {
        assert_eq!(
            updated(doc! { "a": 1 }, doc! { "$set": { "b.c": 2 }, "$unset": { "a": "" } }),
            doc! { "b": { "c": 2 } }
        );
        assert_eq!(
            updated(doc! { "tags": [{ "n": "a" }, { "n": "b" }] }, doc! { "$set": { "tags.1.n": "x" } }),
            doc! { "tags": [{ "n": "a" }, { "n": "x" }] }
        );
    }

    #[test]
    fn test_inc_promotes_types() {
        assert_eq!(updated(doc! { "n": 1 }, doc! { "$inc": { "n": 2 } }), doc! { "n": 3 });
        assert_eq!(updated(doc! {}, doc! { "$inc": { "n": 1.5 } }), doc! { "n": 1.5 });
        assert_eq!(
            updated(doc! { "n": i32::MAX }, doc! { "$inc": { "n": 1 } }),
            doc! { "n": (i32::MAX as i64 + 1) }
        );
    }

    #[test]
    fn test_inc_rejects_64_bit_overflow() {
        let mut document = doc! { "n": i64::MAX };

        assert!(apply_update(&mut document, &doc! { "$inc": { "n": 1 } }, false).is_err());
        assert!(apply_update(&mut document, &doc! { "$inc": { "n": 1_i64 } }, false).is_err());
        assert_eq!(document, doc! { "n": i64::MAX });

        let mut document = doc! { "n": 1 };
        assert!(apply_update(&mut document, &doc! { "$inc": { "n": i64::MAX } }, false).is_err());
    }

    #[test]
    fn test_far_array_indexes_are_rejected() {
        let mut document = doc! { "tags": ["a"] };

        for path in ["tags.18446744073709551615", "tags.100000000000", "tags.5000.name"] {
            let mut update = Document::new();
            update.insert("$set", doc! { path: "x" });
            assert!(apply_update(&mut document, &update, false).is_err());
        }
        assert_eq!(document, doc! { "tags": ["a"] });

        assert_eq!(
            updated(document, doc! { "$set": { "tags.3": "d" } }),
            doc! { "tags": ["a", Bson::Null, Bson::Null, "d"] }
        );
    }

    #[test]
    fn test_positional_segment_targets_matched_element() {
        let document = doc! { "comments": [{ "id": 1, "body": "a" }, { "id": 2, "body": "b" }] };

        let update = resolve_positional(
            &document,
            &doc! { "_id": 1, "comments.id": 2 },
            &doc! { "$set": { "comments.$.body": "edited" }, "$inc": { "views": 1 } },
        )
        .unwrap();
        assert_eq!(update, doc! { "$set": { "comments.1.body": "edited" }, "$inc": { "views": 1 } });

        let update = resolve_positional(
            &doc! { "tags": ["x", "y"] },
            &doc! { "tags": "y" },
            &doc! { "$set": { "tags.$": "z" } },
        )
        .unwrap();
        assert_eq!(update, doc! { "$set": { "tags.1": "z" } });
    }

    #[test]
    fn test_positional_segment_requires_a_match() {
        let document = doc! { "comments": [{ "id": 1 }] };
        let update = doc! { "$set": { "comments.$.body": "x" } };

        assert!(resolve_positional(&document, &doc! { "comments.id": 9 }, &update).is_err());
        assert!(resolve_positional(&document, &doc! {}, &update).is_err());
        assert!(resolve_positional(&doc! {}, &doc! { "comments.id": 1 }, &update).is_err());
    }

    #[test]
    fn test_array_operators() {
        let doc = updated(
            doc! { "t": ["a"] },
            doc! { "$push": { "t": { "$each": ["b", "c"] } } },
        );
        assert_eq!(doc, doc! { "t": ["a", "b", "c"] });

        let doc = updated(doc, doc! { "$pull": { "t": "b" }, "$addToSet": { "u": "x" } });
        assert_eq!(doc, doc! { "t": ["a", "c"], "u": ["x"] });

        let doc = updated(doc! { "n": [1, 5, 9] }, doc! { "$pull": { "n": { "$gte": 5 } } });
        assert_eq!(doc, doc! { "n": [1] });
    }

    #[test]
    fn test_rename_and_set_on_insert() {
        let mut document = doc! { "old": 1 };
        apply_update(&mut document, &doc! { "$rename": { "old": "new" }, "$setOnInsert": { "c": 1 } }, false).unwrap();
        assert_eq!(document, doc! { "new": 1 });

        let mut document = doc! {};
        apply_update(&mut document, &doc! { "$setOnInsert": { "c": 1 } }, true).unwrap();
        assert_eq!(document, doc! { "c": 1 });
    }

    #[test]
    fn test_reports_modification() {
        let mut document = doc! { "a": 1 };

        assert!(!apply_update(&mut document, &doc! { "$set": { "a": 1 } }, false).unwrap());
        assert!(apply_update(&mut document, &doc! { "$set": { "a": 2 } }, false).unwrap());
    }

    #[test]
    fn test_rejects_replacement_documents() {
        let mut document = doc! {};

        assert!(apply_update(&mut document, &doc! { "a": 1 }, false).is_err());
    }

    #[test]
    fn test_seed_from_filter() {
        let seed = seed_from_filter(&doc! { "_id": "status", "locked": { "$eq": false }, "n": { "$gt": 1 } }).unwrap();

        assert_eq!(seed, doc! { "_id": "status", "locked": false });
    }
}
