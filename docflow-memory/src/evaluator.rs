//! Filter evaluation for in-memory documents.
//!
//! This module evaluates Mongo-style filter documents against BSON documents:
//! logical operators (`$and`, `$or`, `$nor`), dotted field paths with implicit
//! array traversal, and the common field operators (`$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, `$regex`, `$not`, `$all`,
//! `$size`, `$elemMatch`).

use bson::{Bson, Document, datetime::DateTime, oid::ObjectId};
use regex::RegexBuilder;
use std::{cmp::Ordering, collections::HashMap};

use docflow_core::error::{DocumentStoreError, DocumentStoreResult};

/// Comparable view of a BSON value.
///
/// Integers and doubles are normalized to `f64`. Values of different kinds
/// are unordered; [`Comparable::total_cmp`] ranks them for sorting.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Number(f64),
    String(&'a str),
    Map(HashMap<&'a str, Comparable<'a>>),
    Array(Vec<Comparable<'a>>),
    ObjectId(ObjectId),
    Bool(bool),
    DateTime(DateTime),
    Other(&'a Bson),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null | Bson::Undefined => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            other => Comparable::Other(other),
        }
    }
}

impl<'a> Comparable<'a> {
    /// Sort rank of the value's kind.
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::ObjectId(_) => 5,
            Comparable::Bool(_) => 6,
            Comparable::DateTime(_) => 7,
            Comparable::Other(_) => 8,
        }
    }

    /// Orders any two values: by kind first, then by value.
    pub(crate) fn total_cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.partial_cmp(other).unwrap_or(Ordering::Equal))
    }
}

impl<'a> PartialEq for Comparable<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            (Comparable::Other(a), Comparable::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> PartialOrd for Comparable<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Some(Ordering::Equal),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Whether two BSON values are equal, treating all numeric types alike.
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    Comparable::from(a) == Comparable::from(b)
}

/// Returns the value at a dotted path, indexing arrays by numeric segments.
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(doc) => doc.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Collects every value a filter path can refer to.
///
/// Non-numeric segments applied to an array fan out over its document
/// elements, so `tags.name` reaches the `name` of every tag.
fn resolve<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Bson::Document(doc) => {
            if let Some(child) = doc.get(*head) {
                resolve(child, rest, out);
            }
        }
        Bson::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(child) = items.get(index) {
                    resolve(child, rest, out);
                }
            }
            Err(_) => {
                for item in items {
                    if let Bson::Document(_) = item {
                        resolve(item, segments, out);
                    }
                }
            }
        },
        _ => {}
    }
}

fn resolve_path<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments = path.split('.').collect::<Vec<_>>();
    let mut out = Vec::new();

    if let Some(first) = document.get(segments[0]) {
        resolve(first, &segments[1..], &mut out);
    }

    out
}

fn invalid(message: impl Into<String>) -> DocumentStoreError {
    DocumentStoreError::InvalidDocument(message.into())
}

fn is_operator_document(value: &Bson) -> bool {
    match value {
        Bson::Document(doc) => doc.keys().next().is_some_and(|key| key.starts_with('$')),
        _ => false,
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

/// Evaluates filters against documents.
pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    /// Whether the document satisfies `filter`. An empty filter matches everything.
    pub fn matches(&self, filter: &Document) -> DocumentStoreResult<bool> {
        for (key, condition) in filter {
            let matched = match key.as_str() {
                "$and" => self.all(condition)?,
                "$or" => self.any(condition)?,
                "$nor" => !self.any(condition)?,
                op if op.starts_with('$') => {
                    return Err(invalid(format!("unsupported top-level operator {}", op)));
                }
                path => self.field_matches(&resolve_path(self.document, path), condition)?,
            };

            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Keeps the documents matching `filter`, preserving order.
    pub fn filter_documents(
        documents: impl IntoIterator<Item = &'a Document>,
        filter: &Document,
    ) -> DocumentStoreResult<Vec<Document>> {
        let mut matched = Vec::new();

        for document in documents {
            if DocumentEvaluator::new(document).matches(filter)? {
                matched.push(document.clone());
            }
        }

        Ok(matched)
    }

    fn clauses(condition: &Bson) -> DocumentStoreResult<Vec<&Document>> {
        match condition {
            Bson::Array(items) => items
                .iter()
                .map(|item| match item {
                    Bson::Document(doc) => Ok(doc),
                    _ => Err(invalid("logical operators expect an array of documents")),
                })
                .collect(),
            _ => Err(invalid("logical operators expect an array of documents")),
        }
    }

    fn all(&self, condition: &Bson) -> DocumentStoreResult<bool> {
        for clause in Self::clauses(condition)? {
            if !self.matches(clause)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn any(&self, condition: &Bson) -> DocumentStoreResult<bool> {
        for clause in Self::clauses(condition)? {
            if self.matches(clause)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn field_matches(&self, values: &[&Bson], condition: &Bson) -> DocumentStoreResult<bool> {
        match condition {
            Bson::Document(ops) if is_operator_document(condition) => {
                for (op, arg) in ops {
                    if !self.operator_matches(values, op, arg, ops)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Bson::RegularExpression(regex) => {
                regex_matches(values, regex.pattern.as_str(), regex.options.as_str())
            }
            expected => Ok(equals(values, expected)),
        }
    }

    fn operator_matches(
        &self,
        values: &[&Bson],
        op: &str,
        arg: &Bson,
        ops: &Document,
    ) -> DocumentStoreResult<bool> {
        match op {
            "$eq" => Ok(equals(values, arg)),
            "$ne" => Ok(!equals(values, arg)),
            "$gt" => Ok(compares(values, arg, |o| o == Ordering::Greater)),
            "$gte" => Ok(compares(values, arg, |o| o != Ordering::Less)),
            "$lt" => Ok(compares(values, arg, |o| o == Ordering::Less)),
            "$lte" => Ok(compares(values, arg, |o| o != Ordering::Greater)),
            "$in" => Ok(in_list(values, arg)?),
            "$nin" => Ok(!in_list(values, arg)?),
            "$exists" => Ok(truthy(arg) != values.is_empty()),
            "$regex" => {
                let options = ops.get_str("$options").unwrap_or_default();
                match arg {
                    Bson::String(pattern) => regex_matches(values, pattern, options),
                    Bson::RegularExpression(regex) => {
                        regex_matches(values, regex.pattern.as_str(), regex.options.as_str())
                    }
                    _ => Err(invalid("$regex expects a string")),
                }
            }
            "$options" => Ok(true),
            "$not" => Ok(!self.field_matches(values, arg)?),
            "$all" => match arg {
                Bson::Array(expected) => Ok(!expected.is_empty()
                    && expected.iter().all(|item| equals(values, item))),
                _ => Err(invalid("$all expects an array")),
            },
            "$size" => {
                let size = match arg {
                    Bson::Int32(n) => *n as i64,
                    Bson::Int64(n) => *n,
                    _ => return Err(invalid("$size expects an integer")),
                };
                Ok(values.iter().any(|value| {
                    matches!(value, Bson::Array(items) if items.len() as i64 == size)
                }))
            }
            "$elemMatch" => {
                let Bson::Document(sub) = arg else {
                    return Err(invalid("$elemMatch expects a document"));
                };
                for value in values {
                    if let Bson::Array(items) = value {
                        for item in items {
                            let matched = match item {
                                Bson::Document(doc) if !is_operator_document(arg) => {
                                    DocumentEvaluator::new(doc).matches(sub)?
                                }
                                other => self.field_matches(&[other], arg)?,
                            };
                            if matched {
                                return Ok(true);
                            }
                        }
                    }
                }
                Ok(false)
            }
            other => Err(invalid(format!("unsupported query operator {}", other))),
        }
    }
}

/// Equality with array membership: `{ tags: "a" }` matches `tags: ["a", "b"]`,
/// and `null` matches missing fields.
fn equals(values: &[&Bson], expected: &Bson) -> bool {
    if values.is_empty() {
        return matches!(expected, Bson::Null);
    }

    values.iter().any(|value| {
        values_equal(value, expected)
            || matches!(value, Bson::Array(items) if items.iter().any(|item| values_equal(item, expected)))
    })
}

fn compares(values: &[&Bson], arg: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let expected = Comparable::from(arg);
    let check = |value: &Bson| {
        Comparable::from(value)
            .partial_cmp(&expected)
            .is_some_and(&accept)
    };

    values.iter().any(|value| match *value {
        Bson::Array(items) => items.iter().any(&check),
        other => check(other),
    })
}

fn in_list(values: &[&Bson], arg: &Bson) -> DocumentStoreResult<bool> {
    match arg {
        Bson::Array(candidates) => Ok(candidates.iter().any(|candidate| match candidate {
            Bson::RegularExpression(regex) => {
                regex_matches(values, regex.pattern.as_str(), regex.options.as_str()).unwrap_or(false)
            }
            other => equals(values, other),
        })),
        _ => Err(invalid("$in and $nin expect an array")),
    }
}

fn regex_matches(values: &[&Bson], pattern: &str, options: &str) -> DocumentStoreResult<bool> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|err| invalid(format!("invalid $regex: {}", err)))?;

    let check = |value: &Bson| matches!(value, Bson::String(s) if regex.is_match(s));

    Ok(values.iter().any(|value| match *value {
        Bson::Array(items) => items.iter().any(&check),
        other => check(other),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn matches(document: Document, filter: Document) -> bool {
        DocumentEvaluator::new(&document).matches(&filter).unwrap()
    }

    #[test]
    fn test_equality_and_numeric_types() {
        assert!(matches(doc! { "a": 1 }, doc! { "a": 1.0 }));
        assert!(matches(doc! { "a": 1_i64 }, doc! { "a": { "$eq": 1 } }));
        assert!(!matches(doc! { "a": 2 }, doc! { "a": 1 }));
    }

    #[test]
    fn test_ne_matches_missing_field() {
        assert!(matches(doc! { "title": "x" }, doc! { "isDeleted": { "$ne": true } }));
        assert!(matches(doc! { "isDeleted": false }, doc! { "isDeleted": { "$ne": true } }));
        assert!(!matches(doc! { "isDeleted": true }, doc! { "isDeleted": { "$ne": true } }));
    }

    #[test]
    fn test_dotted_paths_and_arrays() {
        let post = doc! { "author": { "name": "ann" }, "tags": [{ "name": "a" }, { "name": "b" }] };

        assert!(matches(post.clone(), doc! { "author.name": "ann" }));
        assert!(matches(post.clone(), doc! { "tags.name": "b" }));
        assert!(matches(post.clone(), doc! { "tags.1.name": "b" }));
        assert!(!matches(post, doc! { "tags.0.name": "b" }));
        assert!(matches(doc! { "tags": ["a", "b"] }, doc! { "tags": "a" }));
    }

    #[test]
    fn test_comparisons_and_sets() {
        let doc = doc! { "n": 5, "s": "abc" };

        assert!(matches(doc.clone(), doc! { "n": { "$gt": 4, "$lte": 5 } }));
        assert!(!matches(doc.clone(), doc! { "n": { "$gt": "4" } }));
        assert!(matches(doc.clone(), doc! { "n": { "$in": [1, 5] } }));
        assert!(matches(doc.clone(), doc! { "missing": { "$nin": [1] } }));
        assert!(matches(doc.clone(), doc! { "s": { "$regex": "^AB", "$options": "i" } }));
        assert!(matches(doc, doc! { "n": { "$not": { "$lt": 5 } } }));
    }

    #[test]
    fn test_logical_operators() {
        let doc = doc! { "a": 1, "b": 2 };

        assert!(matches(doc.clone(), doc! { "$or": [{ "a": 2 }, { "b": 2 }] }));
        assert!(matches(doc.clone(), doc! { "$and": [{ "a": 1 }, { "b": 2 }] }));
        assert!(!matches(doc, doc! { "$nor": [{ "a": 1 }] }));
    }

    #[test]
    fn test_exists_and_all() {
        assert!(matches(doc! { "a": null }, doc! { "a": { "$exists": true } }));
        assert!(matches(doc! {}, doc! { "a": { "$exists": false } }));
        assert!(matches(doc! { "t": ["x", "y"] }, doc! { "t": { "$all": ["y", "x"] } }));
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let result = DocumentEvaluator::new(&doc! { "a": 1 }).matches(&doc! { "a": { "$near": 1 } });

        assert!(matches!(result, Err(DocumentStoreError::InvalidDocument(_))));
    }

    #[test]
    fn test_total_order_ranks_kinds() {
        let null = Bson::Null;
        let number = Bson::Int32(10);
        let string = Bson::String("a".to_string());

        assert_eq!(Comparable::from(&null).total_cmp(&Comparable::from(&number)), Ordering::Less);
        assert_eq!(Comparable::from(&string).total_cmp(&Comparable::from(&number)), Ordering::Greater);
    }
}
