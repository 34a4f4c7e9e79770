//! Field-level summaries of update expressions.
//!
//! Update listeners usually care about *which* fields an update touches rather
//! than the exact operators used. [`FieldDiffSummary::from_update`] derives that
//! set deterministically from a Mongo-style update expression.

use bson::{Bson, Document};
use regex::Regex;
use std::sync::LazyLock;

/// Matches a numeric array index segment such as `.3` or `.3.`.
static ARRAY_INDEX_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\d+\.?").expect("valid array index pattern"));

/// The set of fields touched by an update expression.
///
/// Both lists keep first-seen order and contain no duplicates.
///
/// # Example
///
/// ```ignore
/// use bson::doc;
/// use docflow::fields::FieldDiffSummary;
///
/// let summary = FieldDiffSummary::from_update(&doc! {
///     "$set": { "profile.name": "Ana", "tags.2.label": "x" },
///     "$unset": { "comments.$.body": "" },
/// });
///
/// assert_eq!(summary.all, vec!["profile.name", "tags", "comments"]);
/// assert_eq!(summary.top, vec!["profile", "tags", "comments"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDiffSummary {
    /// Every affected field path, truncated at array positions.
    pub all: Vec<String>,
    /// The top-level field names of `all`.
    pub top: Vec<String>,
}

impl FieldDiffSummary {
    /// Computes the summary of an update expression.
    pub fn from_update(update: &Document) -> Self {
        let mut summary = Self::default();

        for (key, value) in update {
            if !key.starts_with('$') {
                summary.record(key.clone());
                continue;
            }

            if let Bson::Document(params) = value {
                for path in params.keys() {
                    summary.record(affected_field(path));
                }
            }
        }

        summary
    }

    /// Whether the given top-level field is touched.
    pub fn touches(&self, field: &str) -> bool {
        self.top.iter().any(|top| top == field) || self.all.iter().any(|f| f == field)
    }

    fn record(&mut self, field: String) {
        let top = field
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();

        if !self.all.contains(&field) {
            self.all.push(field);
        }
        if !self.top.contains(&top) {
            self.top.push(top);
        }
    }
}

/// Truncates a dotted update path at its first array position.
fn affected_field(path: &str) -> String {
    if let Some(found) = ARRAY_INDEX_SEGMENT.find(path) {
        return path[..found.start()].to_string();
    }

    if let Some(index) = path.find(".$.") {
        return path[..index].to_string();
    }

    if let Some(index) = path.find(".$") {
        return path[..index].to_string();
    }

    path.to_string()
}
