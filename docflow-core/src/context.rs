//! Caller-supplied execution context.
//!
//! An [`ExecutionContext`] travels with every collection operation and is handed
//! to lifecycle listeners and behaviors. It conventionally carries the id of the
//! acting user, which blame and soft-delete behaviors record on the documents
//! they touch.

use bson::Bson;
use std::collections::HashMap;

/// Context passed by the caller through every collection operation.
///
/// `user_id` distinguishes three states:
///
/// - `None` - no user attribution was supplied at all
/// - `Some(Bson::Null)` - the operation was explicitly initiated by the system
/// - `Some(id)` - the operation was performed on behalf of `id`
///
/// # Example
///
/// ```ignore
/// use docflow::context::ExecutionContext;
///
/// let ctx = ExecutionContext::for_user("u-42").with("requestId", "abc");
/// assert_eq!(ctx.get("requestId"), Some(&bson::Bson::from("abc")));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    /// The acting user, if any.
    pub user_id: Option<Bson>,
    /// Additional caller-defined attributes.
    pub extra: HashMap<String, Bson>,
}

impl ExecutionContext {
    /// A context with no attribution, treated as system-initiated.
    pub fn system() -> Self {
        Self::default()
    }

    /// A context attributed to the given user.
    pub fn for_user(user_id: impl Into<Bson>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            extra: HashMap::new(),
        }
    }

    /// Adds an extension attribute.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Looks up an extension attribute.
    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.extra.get(key)
    }

    /// The user id recorded for attribution. Absent ids become `Bson::Null`.
    pub fn user_id(&self) -> Bson {
        self.user_id.clone().unwrap_or(Bson::Null)
    }

    /// Whether the caller supplied any user attribution, including an explicit null.
    pub fn has_user_id(&self) -> bool {
        self.user_id.is_some()
    }
}
