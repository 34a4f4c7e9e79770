//! Core traits for typed documents and their serialization.
//!
//! A [`Model`] is a serde type bound to a collection. [`ModelExt`] converts
//! models to and from the BSON documents the store works with.

use bson::{Bson, Document, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Deserialize, Serialize};
use serde_json::{Value, from_value, to_value};

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// A document type stored in a named collection.
///
/// Models carry their own `_id` field if they care about it. Documents
/// inserted without one get an ObjectId from the backend.
///
/// # Example
///
/// ```ignore
/// use docflow::model::Model;
/// use bson::oid::ObjectId;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Post {
///     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
///     pub id: Option<ObjectId>,
///     pub title: String,
/// }
///
/// impl Model for Post {
///     fn collection_name() -> &'static str {
///         "posts"
///     }
/// }
/// ```
pub trait Model: Serialize + for<'de> Deserialize<'de> + Send + Sync + Clone + 'static {
    /// Returns the name of the collection this model belongs to.
    fn collection_name() -> &'static str;
}

/// Conversion helpers, implemented for every [`Model`].
pub trait ModelExt: Model {
    /// Converts this model to a BSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the model does not
    /// serialize to a document.
    fn to_document(&self) -> DocumentStoreResult<Document>;

    /// Creates a model from a stored document.
    fn from_document(document: Document) -> DocumentStoreResult<Self>;

    /// Converts this model to a JSON value.
    fn to_json(&self) -> DocumentStoreResult<Value>;

    /// Creates a model from a JSON value.
    fn from_json(value: Value) -> DocumentStoreResult<Self>;
}

impl<M: Model> ModelExt for M {
    fn to_document(&self) -> DocumentStoreResult<Document> {
        match serialize_to_bson(self)? {
            Bson::Document(document) => Ok(document),
            other => Err(DocumentStoreError::Serialization(format!(
                "{} serialized to {:?}, expected a document",
                M::collection_name(),
                other.element_type()
            ))),
        }
    }

    fn from_document(document: Document) -> DocumentStoreResult<Self> {
        Ok(deserialize_from_bson(Bson::Document(document))?)
    }

    fn to_json(&self) -> DocumentStoreResult<Value> {
        Ok(to_value(self)?)
    }

    fn from_json(value: Value) -> DocumentStoreResult<Self> {
        Ok(from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        #[serde(default)]
        pinned: bool,
    }

    impl Model for Note {
        fn collection_name() -> &'static str {
            "notes"
        }
    }

    #[test]
    fn test_document_conversion() {
        let note = Note { title: "hi".to_string(), pinned: true };

        let document = note.to_document().unwrap();
        assert_eq!(document, doc! { "title": "hi", "pinned": true });
        assert_eq!(Note::from_document(document).unwrap(), note);
    }

    #[test]
    fn test_from_document_rejects_wrong_shape() {
        let err = Note::from_document(doc! { "title": 5 }).unwrap_err();

        assert!(matches!(err, DocumentStoreError::Serialization(_)));
    }

    #[test]
    fn test_json_conversion() {
        let note = Note::from_json(serde_json::json!({ "title": "x" })).unwrap();

        assert_eq!(note, Note { title: "x".to_string(), pinned: false });
        assert_eq!(note.to_json().unwrap()["pinned"], serde_json::json!(false));
    }
}
