//! Error types and result types for document store operations.
//!
//! Every fallible operation in this crate returns [`DocumentStoreResult<T>`].
//! Errors raised by event listeners and by the underlying store are propagated
//! to the caller unchanged; nothing in this crate retries on its own.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a document store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentStoreError {
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// The document, filter or update expression is malformed or failed validation.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// A lifecycle event listener refused the operation.
    #[error("Listener rejected {event}: {message}")]
    ListenerRejected {
        /// Name of the event kind the listener was subscribed to.
        event: String,
        /// Reason supplied by the listener.
        message: String,
    },
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
    /// Two migration steps were registered under the same version.
    #[error("Migration version {0} is already registered")]
    DuplicateMigrationVersion(u32),
    /// A migration step cannot run in the requested direction.
    #[error("Cannot migrate {direction} on version {version}")]
    MigrationStepMissingDirection {
        /// Version of the offending step.
        version: u32,
        /// `"up"` or `"down"`.
        direction: String,
    },
    /// An error occurred during schema migration.
    #[error("Migration error: {0}")]
    Migration(String),
    /// An unknown error occurred.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DocumentStoreError {
    /// Convenience constructor for listeners that want to veto an operation.
    pub fn rejected(event: impl Into<String>, message: impl Into<String>) -> Self {
        DocumentStoreError::ListenerRejected {
            event: event.into(),
            message: message.into(),
        }
    }
}

/// A specialized `Result` type for document store operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}
