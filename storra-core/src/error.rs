//! Error types and result types for document store operations.
//!
//! Every error carries the HTTP status class it should be answered with, so the
//! response layer never needs to know which backend produced it.
//! Use [`StorraResult<T>`] as the return type for fallible operations.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when serving a document store request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorraError {
    /// The requested document (or the collection holding it) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The request path does not have the shape `/`, `/collection` or `/collection/key`.
    #[error("Bad path: {0}")]
    BadPath(String),
    /// The request body is not a JSON object.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// No operation is bound to this verb for this kind of resource.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    /// The networked backend was still connecting after the whole retry budget was spent.
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),
    /// The connection manager observed a state it cannot act on.
    #[error("Connection state error: {0}")]
    ConnectionState(String),
    /// A store-level invariant was broken, e.g. an update touching more than one document.
    #[error("Fatal invariant violation: {0}")]
    FatalInvariant(String),
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during backend initialization.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorraError {
    /// Shorthand for a [`StorraError::NotFound`] naming a document in a collection.
    pub fn document_not_found(collection: &str, key: &str) -> Self {
        StorraError::NotFound(format!("document {key} in collection {collection}"))
    }

    /// The HTTP status code this error should be answered with.
    pub fn status_code(&self) -> u16 {
        match self {
            StorraError::NotFound(_) => 404,
            StorraError::BadPath(_) | StorraError::InvalidDocument(_) => 400,
            StorraError::NotImplemented(_) => 501,
            StorraError::ConnectionTimeout(_)
            | StorraError::ConnectionState(_)
            | StorraError::FatalInvariant(_)
            | StorraError::Serialization(_)
            | StorraError::Initialization(_)
            | StorraError::Backend(_) => 500,
        }
    }

    /// Whether this error is caused by the request rather than by the server.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

/// A specialized `Result` type for document store operations.
pub type StorraResult<T> = Result<T, StorraError>;

impl From<BsonError> for StorraError {
    fn from(err: BsonError) -> Self {
        StorraError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for StorraError {
    fn from(err: SerdeJsonError) -> Self {
        StorraError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(StorraError::document_not_found("widgets", "abc").status_code(), 404);
        assert_eq!(StorraError::BadPath("/a/b/c".into()).status_code(), 400);
        assert_eq!(StorraError::NotImplemented("PATCH".into()).status_code(), 501);
        assert_eq!(StorraError::ConnectionTimeout("x".into()).status_code(), 500);
        assert_eq!(StorraError::FatalInvariant("x".into()).status_code(), 500);
    }

    #[test]
    fn client_errors() {
        assert!(StorraError::InvalidDocument("not an object".into()).is_client_error());
        assert!(!StorraError::Backend("disk full".into()).is_client_error());
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(StorraError::from(err), StorraError::Serialization(_)));
    }
}
