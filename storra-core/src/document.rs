//! The untyped document model shared by every backend.
//!
//! A [`Document`] is an opaque JSON object. Its identity is never chosen by the caller:
//! backends assign a key on creation and expose it in the [`ID_FIELD`] field when the
//! document is read back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorraError, StorraResult};

/// Name of the field carrying a document's identity key.
pub const ID_FIELD: &str = "_id";

/// A JSON object stored in a collection.
///
/// # Example
///
/// ```ignore
/// use storra_core::document::Document;
/// use serde_json::json;
///
/// let doc = Document::from_json(json!({ "name": "Alice" }))?.with_id("0192f0c1");
/// assert_eq!(doc.id(), Some("0192f0c1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds a document from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`StorraError::InvalidDocument`] if the value is not a JSON object.
    pub fn from_json(value: Value) -> StorraResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StorraError::InvalidDocument(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parses a request body into a document.
    ///
    /// Malformed JSON is reported as [`StorraError::InvalidDocument`] since it is the
    /// caller's fault, not a server-side serialization problem.
    pub fn from_slice(bytes: &[u8]) -> StorraResult<Self> {
        let value = serde_json::from_slice(bytes)
            .map_err(|e| StorraError::InvalidDocument(e.to_string()))?;

        Self::from_json(value)
    }

    /// Returns the identity key, if one is attached.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Attaches (or replaces) the identity key.
    pub fn with_id(mut self, key: impl Into<String>) -> Self {
        self.0.insert(ID_FIELD.to_string(), Value::String(key.into()));
        self
    }

    /// Returns the document with any identity field stripped, ready to be persisted.
    pub fn without_id(mut self) -> Self {
        self.0.remove(ID_FIELD);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes the document to JSON bytes.
    pub fn to_vec(&self) -> StorraResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_objects_are_documents() {
        assert!(Document::from_json(json!({ "a": 1 })).is_ok());

        let err = Document::from_json(json!([1, 2])).unwrap_err();
        assert_eq!(err, StorraError::InvalidDocument("expected a JSON object, got an array".into()));
    }

    #[test]
    fn malformed_body_is_a_client_error() {
        let err = Document::from_slice(b"{\"a\":").unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn identity_round_trip() {
        let doc = Document::from_json(json!({ "a": 1 })).unwrap().with_id("k1");
        assert_eq!(doc.id(), Some("k1"));
        assert_eq!(doc.len(), 2);

        let stripped = doc.without_id();
        assert_eq!(stripped.id(), None);
        assert_eq!(Value::from(stripped), json!({ "a": 1 }));
    }

    #[test]
    fn serializes_as_plain_object() {
        let doc = Document::from_json(json!({ "a": 1 })).unwrap().with_id("k1");
        assert_eq!(serde_json::to_value(&doc).unwrap(), json!({ "a": 1, "_id": "k1" }));
    }
}
