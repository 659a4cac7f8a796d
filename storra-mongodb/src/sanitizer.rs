//! Name sanitization for MongoDB compatibility.
//!
//! MongoDB restricts collection names and field names (document keys) from containing
//! certain characters that it uses in its own query and namespace syntax. Documents
//! arriving over HTTP are arbitrary JSON, so their keys are escaped on the way in and
//! restored on the way out. Values are never touched.

use bson::{Bson, Document};

/// Sanitizes and restores names to handle MongoDB naming restrictions.
///
/// MongoDB does not allow names to contain:
/// - Dots (`.`) - used for nested field access in queries and for namespaces
/// - Dollar signs (`$`) - used for operators in queries
/// - Null bytes (`\0`) - name terminators
///
/// Those characters are percent-encoded, and so is `%` itself, which keeps the mapping
/// injective: two distinct names never share an escaped form.
pub(crate) struct ValueSanitizer;

impl ValueSanitizer {
    const ESCAPED: [char; 4] = ['%', '.', '$', '\0'];

    /// Recursively sanitizes every key of a document, including keys of nested
    /// documents and of documents inside arrays.
    pub(crate) fn sanitize_keys(document: Document) -> Document {
        document
            .into_iter()
            .map(|(k, v)| (Self::sanitize_string(&k), Self::map_nested(v, Self::sanitize_keys)))
            .collect()
    }

    /// Inverse of [`sanitize_keys`](Self::sanitize_keys).
    pub(crate) fn restore_keys(document: Document) -> Document {
        document
            .into_iter()
            .map(|(k, v)| (Self::restore_string(&k), Self::map_nested(v, Self::restore_keys)))
            .collect()
    }

    fn map_nested(value: Bson, f: fn(Document) -> Document) -> Bson {
        match value {
            Bson::Document(doc) => Bson::Document(f(doc)),
            Bson::Array(arr) => Bson::Array(
                arr
                    .into_iter()
                    .map(|item| Self::map_nested(item, f))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Percent-encodes the characters MongoDB rejects, and `%`.
    pub(crate) fn sanitize_string(input: &str) -> String {
        let mut sanitized = String::with_capacity(input.len());
        for c in input.chars() {
            if Self::ESCAPED.contains(&c) {
                sanitized.push_str(&format!("%{:02X}", c as u32));
            } else {
                sanitized.push(c);
            }
        }
        sanitized
    }

    /// Inverse of [`sanitize_string`](Self::sanitize_string). Sequences it could not
    /// have produced are kept verbatim.
    pub(crate) fn restore_string(input: &str) -> String {
        let mut restored = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = rest.find('%') {
            restored.push_str(&rest[..pos]);
            let escaped = rest
                .get(pos + 1..pos + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .map(char::from)
                .filter(|c| Self::ESCAPED.contains(c));
            match escaped {
                Some(c) => {
                    restored.push(c);
                    rest = &rest[pos + 3..];
                }
                None => {
                    restored.push('%');
                    rest = &rest[pos + 1..];
                }
            }
        }
        restored.push_str(rest);
        restored
    }
}
