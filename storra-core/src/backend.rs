//! Storage backend abstraction for the document store.
//!
//! This module defines the contract every storage implementation must honor, so the
//! HTTP layer can serve the same CRUD surface from an embedded file store or from a
//! networked document database.
//!
//! # Overview
//!
//! The [`StoreBackend`] trait provides a unified async interface for the eight
//! operations the router dispatches to: availability probing, full-collection listing,
//! single-document read/create/update/remove, collection removal and connection
//! teardown. Implementations are required to be thread-safe (`Send + Sync`).
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use storra_core::backend::StoreBackend;
//! use storra_core::document::Document;
//! use serde_json::json;
//!
//! let key = backend.create("users", Document::from_json(json!({ "name": "Alice" }))?).await?;
//! let alice = backend.read("users", &key).await?;
//! assert_eq!(alice.id(), Some(key.as_str()));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use futures::{future, stream::BoxStream, Stream, StreamExt};
use std::fmt::Debug;

use crate::{document::Document, error::StorraResult};

/// A lazily produced sequence of documents.
///
/// A failure while iterating is yielded as a single `Err` item, after which the
/// stream ends.
pub type DocumentStream = BoxStream<'static, StorraResult<Document>>;

/// Abstract interface for document storage backends.
///
/// # Collections
///
/// Collections are created implicitly by the first write against a new name; there is
/// no explicit creation operation. They are destroyed only by
/// [`remove_collection`](StoreBackend::remove_collection).
///
/// # Idempotency
///
/// [`remove`](StoreBackend::remove) and [`remove_collection`](StoreBackend::remove_collection)
/// must succeed when the target is already absent. Every implementation has to keep
/// this property, since clients retry deletes.
///
/// # Error Handling
///
/// Operations return [`StorraResult<T>`](crate::error::StorraResult). Missing documents are
/// always reported as [`StorraError::NotFound`](crate::error::StorraError::NotFound),
/// whatever the backend's native error looks like.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Checks whether the backend can currently serve requests.
    ///
    /// For connection-oriented backends this establishes the connection if needed.
    async fn check_available(&self) -> StorraResult<()>;

    /// Lists every document in a collection, each with its identity attached.
    ///
    /// An unknown collection yields an empty stream. Errors that occur before the first
    /// document is produced are returned directly; errors during iteration are yielded
    /// once as the last stream item.
    async fn list(&self, collection: &str) -> StorraResult<DocumentStream>;

    /// Reads a single document, with its identity attached.
    ///
    /// # Errors
    ///
    /// Returns [`StorraError::NotFound`](crate::error::StorraError::NotFound) if the key is absent.
    async fn read(&self, collection: &str, key: &str) -> StorraResult<Document>;

    /// Stores a new document under a freshly generated key and returns that key.
    ///
    /// Any identity field present on `document` is ignored; keys are never chosen by the caller.
    async fn create(&self, collection: &str, document: Document) -> StorraResult<String>;

    /// Replaces an existing document wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`StorraError::NotFound`](crate::error::StorraError::NotFound) if the key does
    /// not exist; the collection is left unchanged in that case.
    async fn update(&self, collection: &str, key: &str, document: Document) -> StorraResult<()>;

    /// Removes a document. Succeeds if the key is already absent.
    async fn remove(&self, collection: &str, key: &str) -> StorraResult<()>;

    /// Removes a collection and all its documents. Succeeds if the collection does not exist.
    ///
    /// # Warning
    ///
    /// This operation is irreversible.
    async fn remove_collection(&self, collection: &str) -> StorraResult<()>;

    /// Releases the backend's connection, if it has one.
    ///
    /// The default implementation is a no-op, suitable for backends without external
    /// connections.
    async fn close_connection(&self) -> StorraResult<()> {
        Ok(())
    }
}

/// Factory trait for creating backend instances.
#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> StorraResult<Self::Backend>;
}

/// Wraps a fallible document stream so it ends right after the first error.
pub fn end_on_first_error<S>(stream: S) -> DocumentStream
where
    S: Stream<Item = StorraResult<Document>> + Send + 'static,
{
    stream
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}
