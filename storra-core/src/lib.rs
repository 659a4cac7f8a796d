//! Core types for storra, a document store served over HTTP.
//!
//! This crate is shared by the backend implementations and the server and provides:
//!
//! - **Documents** ([`document`]) - The untyped JSON document model and its identity field
//! - **Store backend abstraction** ([`backend`]) - The CRUD contract every backend implements
//! - **Error handling** ([`error`]) - The error taxonomy, each variant carrying its HTTP status class
//!
//! # Example
//!
//! ```ignore
//! use storra_core::{backend::StoreBackend, document::Document};
//! use serde_json::json;
//!
//! async fn roundtrip(backend: &impl StoreBackend) -> storra_core::error::StorraResult<()> {
//!     let key = backend.create("widgets", Document::from_json(json!({ "a": 1 }))?).await?;
//!     backend.remove("widgets", &key).await?;
//!     backend.remove("widgets", &key).await
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as storra_core;

pub mod backend;
pub mod document;
pub mod error;

pub use backend::{DocumentStream, StoreBackend, StoreBackendBuilder};
pub use document::{Document, ID_FIELD};
pub use error::{StorraError, StorraResult};
