//! Embedded, file-backed storage backend for storra.
//!
//! This crate provides an implementation of the `StoreBackend` trait that keeps every
//! collection in its own [redb](https://docs.rs/redb) file below a data directory. It needs
//! no external service and is the default backend.
//!
//! # Features
//!
//! - **One file per collection** - `<data_dir>/<encoded name>.redb`, created on first write
//! - **Handle caching** - Each collection file is opened once and shared afterwards
//! - **Non-blocking** - File access runs on tokio's blocking pool
//! - **Idempotent deletes** - Removing a missing document or collection succeeds
//!
//! # Quick Start
//!
//! ```ignore
//! use storra_embedded::EmbeddedStore;
//! use storra_core::{backend::{StoreBackend, StoreBackendBuilder}, document::Document};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = EmbeddedStore::builder("data").build().await?;
//!
//!     let key = store.create("users", Document::from_json(json!({ "name": "Alice" }))?).await?;
//!     let alice = store.read("users", &key).await?;
//!     println!("{alice:?}");
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as storra_embedded;

pub mod cache;
pub mod store;

pub use cache::HandleCache;
pub use store::{EmbeddedConfig, EmbeddedStore, EmbeddedStoreBuilder};
