//! MongoDB backend implementation for storra.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait.
//! Documents are stored in one MongoDB collection per storra collection, keyed by
//! MongoDB's own `ObjectId`, which is exposed to clients as a hex string.
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to a self-hosted or managed MongoDB
//! - **Connection gating** - Concurrent requests arriving during the initial handshake
//!   share a single connect attempt (see [`connection`])
//! - **Async/await** - Fully asynchronous API built on MongoDB's async driver
//! - **Streaming listing** - Collections are streamed from the server cursor
//!
//! # Example
//!
//! ```ignore
//! use storra_core::backend::StoreBackendBuilder;
//! use storra_mongodb::{MongoDbConfig, MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder(&MongoDbConfig::default())
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as storra_mongodb;

pub mod config;
pub mod connection;
pub mod store;
pub(crate) mod sanitizer;

pub use config::MongoDbConfig;
pub use connection::{ConnectionManager, ConnectionState, Connector, RetryPolicy};
pub use store::{MongoConnector, MongoDbStore, MongoDbStoreBuilder};
