//! HTTP document store.
//!
//! Documents are JSON objects grouped into named collections and addressed as
//! `/{collection}/{key}`. Requests are routed to one of two interchangeable backends:
//!
//! - [`embedded`]: one file per collection under a local data directory
//! - [`mongodb`]: a MongoDB database, connected lazily on first use
//!
//! ```ignore
//! use storra::{StorraConfig, StorraServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = StorraServer::from_config(StorraConfig::default()).await.unwrap();
//!     server.serve().await.unwrap();
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod router;
pub mod server;

pub use storra_core::document;

pub use backend::Backend;
pub use config::{BackendKind, ServerConfig, StorraConfig};
pub use error::{ServerError, ServerResult};
pub use server::StorraServer;

/// File-backed storage backend.
pub mod embedded {
    pub use storra_embedded::{EmbeddedConfig, EmbeddedStore, EmbeddedStoreBuilder};
}

/// MongoDB storage backend.
pub mod mongodb {
    pub use storra_mongodb::{MongoDbConfig, MongoDbStore, MongoDbStoreBuilder};
}
