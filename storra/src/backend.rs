//! The backend selected at startup.
//!
//! Exactly two storage implementations exist, and their contracts have to stay in
//! lockstep, so the selection is a closed enum rather than a trait object. Each variant
//! implements [`StoreBackend`]; [`Backend`] forwards every operation to the active one.

use async_trait::async_trait;

use storra_core::{
    backend::{DocumentStream, StoreBackend, StoreBackendBuilder},
    document::Document,
    error::StorraResult,
};
use storra_embedded::{EmbeddedStore, EmbeddedStoreBuilder};
use storra_mongodb::{MongoDbStore, MongoDbStoreBuilder};

use crate::config::{BackendKind, StorraConfig};

#[derive(Debug)]
pub enum Backend {
    /// File-backed store under a local data directory.
    Embedded(EmbeddedStore),
    /// Remote MongoDB database.
    Networked(MongoDbStore),
}

impl Backend {
    /// Builds the backend named by `config.backend`.
    ///
    /// Neither backend touches the network here; the MongoDB backend connects on first use.
    pub async fn from_config(config: &StorraConfig) -> StorraResult<Self> {
        Ok(match config.backend {
            BackendKind::Embedded => Backend::Embedded(
                EmbeddedStoreBuilder::from_config(&config.embedded).build().await?,
            ),
            BackendKind::Mongodb => Backend::Networked(
                MongoDbStoreBuilder::new(&config.mongodb).build().await?,
            ),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Embedded(_) => BackendKind::Embedded,
            Backend::Networked(_) => BackendKind::Mongodb,
        }
    }
}

#[async_trait]
impl StoreBackend for Backend {
    async fn check_available(&self) -> StorraResult<()> {
        match self {
            Backend::Embedded(store) => store.check_available().await,
            Backend::Networked(store) => store.check_available().await,
        }
    }

    async fn list(&self, collection: &str) -> StorraResult<DocumentStream> {
        match self {
            Backend::Embedded(store) => store.list(collection).await,
            Backend::Networked(store) => store.list(collection).await,
        }
    }

    async fn read(&self, collection: &str, key: &str) -> StorraResult<Document> {
        match self {
            Backend::Embedded(store) => store.read(collection, key).await,
            Backend::Networked(store) => store.read(collection, key).await,
        }
    }

    async fn create(&self, collection: &str, document: Document) -> StorraResult<String> {
        match self {
            Backend::Embedded(store) => store.create(collection, document).await,
            Backend::Networked(store) => store.create(collection, document).await,
        }
    }

    async fn update(&self, collection: &str, key: &str, document: Document) -> StorraResult<()> {
        match self {
            Backend::Embedded(store) => store.update(collection, key, document).await,
            Backend::Networked(store) => store.update(collection, key, document).await,
        }
    }

    async fn remove(&self, collection: &str, key: &str) -> StorraResult<()> {
        match self {
            Backend::Embedded(store) => store.remove(collection, key).await,
            Backend::Networked(store) => store.remove(collection, key).await,
        }
    }

    async fn remove_collection(&self, collection: &str) -> StorraResult<()> {
        match self {
            Backend::Embedded(store) => store.remove_collection(collection).await,
            Backend::Networked(store) => store.remove_collection(collection).await,
        }
    }

    async fn close_connection(&self) -> StorraResult<()> {
        match self {
            Backend::Embedded(store) => store.close_connection().await,
            Backend::Networked(store) => store.close_connection().await,
        }
    }
}
