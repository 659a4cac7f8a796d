//! The MongoDB-backed [`StoreBackend`].
//!
//! Each storra collection maps to one MongoDB collection of the configured database.
//! Documents are keyed by MongoDB's `ObjectId`, exposed to clients as a 24-digit hex
//! string. Every operation goes through the [`ConnectionManager`], so the first request
//! connects and the ones arriving meanwhile wait for that same attempt.

use async_trait::async_trait;
use futures::StreamExt;
use bson::{Bson, Document as BsonDocument, doc, oid::ObjectId, de::deserialize_from_bson, ser::serialize_to_bson};
use mongodb::{
    Client, Collection as MongoCollection,
    error::{Error as MongoError, ErrorKind},
    options::ClientOptions,
};
use serde_json::{Map, Value};
use tracing::debug;

use storra_core::{
    backend::{end_on_first_error, DocumentStream, StoreBackend, StoreBackendBuilder},
    document::{Document, ID_FIELD},
    error::{StorraError, StorraResult},
};

use crate::{
    config::MongoDbConfig,
    connection::{ConnectionManager, Connector, RetryPolicy},
    sanitizer::ValueSanitizer,
};

/// Server error code for "ns not found".
const NAMESPACE_NOT_FOUND: i32 = 26;

/// Opens MongoDB clients and confirms them with a `ping` before handing them out.
#[derive(Debug, Clone)]
pub struct MongoConnector {
    connection_string: String,
    database: String,
}

impl MongoConnector {
    pub fn new(connection_string: &str, database: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Connection = Client;

    async fn connect(&self) -> StorraResult<Client> {
        let client = Client::with_options(
            ClientOptions::parse(&self.connection_string)
                .await
                .map_err(|e| StorraError::Initialization(e.to_string()))?,
        )
        .map_err(|e| StorraError::Initialization(e.to_string()))?;

        client
            .database(&self.database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(backend_error)?;

        Ok(client)
    }

    async fn close(&self, connection: Client) -> StorraResult<()> {
        connection.shutdown().await;

        Ok(())
    }
}

#[derive(Debug)]
pub struct MongoDbStore {
    connection: ConnectionManager<MongoConnector>,
    database: String,
}

impl MongoDbStore {
    pub fn new(connector: MongoConnector, retry: RetryPolicy) -> Self {
        let database = connector.database.clone();
        Self {
            connection: ConnectionManager::new(connector, retry),
            database,
        }
    }

    pub fn builder(config: &MongoDbConfig) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(config)
    }

    pub fn connection(&self) -> &ConnectionManager<MongoConnector> {
        &self.connection
    }

    pub async fn set_retry_parameters(&self, max_retries: u32, interval: std::time::Duration) {
        self.connection
            .set_retry_policy(RetryPolicy { max_retries, interval })
            .await;
    }

    async fn get_collection(&self, collection_name: &str) -> StorraResult<MongoCollection<BsonDocument>> {
        Ok(self.connection
            .acquire()
            .await?
            .database(&self.database)
            .collection(&ValueSanitizer::sanitize_string(collection_name)))
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn check_available(&self) -> StorraResult<()> {
        self.connection.acquire().await?;

        Ok(())
    }

    async fn list(&self, collection: &str) -> StorraResult<DocumentStream> {
        debug!(collection, "listing");
        let cursor = self.get_collection(collection)
            .await?
            .find(doc! {})
            .await
            .map_err(backend_error)?;

        Ok(end_on_first_error(cursor.map(|item| item
            .map_err(backend_error)
            .and_then(restore_document)
        )))
    }

    async fn read(&self, collection: &str, key: &str) -> StorraResult<Document> {
        debug!(collection, key, "reading");
        let id = parse_key(collection, key)?;

        self.get_collection(collection)
            .await?
            .find_one(doc! { "_id": id })
            .await
            .map_err(backend_error)?
            .map(restore_document)
            .unwrap_or_else(|| Err(StorraError::document_not_found(collection, key)))
    }

    async fn create(&self, collection: &str, document: Document) -> StorraResult<String> {
        debug!(collection, "creating document");
        let result = self.get_collection(collection)
            .await?
            .insert_one(prepare_document(document)?)
            .await
            .map_err(backend_error)?;

        match result.inserted_id {
            Bson::ObjectId(id) => Ok(id.to_hex()),
            other => Err(StorraError::Backend(format!("unexpected identifier type: {other}"))),
        }
    }

    async fn update(&self, collection: &str, key: &str, document: Document) -> StorraResult<()> {
        debug!(collection, key, "updating document");
        let id = parse_key(collection, key)?;

        let result = self.get_collection(collection)
            .await?
            .replace_one(doc! { "_id": id }, prepare_document(document)?)
            .await
            .map_err(backend_error)?;

        update_outcome(collection, key, result.matched_count)
    }

    async fn remove(&self, collection: &str, key: &str) -> StorraResult<()> {
        debug!(collection, key, "removing document");
        let Ok(id) = parse_key(collection, key) else {
            debug!(collection, key, "key is not an ObjectId, nothing to remove");
            return Ok(());
        };

        let result = self.get_collection(collection)
            .await?
            .delete_one(doc! { "_id": id })
            .await
            .map_err(backend_error)?;
        debug!(deleted = result.deleted_count, "removed documents");

        Ok(())
    }

    async fn remove_collection(&self, collection: &str) -> StorraResult<()> {
        debug!(collection, "removing collection");
        match self.get_collection(collection).await?.drop().await {
            Ok(()) => Ok(()),
            Err(err) if is_namespace_not_found(&err) => {
                debug!(collection, "ignoring 'ns not found' while removing collection");
                Ok(())
            }
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn close_connection(&self) -> StorraResult<()> {
        debug!("closing connection to MongoDB");
        self.connection.close().await
    }
}

pub struct MongoDbStoreBuilder {
    connection_string: String,
    database: String,
    retry: RetryPolicy,
}

impl MongoDbStoreBuilder {
    pub fn new(config: &MongoDbConfig) -> Self {
        Self {
            connection_string: config.connection_string(),
            database: config.database.clone(),
            retry: config.retry_policy(),
        }
    }

    pub fn connection_string(mut self, connection_string: &str) -> Self {
        self.connection_string = connection_string.to_string();
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    /// Builds the store without connecting; the first operation connects.
    async fn build(self) -> StorraResult<Self::Backend> {
        ClientOptions::parse(&self.connection_string)
            .await
            .map_err(|e| StorraError::Initialization(e.to_string()))?;

        Ok(MongoDbStore::new(
            MongoConnector::new(&self.connection_string, &self.database),
            self.retry,
        ))
    }
}

/// A key that is not a valid ObjectId cannot name a stored document.
fn parse_key(collection: &str, key: &str) -> StorraResult<ObjectId> {
    ObjectId::parse_str(key).map_err(|_| StorraError::document_not_found(collection, key))
}

fn prepare_document(document: Document) -> StorraResult<BsonDocument> {
    match serialize_to_bson(&Value::from(document.without_id()))? {
        Bson::Document(doc) => Ok(ValueSanitizer::sanitize_keys(doc)),
        other => Err(StorraError::InvalidDocument(format!("expected a document, got {other}"))),
    }
}

fn restore_document(mut document: BsonDocument) -> StorraResult<Document> {
    let id = match document.remove(ID_FIELD) {
        Some(Bson::ObjectId(id)) => Some(id.to_hex()),
        Some(Bson::String(id)) => Some(id),
        Some(other) => Some(other.to_string()),
        None => None,
    };

    let fields: Map<String, Value> =
        deserialize_from_bson(Bson::Document(ValueSanitizer::restore_keys(document)))?;
    let restored = Document::from(fields);

    Ok(match id {
        Some(id) => restored.with_id(id),
        None => restored,
    })
}

/// A replace must hit exactly the one document its key names.
fn update_outcome(collection: &str, key: &str, matched: u64) -> StorraResult<()> {
    match matched {
        0 => Err(StorraError::document_not_found(collection, key)),
        1 => Ok(()),
        n => Err(StorraError::FatalInvariant(format!(
            "an update of {collection}/{key} matched {n} documents instead of one"
        ))),
    }
}

fn is_namespace_not_found(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => namespace_missing(command.code, &command.message),
        _ => false,
    }
}

fn namespace_missing(code: i32, message: &str) -> bool {
    code == NAMESPACE_NOT_FOUND || message == "ns not found"
}

fn backend_error(err: MongoError) -> StorraError {
    StorraError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_key_is_not_found() {
        let err = parse_key("widgets", "abc123").unwrap_err();
        assert_eq!(err.status_code(), 404);

        assert!(parse_key("widgets", "65f1c0ffee0000000000beef").is_ok());
    }

    #[test]
    fn prepared_documents_drop_caller_identity() {
        let document = Document::from_json(json!({ "_id": "mine", "a": 1, "b.c": "x" })).unwrap();

        let prepared = prepare_document(document).unwrap();

        assert!(!prepared.contains_key("_id"));
        assert_eq!(prepared.get("b%2Ec"), Some(&Bson::String("x".into())));
    }

    #[test]
    fn lookalike_keys_are_not_merged() {
        let document = Document::from_json(json!({ "a__dot__b": 1, "a.b": 2, "a%2Eb": 3 })).unwrap();

        let restored = restore_document(prepare_document(document.clone()).unwrap()).unwrap();

        assert_eq!(restored, document);
    }

    #[test]
    fn update_matches_exactly_one() {
        assert!(update_outcome("widgets", "k1", 1).is_ok());

        let missing = update_outcome("widgets", "k1", 0).unwrap_err();
        assert!(matches!(missing, StorraError::NotFound(_)));
        assert_eq!(missing.status_code(), 404);

        let duplicated = update_outcome("widgets", "k1", 2).unwrap_err();
        assert!(matches!(duplicated, StorraError::FatalInvariant(_)));
        assert_eq!(duplicated.status_code(), 500);
    }

    #[test]
    fn missing_namespace_is_recognized() {
        assert!(namespace_missing(NAMESPACE_NOT_FOUND, "anything"));
        assert!(namespace_missing(0, "ns not found"));
        assert!(!namespace_missing(13, "not authorized"));

        assert!(!is_namespace_not_found(&MongoError::custom("boom")));
    }

    #[tokio::test]
    async fn removing_malformed_key_succeeds_without_connecting() {
        let config = MongoDbConfig { port: 1, ..MongoDbConfig::default() };
        let store = MongoDbStore::builder(&config).build().await.unwrap();

        store.remove("widgets", "not-an-object-id").await.unwrap();

        assert_eq!(
            store.connection().state().await,
            crate::connection::ConnectionState::Disconnected
        );
        assert!(matches!(
            store.read("widgets", "not-an-object-id").await,
            Err(StorraError::NotFound(_))
        ));
    }

    #[test]
    fn restored_documents_expose_hex_identity() {
        let id = ObjectId::new();
        let stored = doc! { "_id": id, "a": 1_i64, "$weird": { "x.y": true } };

        let restored = restore_document(stored).unwrap();

        assert_eq!(
            Value::from(restored),
            json!({ "_id": id.to_hex(), "a": 1, "$weird": { "x.y": true } })
        );
    }

    #[tokio::test]
    async fn builder_does_not_connect() {
        let config = MongoDbConfig { port: 1, ..MongoDbConfig::default() };

        let store = MongoDbStore::builder(&config).build().await.unwrap();

        assert_eq!(
            store.connection().state().await,
            crate::connection::ConnectionState::Disconnected
        );
        store.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_connection_string_fails_to_build() {
        let result = MongoDbStore::builder(&MongoDbConfig::default())
            .connection_string("not-a-uri")
            .build()
            .await;

        assert!(matches!(result, Err(StorraError::Initialization(_))));
    }
}
