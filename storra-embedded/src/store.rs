//! File-backed storage implementation.
//!
//! Each collection lives in its own [redb](https://docs.rs/redb) database file under the
//! store's data directory. redb is synchronous, so every file access runs on tokio's
//! blocking pool and the async API never stalls a runtime worker.

use std::{fmt, path::{Path, PathBuf}, sync::Arc};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use mea::mutex::Mutex;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use storra_core::{
    backend::{end_on_first_error, DocumentStream, StoreBackend, StoreBackendBuilder},
    document::Document,
    error::{StorraError, StorraResult},
};

use crate::cache::HandleCache;

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const FILE_EXTENSION: &str = "redb";
const LIST_BUFFER: usize = 64;

/// Whether opening a collection may create its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Create,
    Existing,
}

/// Configuration for the embedded store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    /// Directory holding one database file per collection.
    pub data_dir: PathBuf,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Embedded, file-backed document storage backend.
///
/// Collection files are opened lazily and their handles kept in a [`HandleCache`], so
/// every collection is opened at most once per store. Reads against a collection that
/// has no file yet never create one; only [`create`](StoreBackend::create) does.
///
/// `EmbeddedStore` is cloneable; clones share the same cache and data directory.
///
/// # Example
///
/// ```ignore
/// use storra_embedded::EmbeddedStore;
/// use storra_core::backend::{StoreBackend, StoreBackendBuilder};
///
/// let store = EmbeddedStore::builder("data").build().await?;
/// let key = store.create("widgets", Document::from_json(json!({ "a": 1 }))?).await?;
/// ```
#[derive(Clone)]
pub struct EmbeddedStore {
    data_dir: PathBuf,
    handles: HandleCache<Arc<Database>>,
    /// Serializes opening and deleting collection files.
    file_lock: Arc<Mutex<()>>,
}

impl EmbeddedStore {
    /// Creates a store rooted at `data_dir`. The directory must already exist.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            handles: HandleCache::new(),
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Creates a builder that prepares the data directory before handing out the store.
    pub fn builder(data_dir: impl Into<PathBuf>) -> EmbeddedStoreBuilder {
        EmbeddedStoreBuilder::new(data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the path of the file backing `collection`.
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(collection_file_name(collection))
    }

    async fn open_collection(&self, collection: &str, mode: OpenMode) -> StorraResult<Option<Arc<Database>>> {
        let path = self.collection_path(collection);
        let id = path.to_string_lossy().into_owned();

        if let Some(db) = self.handles.get(&id).await {
            debug!(collection, "accessing collection via cached handle");
            return Ok(Some(db));
        }

        let _guard = self.file_lock.lock().await;

        // Another task may have opened it while we waited.
        if let Some(db) = self.handles.get(&id).await {
            return Ok(Some(db));
        }

        if mode == OpenMode::Existing && !tokio::fs::try_exists(&path).await.map_err(io_error)? {
            debug!(collection, "collection has no file yet");
            return Ok(None);
        }

        let db = Arc::new(blocking(move || Database::create(&path).map_err(redb_error)).await?);
        debug!(collection, "collection file created/loaded");
        self.handles.put(&id, Arc::clone(&db)).await;

        Ok(Some(db))
    }
}

impl fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedStore")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreBackend for EmbeddedStore {
    async fn check_available(&self) -> StorraResult<()> {
        Ok(())
    }

    async fn list(&self, collection: &str) -> StorraResult<DocumentStream> {
        debug!(collection, "listing");
        let Some(db) = self.open_collection(collection, OpenMode::Existing).await? else {
            return Ok(stream::empty().boxed());
        };

        let (tx, rx) = mpsc::channel(LIST_BUFFER);
        let name = collection.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = scan_documents(&db, &name, &tx) {
                let _ = tx.blocking_send(Err(err));
            }
        });

        Ok(end_on_first_error(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn read(&self, collection: &str, key: &str) -> StorraResult<Document> {
        debug!(collection, key, "reading");
        let Some(db) = self.open_collection(collection, OpenMode::Existing).await? else {
            return Err(StorraError::document_not_found(collection, key));
        };

        let owned_key = key.to_string();
        let stored = blocking(move || {
            let txn = db.begin_read().map_err(redb_error)?;
            let table = match txn.open_table(DOCUMENTS) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(err) => return Err(redb_error(err)),
            };
            let value = table.get(owned_key.as_str()).map_err(redb_error)?;
            match value {
                Some(guard) => decode_stored(guard.value()),
                None => Ok(None),
            }
        })
        .await?;

        stored
            .map(|doc| doc.with_id(key))
            .ok_or_else(|| StorraError::document_not_found(collection, key))
    }

    async fn create(&self, collection: &str, document: Document) -> StorraResult<String> {
        debug!(collection, "creating document");
        let db = self
            .open_collection(collection, OpenMode::Create)
            .await?
            .ok_or_else(|| StorraError::Backend(format!("could not open collection {collection}")))?;

        let key = Uuid::now_v7().to_string();
        let bytes = document.without_id().to_vec()?;
        let owned_key = key.clone();
        blocking(move || {
            let txn = db.begin_write().map_err(redb_error)?;
            {
                let mut table = txn.open_table(DOCUMENTS).map_err(redb_error)?;
                table.insert(owned_key.as_str(), bytes.as_slice()).map_err(redb_error)?;
            }
            txn.commit().map_err(redb_error)
        })
        .await?;

        Ok(key)
    }

    async fn update(&self, collection: &str, key: &str, document: Document) -> StorraResult<()> {
        debug!(collection, key, "updating document");
        let Some(db) = self.open_collection(collection, OpenMode::Existing).await? else {
            return Err(StorraError::document_not_found(collection, key));
        };

        let bytes = document.without_id().to_vec()?;
        let owned_key = key.to_string();
        let updated = blocking(move || {
            let txn = db.begin_write().map_err(redb_error)?;
            let updated = {
                let mut table = txn.open_table(DOCUMENTS).map_err(redb_error)?;
                let exists = table.get(owned_key.as_str()).map_err(redb_error)?.is_some();
                if exists {
                    table.insert(owned_key.as_str(), bytes.as_slice()).map_err(redb_error)?;
                }
                exists
            };
            if updated {
                txn.commit().map_err(redb_error)?;
            } else {
                txn.abort().map_err(redb_error)?;
            }
            Ok(updated)
        })
        .await?;

        if updated {
            Ok(())
        } else {
            Err(StorraError::document_not_found(collection, key))
        }
    }

    async fn remove(&self, collection: &str, key: &str) -> StorraResult<()> {
        debug!(collection, key, "removing document");
        let Some(db) = self.open_collection(collection, OpenMode::Existing).await? else {
            return Ok(());
        };

        let owned_key = key.to_string();
        blocking(move || {
            let txn = db.begin_write().map_err(redb_error)?;
            {
                let mut table = txn.open_table(DOCUMENTS).map_err(redb_error)?;
                table.remove(owned_key.as_str()).map_err(redb_error)?;
            }
            txn.commit().map_err(redb_error)
        })
        .await
    }

    async fn remove_collection(&self, collection: &str) -> StorraResult<()> {
        debug!(collection, "removing collection");
        let path = self.collection_path(collection);
        let id = path.to_string_lossy().into_owned();

        let _guard = self.file_lock.lock().await;
        self.handles.remove(&id).await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "collection file does not exist, nothing to remove");
                Ok(())
            }
            Err(err) => Err(io_error(err)),
        }
    }

    async fn close_connection(&self) -> StorraResult<()> {
        debug!("close_connection has no effect on the embedded store");
        Ok(())
    }
}

/// Builder for [`EmbeddedStore`]; creates the data directory if it is missing.
#[derive(Debug, Clone)]
pub struct EmbeddedStoreBuilder {
    data_dir: PathBuf,
}

impl EmbeddedStoreBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn from_config(config: &EmbeddedConfig) -> Self {
        Self::new(config.data_dir.clone())
    }
}

#[async_trait]
impl StoreBackendBuilder for EmbeddedStoreBuilder {
    type Backend = EmbeddedStore;

    async fn build(self) -> StorraResult<Self::Backend> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StorraError::Initialization(format!("{}: {e}", self.data_dir.display())))?;

        Ok(EmbeddedStore::new(self.data_dir))
    }
}

/// Maps a collection name to a file name that is safe as a single path component.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte is written as `%XX`.
/// The mapping is injective, so distinct collections never share a file.
pub fn collection_file_name(collection: &str) -> String {
    let mut name = String::with_capacity(collection.len() + FILE_EXTENSION.len() + 1);
    for byte in collection.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => name.push(byte as char),
            _ => name.push_str(&format!("%{byte:02X}")),
        }
    }
    name.push('.');
    name.push_str(FILE_EXTENSION);
    name
}

fn scan_documents(
    db: &Database,
    collection: &str,
    tx: &mpsc::Sender<StorraResult<Document>>,
) -> StorraResult<()> {
    let txn = db.begin_read().map_err(redb_error)?;
    let table = match txn.open_table(DOCUMENTS) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(()),
        Err(err) => return Err(redb_error(err)),
    };

    for entry in table.iter().map_err(redb_error)? {
        let (key, value) = entry.map_err(redb_error)?;
        let Some(doc) = decode_stored(value.value())? else {
            warn!(collection, key = key.value(), "skipping empty document");
            continue;
        };

        if tx.blocking_send(Ok(doc.with_id(key.value()))).is_err() {
            debug!(collection, "list consumer went away, stopping scan");
            break;
        }
    }

    Ok(())
}

/// Decodes a stored value; empty values and JSON `null` decode to `None`.
fn decode_stored(bytes: &[u8]) -> StorraResult<Option<Document>> {
    if bytes.is_empty() {
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(bytes)? {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(Document::from(map))),
        _ => Err(StorraError::Serialization("stored value is not a JSON object".into())),
    }
}

async fn blocking<T, F>(f: F) -> StorraResult<T>
where
    F: FnOnce() -> StorraResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorraError::Backend(e.to_string()))?
}

fn redb_error(err: impl Into<redb::Error>) -> StorraError {
    StorraError::Backend(err.into().to_string())
}

fn io_error(err: std::io::Error) -> StorraError {
    StorraError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, EmbeddedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::builder(dir.path().join("data")).build().await.unwrap();
        (dir, store)
    }

    fn doc(value: Value) -> Document {
        Document::from_json(value).unwrap()
    }

    #[tokio::test]
    async fn create_then_read_attaches_identity() {
        let (_dir, store) = store().await;

        let key = store.create("widgets", doc(json!({ "a": 1 }))).await.unwrap();
        let read = store.read("widgets", &key).await.unwrap();

        assert_eq!(read, doc(json!({ "a": 1 })).with_id(key.as_str()));
    }

    #[tokio::test]
    async fn caller_cannot_choose_the_key() {
        let (_dir, store) = store().await;

        let key = store.create("widgets", doc(json!({ "_id": "mine", "a": 1 }))).await.unwrap();

        assert_ne!(key, "mine");
        assert!(store.read("widgets", "mine").await.is_err());
        assert_eq!(store.read("widgets", &key).await.unwrap().id(), Some(key.as_str()));
    }

    #[tokio::test]
    async fn keys_are_time_ordered() {
        let (_dir, store) = store().await;

        let first = store.create("widgets", doc(json!({}))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = store.create("widgets", doc(json!({}))).await.unwrap();

        assert!(first < second);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (_dir, store) = store().await;

        let err = store.read("widgets", "nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(!store.collection_path("widgets").exists());

        store.create("widgets", doc(json!({}))).await.unwrap();
        let err = store.read("widgets", "nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn update_replaces_wholesale() {
        let (_dir, store) = store().await;

        let key = store.create("widgets", doc(json!({ "a": 1, "b": 2 }))).await.unwrap();
        store.update("widgets", &key, doc(json!({ "c": 3 }))).await.unwrap();

        let read = store.read("widgets", &key).await.unwrap();
        assert_eq!(read, doc(json!({ "c": 3 })).with_id(key.as_str()));
    }

    #[tokio::test]
    async fn update_missing_key_leaves_collection_unchanged() {
        let (_dir, store) = store().await;

        let key = store.create("widgets", doc(json!({ "a": 1 }))).await.unwrap();
        let err = store.update("widgets", "ghost", doc(json!({ "a": 2 }))).await.unwrap_err();
        assert!(matches!(err, StorraError::NotFound(_)));

        let all: Vec<Document> = store.list("widgets").await.unwrap().try_collect().await.unwrap();
        assert_eq!(all, vec![doc(json!({ "a": 1 })).with_id(key.as_str())]);

        let err = store.update("gadgets", "ghost", doc(json!({}))).await.unwrap_err();
        assert!(matches!(err, StorraError::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, store) = store().await;

        let key = store.create("widgets", doc(json!({ "a": 1 }))).await.unwrap();
        store.remove("widgets", &key).await.unwrap();
        store.remove("widgets", &key).await.unwrap();
        store.remove("never-created", &key).await.unwrap();

        assert!(store.read("widgets", &key).await.is_err());
    }

    #[tokio::test]
    async fn list_after_creates_and_one_remove() {
        let (_dir, store) = store().await;

        let mut keys = Vec::new();
        for i in 0..5 {
            keys.push(store.create("widgets", doc(json!({ "n": i }))).await.unwrap());
        }
        store.remove("widgets", &keys[2]).await.unwrap();

        let listed: Vec<Document> = store.list("widgets").await.unwrap().try_collect().await.unwrap();
        assert_eq!(listed.len(), 4);
        for listed_doc in &listed {
            let key = listed_doc.id().unwrap();
            assert_ne!(key, keys[2]);
            assert_eq!(&store.read("widgets", key).await.unwrap(), listed_doc);
        }
    }

    #[tokio::test]
    async fn list_unknown_collection_is_empty() {
        let (_dir, store) = store().await;

        let listed: Vec<Document> = store.list("nothing").await.unwrap().try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn list_skips_empty_values() {
        let (_dir, store) = store().await;

        let key = store.create("widgets", doc(json!({ "a": 1 }))).await.unwrap();
        let db = store.open_collection("widgets", OpenMode::Existing).await.unwrap().unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(DOCUMENTS).unwrap();
            table.insert("hollow", b"".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let listed: Vec<Document> = store.list("widgets").await.unwrap().try_collect().await.unwrap();
        assert_eq!(listed, vec![doc(json!({ "a": 1 })).with_id(key.as_str())]);
    }

    #[tokio::test]
    async fn remove_collection_is_idempotent() {
        let (_dir, store) = store().await;

        store.remove_collection("widgets").await.unwrap();

        let key = store.create("widgets", doc(json!({ "a": 1 }))).await.unwrap();
        assert!(store.collection_path("widgets").exists());

        store.remove_collection("widgets").await.unwrap();
        assert!(!store.collection_path("widgets").exists());
        store.remove_collection("widgets").await.unwrap();

        assert!(store.read("widgets", &key).await.is_err());
    }

    #[tokio::test]
    async fn collection_is_recreated_after_removal() {
        let (_dir, store) = store().await;

        store.create("widgets", doc(json!({ "a": 1 }))).await.unwrap();
        store.remove_collection("widgets").await.unwrap();
        let key = store.create("widgets", doc(json!({ "b": 2 }))).await.unwrap();

        let listed: Vec<Document> = store.list("widgets").await.unwrap().try_collect().await.unwrap();
        assert_eq!(listed, vec![doc(json!({ "b": 2 })).with_id(key.as_str())]);
    }

    #[tokio::test]
    async fn concurrent_first_writes_share_one_handle() {
        let (_dir, store) = store().await;

        let writes = (0..8).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.create("widgets", doc(json!({ "n": i }))).await })
        });
        for write in futures::future::join_all(writes).await {
            write.unwrap().unwrap();
        }

        assert_eq!(store.handles.len().await, 1);
        let listed: Vec<Document> = store.list("widgets").await.unwrap().try_collect().await.unwrap();
        assert_eq!(listed.len(), 8);
    }

    #[tokio::test]
    async fn close_connection_is_a_no_op() {
        let (_dir, store) = store().await;

        store.check_available().await.unwrap();
        store.close_connection().await.unwrap();
        store.create("widgets", doc(json!({}))).await.unwrap();
    }

    #[test]
    fn file_names_are_safe_and_distinct() {
        assert_eq!(collection_file_name("widgets"), "widgets.redb");
        assert_eq!(collection_file_name(".."), "%2E%2E.redb");
        assert_eq!(collection_file_name("a/b"), "a%2Fb.redb");
        assert_ne!(collection_file_name("a%2Fb"), collection_file_name("a/b"));
    }
}
