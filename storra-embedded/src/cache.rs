//! Cache of open collection handles.
//!
//! Opening a collection file is comparatively expensive, so the embedded store keeps
//! every handle it opens for the lifetime of the process. There is no eviction: a
//! handle leaves the cache only when its collection is removed.

use std::{collections::HashMap, fmt, sync::Arc};
use mea::rwlock::RwLock;

/// Maps a resource identifier to an open, shareable handle.
///
/// `HandleCache` is cloneable; clones share the same entries.
///
/// Callers destroying the storage behind a handle must [`remove`](HandleCache::remove) it
/// first, otherwise a later [`get`](HandleCache::get) could hand out a handle to freed
/// storage.
pub struct HandleCache<H> {
    handles: Arc<RwLock<HashMap<String, H>>>,
}

impl<H: Clone> HandleCache<H> {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the cached handle for `id`, if any.
    pub async fn get(&self, id: &str) -> Option<H> {
        self.handles
            .read()
            .await
            .get(id)
            .cloned()
    }

    /// Caches `handle` under `id`, replacing any previous entry.
    pub async fn put(&self, id: &str, handle: H) {
        self.handles
            .write()
            .await
            .insert(id.to_string(), handle);
    }

    /// Drops the cached handle for `id` and returns it.
    pub async fn remove(&self, id: &str) -> Option<H> {
        self.handles
            .write()
            .await
            .remove(id)
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }
}

impl<H: Clone> Default for HandleCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for HandleCache<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCache").finish_non_exhaustive()
    }
}

impl<H> Clone for HandleCache<H> {
    fn clone(&self) -> Self {
        Self {
            handles: Arc::clone(&self.handles),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove() {
        let cache = HandleCache::new();
        assert_eq!(cache.get("data/widgets.redb").await, None);

        cache.put("data/widgets.redb", Arc::new(7)).await;
        assert_eq!(cache.get("data/widgets.redb").await.as_deref(), Some(&7));
        assert_eq!(cache.len().await, 1);

        assert!(cache.remove("data/widgets.redb").await.is_some());
        assert_eq!(cache.get("data/widgets.redb").await, None);
        assert!(cache.remove("data/widgets.redb").await.is_none());
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = HandleCache::new();
        let other = cache.clone();

        cache.put("a", 1u8).await;
        assert_eq!(other.get("a").await, Some(1));
    }
}
