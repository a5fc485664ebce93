//! Local record cache.
//!
//! Records live in the local key-value store under `{prefix}{id}` as JSON
//! field maps. Sync metadata (the pending queue, the deletion ledger) lives
//! in the same store under keys outside the prefix.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use profilesync_common::{Document, Record, RecordId, Result};
use profilesync_storage::LocalStore;

/// Typed view over the local store.
#[derive(Clone)]
pub struct RecordCache {
    store: Arc<dyn LocalStore>,
    prefix: String,
}

impl RecordCache {
    /// Create a cache with the given key prefix.
    pub fn new(store: Arc<dyn LocalStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn key(&self, id: &RecordId) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Read a cached record.
    ///
    /// A corrupt entry is removed and reported as absent.
    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let key = self.key(id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Document>(&raw) {
            Ok(fields) => Ok(Some(Record::from_document(id.clone(), fields))),
            Err(e) => {
                warn!("Discarding corrupt cache entry {}: {}", key, e);
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Write a record, replacing any cached copy.
    pub async fn put(&self, record: &Record) -> Result<()> {
        let raw = serde_json::to_string(record.fields())?;
        self.store.set(&self.key(record.id()), raw).await
    }

    /// Remove a cached record.
    pub async fn remove(&self, id: &RecordId) -> Result<()> {
        self.store.delete(&self.key(id)).await
    }

    /// Every cached record, ordered by id. Corrupt entries are skipped.
    pub async fn scan(&self) -> Result<Vec<Record>> {
        let keys = self.store.list_keys(&self.prefix).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(id) = key
                .strip_prefix(&self.prefix)
                .and_then(|s| RecordId::new(s).ok())
            else {
                warn!("Skipping cache key with malformed id: {}", key);
                continue;
            };
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Document>(&raw) {
                Ok(fields) => records.push(Record::from_document(id, fields)),
                Err(e) => warn!("Skipping corrupt cache entry {}: {}", key, e),
            }
        }

        Ok(records)
    }

    /// Load a metadata value. A missing or unreadable value yields `None`.
    pub async fn load_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring unreadable metadata {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Store a metadata value.
    pub async fn store_meta<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profilesync_storage::MemoryLocalStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryLocalStore>, RecordCache) {
        let store = Arc::new(MemoryLocalStore::new());
        let cache = RecordCache::new(store.clone(), "profile:");
        (store, cache)
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (_, cache) = setup();
        let record = Record::new(id("u1")).with_field("email", "a@b.com");

        cache.put(&record).await.unwrap();
        assert_eq!(cache.get(&id("u1")).await.unwrap(), Some(record));

        cache.remove(&id("u1")).await.unwrap();
        assert!(cache.get(&id("u1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_discarded() {
        let (store, cache) = setup();
        store.set("profile:u1", "{broken".to_string()).await.unwrap();

        assert!(cache.get(&id("u1")).await.unwrap().is_none());
        assert!(store.get("profile:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_ignores_metadata_and_corrupt_entries() {
        let (store, cache) = setup();
        cache.put(&Record::new(id("u2"))).await.unwrap();
        cache.put(&Record::new(id("u1"))).await.unwrap();
        store.set("profile:u3", "not json".to_string()).await.unwrap();
        cache.store_meta("sync:pending_queue", &json!([])).await.unwrap();

        let ids: Vec<String> = cache
            .scan()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_meta_roundtrip_and_unreadable() {
        let (store, cache) = setup();
        cache.store_meta("sync:meta", &vec![1, 2, 3]).await.unwrap();
        let loaded: Option<Vec<u32>> = cache.load_meta("sync:meta").await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        store.set("sync:meta", "][".to_string()).await.unwrap();
        let loaded: Option<Vec<u32>> = cache.load_meta("sync:meta").await.unwrap();
        assert!(loaded.is_none());
    }
}
