//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::remote::{BatchWrite, ChangeStream, RemoteStore, StoredDocument, LAST_UPDATED_FIELD};
use profilesync_common::{timestamp, Document, Error, RecordId, Result};

type Collections = HashMap<String, HashMap<RecordId, StoredDocument>>;

#[derive(Debug, Clone)]
enum Event {
    Changed {
        collection: String,
        id: RecordId,
        doc: Option<StoredDocument>,
    },
    Broken {
        collection: String,
        id: RecordId,
        message: String,
    },
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    reject_writes: bool,
    reject_commits: bool,
    fail_next_commits: usize,
    read_delay: Option<Duration>,
    bulk_delay: Option<Duration>,
}

/// In-memory remote document store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop. Faults can be injected to simulate an unreachable server,
/// rejected commits, slow reads, hung pulls and commits, a lagging read
/// replica, or broken subscriptions.
pub struct MemoryRemoteStore {
    collections: RwLock<Collections>,
    /// Documents a lagging replica still reports from `list_all`.
    stale: RwLock<Collections>,
    faults: RwLock<Faults>,
    events: broadcast::Sender<Event>,
    commit_attempts: AtomicUsize,
    commits: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl MemoryRemoteStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            collections: RwLock::new(HashMap::new()),
            stale: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            events,
            commit_attempts: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    fn read_docs(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| Error::Remote("memory store lock poisoned".to_string()))
    }

    fn write_docs(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.collections
            .write()
            .map_err(|_| Error::Remote("memory store lock poisoned".to_string()))
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut Faults) -> T) -> T {
        match self.faults.write() {
            Ok(mut faults) => f(&mut faults),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.with_faults(|f| f.unavailable) {
            debug!("Memory remote store: request refused, store unavailable");
            return Err(Error::Network("remote store unreachable".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_available()?;
        if self.with_faults(|f| f.reject_writes) {
            debug!("Memory remote store: write rejected");
            return Err(Error::Remote("write rejected: permission denied".to_string()));
        }
        Ok(())
    }

    /// Simulate losing (or regaining) the connection to the server.
    pub fn set_available(&self, available: bool) {
        self.with_faults(|f| f.unavailable = !available);
    }

    /// Reject single-document writes and deletes.
    pub fn set_reject_writes(&self, reject: bool) {
        self.with_faults(|f| f.reject_writes = reject);
    }

    /// Reject every batched commit until turned off.
    pub fn set_reject_commits(&self, reject: bool) {
        self.with_faults(|f| f.reject_commits = reject);
    }

    /// Reject the next `count` batched commits.
    pub fn fail_next_commits(&self, count: usize) {
        self.with_faults(|f| f.fail_next_commits = count);
    }

    /// Delay single-document reads.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.with_faults(|f| f.read_delay = delay);
    }

    /// Delay `list_all` and `batch_write`.
    pub fn set_bulk_delay(&self, delay: Option<Duration>) {
        self.with_faults(|f| f.bulk_delay = delay);
    }

    async fn bulk_pause(&self) {
        if let Some(delay) = self.with_faults(|f| f.bulk_delay) {
            tokio::time::sleep(delay).await;
        }
    }

    /// Make `list_all` keep reporting `doc` even after it is deleted.
    pub fn inject_stale(&self, collection: &str, doc: StoredDocument) {
        if let Ok(mut stale) = self.stale.write() {
            stale
                .entry(collection.to_string())
                .or_default()
                .insert(doc.id.clone(), doc);
        }
    }

    /// Break every live subscription to one document.
    pub fn break_subscriptions(&self, collection: &str, id: &RecordId, message: &str) {
        let _ = self.events.send(Event::Broken {
            collection: collection.to_string(),
            id: id.clone(),
            message: message.to_string(),
        });
    }

    /// Number of batched commits attempted.
    pub fn commit_attempts(&self) -> usize {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    /// Number of batched commits applied.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of subscriptions opened so far.
    pub fn subscriptions_opened(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Read a document directly, ignoring injected faults.
    pub fn peek(&self, collection: &str, id: &RecordId) -> Option<StoredDocument> {
        self.read_docs()
            .ok()
            .and_then(|docs| docs.get(collection).and_then(|c| c.get(id)).cloned())
    }

    /// Number of documents in a collection, ignoring injected faults.
    pub fn len(&self, collection: &str) -> usize {
        self.read_docs()
            .map(|docs| docs.get(collection).map(HashMap::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Whether a collection is empty.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn apply_set(
        docs: &mut Collections,
        collection: &str,
        id: &RecordId,
        fields: Document,
        merge: bool,
    ) -> StoredDocument {
        let now = Utc::now();
        let coll = docs.entry(collection.to_string()).or_default();
        let mut merged = match (merge, coll.get(id)) {
            (true, Some(existing)) => existing.fields.clone(),
            _ => Document::new(),
        };
        merged.extend(fields);
        merged.insert(LAST_UPDATED_FIELD.to_string(), timestamp::to_value(&now));

        let doc = StoredDocument {
            id: id.clone(),
            fields: merged,
            last_updated: now,
        };
        coll.insert(id.clone(), doc.clone());
        doc
    }

    fn notify(&self, collection: &str, id: &RecordId, doc: Option<StoredDocument>) {
        let _ = self.events.send(Event::Changed {
            collection: collection.to_string(),
            id: id.clone(),
            doc,
        });
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<StoredDocument>> {
        if let Some(delay) = self.with_faults(|f| f.read_delay) {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        Ok(self.peek(collection, id))
    }

    async fn set(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Document,
        merge: bool,
    ) -> Result<StoredDocument> {
        self.check_writable()?;
        let doc = {
            let mut docs = self.write_docs()?;
            Self::apply_set(&mut docs, collection, id, fields, merge)
        };
        self.notify(collection, id, Some(doc.clone()));
        Ok(doc)
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<()> {
        self.check_writable()?;
        {
            let mut docs = self.write_docs()?;
            if let Some(coll) = docs.get_mut(collection) {
                coll.remove(id);
            }
        }
        self.notify(collection, id, None);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>> {
        self.check_available()?;
        let docs = self.read_docs()?;
        Ok(docs
            .get(collection)
            .map(|coll| {
                coll.values()
                    .filter(|doc| doc.fields.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_all(&self, collection: &str) -> Result<Vec<StoredDocument>> {
        self.bulk_pause().await;
        self.check_available()?;
        let mut result: HashMap<RecordId, StoredDocument> = self
            .read_docs()?
            .get(collection)
            .cloned()
            .unwrap_or_default();

        if let Ok(stale) = self.stale.read() {
            if let Some(coll) = stale.get(collection) {
                for (id, doc) in coll {
                    result.entry(id.clone()).or_insert_with(|| doc.clone());
                }
            }
        }

        let mut docs: Vec<StoredDocument> = result.into_values().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn batch_write(&self, collection: &str, writes: Vec<BatchWrite>) -> Result<()> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        self.bulk_pause().await;
        self.check_available()?;

        let rejected = self.with_faults(|f| {
            if f.fail_next_commits > 0 {
                f.fail_next_commits -= 1;
                true
            } else {
                f.reject_commits
            }
        });
        if rejected {
            debug!("Memory remote store: commit of {} write(s) rejected", writes.len());
            return Err(Error::Commit("batch rejected by server".to_string()));
        }

        let mut changes = Vec::with_capacity(writes.len());
        {
            let mut docs = self.write_docs()?;
            for write in writes {
                match write {
                    BatchWrite::Set { id, fields } => {
                        let doc = Self::apply_set(&mut docs, collection, &id, fields, true);
                        changes.push((id, Some(doc)));
                    }
                    BatchWrite::Delete { id } => {
                        if let Some(coll) = docs.get_mut(collection) {
                            coll.remove(&id);
                        }
                        changes.push((id, None));
                    }
                }
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        for (id, doc) in changes {
            self.notify(collection, &id, doc);
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &str, id: &RecordId) -> Result<ChangeStream> {
        self.check_available()?;
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        // Subscribe before reading the snapshot so no change slips between them.
        let rx = self.events.subscribe();
        let initial = self.peek(collection, id);

        let updates = stream::unfold(
            (rx, collection.to_string(), id.clone()),
            |(mut rx, collection, id)| async move {
                loop {
                    match rx.recv().await {
                        Ok(Event::Changed {
                            collection: c,
                            id: i,
                            doc,
                        }) if c == collection && i == id => {
                            return Some((Ok(doc), (rx, collection, id)));
                        }
                        Ok(Event::Broken {
                            collection: c,
                            id: i,
                            message,
                        }) if c == collection && i == id => {
                            return Some((Err(Error::Network(message)), (rx, collection, id)));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream::once(async move { Ok(initial) }).chain(updates)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USERS: &str = "users";

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryRemoteStore::new();
        store
            .set(USERS, &id("u1"), doc(&[("email", json!("a@b.com"))]), true)
            .await
            .unwrap();

        let got = store.get(USERS, &id("u1")).await.unwrap().unwrap();
        assert_eq!(got.fields.get("email"), Some(&json!("a@b.com")));
        assert!(got.fields.contains_key(LAST_UPDATED_FIELD));
    }

    #[tokio::test]
    async fn test_merge_keeps_existing_fields() {
        let store = MemoryRemoteStore::new();
        store
            .set(USERS, &id("u1"), doc(&[("email", json!("a@b.com"))]), true)
            .await
            .unwrap();
        store
            .set(USERS, &id("u1"), doc(&[("name", json!("Ann"))]), true)
            .await
            .unwrap();

        let got = store.peek(USERS, &id("u1")).unwrap();
        assert_eq!(got.fields.get("email"), Some(&json!("a@b.com")));
        assert_eq!(got.fields.get("name"), Some(&json!("Ann")));
    }

    #[tokio::test]
    async fn test_replace_without_merge() {
        let store = MemoryRemoteStore::new();
        store
            .set(USERS, &id("u1"), doc(&[("email", json!("a@b.com"))]), true)
            .await
            .unwrap();
        store
            .set(USERS, &id("u1"), doc(&[("name", json!("Ann"))]), false)
            .await
            .unwrap();

        let got = store.peek(USERS, &id("u1")).unwrap();
        assert!(got.fields.get("email").is_none());
    }

    #[tokio::test]
    async fn test_query_and_list() {
        let store = MemoryRemoteStore::new();
        store
            .set(USERS, &id("u1"), doc(&[("email", json!("a@b.com"))]), true)
            .await
            .unwrap();
        store
            .set(USERS, &id("u2"), doc(&[("email", json!("c@d.com"))]), true)
            .await
            .unwrap();

        let hits = store.query(USERS, "email", &json!("c@d.com")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id("u2"));

        assert_eq!(store.list_all(USERS).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryRemoteStore::new();
        store.set_available(false);

        let err = store.get(USERS, &id("u1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.list_all(USERS).await.is_err());
        assert!(store.subscribe(USERS, &id("u1")).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_is_atomic_on_rejection() {
        let store = MemoryRemoteStore::new();
        store.fail_next_commits(1);

        let writes = vec![BatchWrite::Set {
            id: id("u1"),
            fields: doc(&[("email", json!("a@b.com"))]),
        }];
        assert!(store.batch_write(USERS, writes.clone()).await.is_err());
        assert!(store.is_empty(USERS));

        store.batch_write(USERS, writes).await.unwrap();
        assert_eq!(store.len(USERS), 1);
        assert_eq!(store.commit_attempts(), 2);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_stale_replica() {
        let store = MemoryRemoteStore::new();
        let written = store
            .set(USERS, &id("u2"), doc(&[("email", json!("x@y.com"))]), true)
            .await
            .unwrap();
        store.inject_stale(USERS, written);
        store.delete(USERS, &id("u2")).await.unwrap();

        assert!(store.get(USERS, &id("u2")).await.unwrap().is_none());
        assert_eq!(store.list_all(USERS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_receives_snapshot_and_changes() {
        let store = MemoryRemoteStore::new();
        let mut changes = store.subscribe(USERS, &id("u1")).await.unwrap();

        assert!(changes.next().await.unwrap().unwrap().is_none());

        store
            .set(USERS, &id("u1"), doc(&[("email", json!("a@b.com"))]), true)
            .await
            .unwrap();
        let update = changes.next().await.unwrap().unwrap().unwrap();
        assert_eq!(update.fields.get("email"), Some(&json!("a@b.com")));

        store.break_subscriptions(USERS, &id("u1"), "stream reset");
        assert!(changes.next().await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_delay_holds_pull_and_commit() {
        let store = MemoryRemoteStore::new();
        store.set_bulk_delay(Some(Duration::from_secs(30)));

        let pull = tokio::time::timeout(Duration::from_secs(10), store.list_all(USERS)).await;
        assert!(pull.is_err());
        let commit = tokio::time::timeout(
            Duration::from_secs(10),
            store.batch_write(USERS, vec![BatchWrite::Delete { id: id("u1") }]),
        )
        .await;
        assert!(commit.is_err());
        assert_eq!(store.commits(), 0);

        store.set_bulk_delay(None);
        assert!(store.list_all(USERS).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_delay() {
        let store = MemoryRemoteStore::new();
        store.set_read_delay(Some(Duration::from_secs(30)));

        let result =
            tokio::time::timeout(Duration::from_secs(10), store.get(USERS, &id("u1"))).await;
        assert!(result.is_err());
    }
}
