//! Realtime listener manager.
//!
//! Each watched record gets its own background task holding a live remote
//! subscription. Snapshots are written to the local cache and forwarded to
//! the watcher. A broken subscription is never fatal: the task waits a
//! fixed delay and resubscribes until it is cancelled.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use profilesync_common::{Error, Record, RecordId};
use profilesync_storage::{RemoteStore, StoredDocument};

use crate::cache::RecordCache;
use crate::ledger::DeletionLedger;
use crate::state::SyncState;
use crate::subscription::Subscription;

/// Callback receiving live updates for a watched record.
pub type RecordCallback = Arc<dyn Fn(Record) + Send + Sync>;

/// Everything a listener task needs, shared with the engine.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub remote: Arc<dyn RemoteStore>,
    pub cache: RecordCache,
    pub collection: String,
    pub reconnect_delay: Duration,
    pub state: Arc<RwLock<SyncState>>,
    pub ledger: Arc<RwLock<DeletionLedger>>,
}

struct ListenerEntry {
    generation: u64,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<String, ListenerEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, ListenerEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every live record subscription.
pub struct ListenerManager {
    ctx: ListenerContext,
    listeners: Registry,
    next_generation: AtomicU64,
}

impl ListenerManager {
    pub(crate) fn new(ctx: ListenerContext) -> Self {
        Self {
            ctx,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Bookkeeping key for a watched record.
    pub fn listener_key(id: &RecordId) -> String {
        format!("record:{}", id)
    }

    /// Watch one record.
    ///
    /// Watching an id that is already watched replaces the previous
    /// listener; the old handle's `unsubscribe` then does nothing.
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, id: RecordId, callback: RecordCallback) -> Subscription {
        let key = Self::listener_key(&id);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let replaced = lock(&self.listeners).insert(
            key.clone(),
            ListenerEntry {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = replaced {
            debug!("Replacing existing listener {}", key);
            old.cancel.cancel();
        }

        tokio::spawn(run_listener(self.ctx.clone(), id, callback, cancel.clone()));
        info!("Listening to {}", key);

        let listeners = self.listeners.clone();
        Subscription::new(move || {
            cancel.cancel();
            let mut map = lock(&listeners);
            if map.get(&key).map(|e| e.generation) == Some(generation) {
                map.remove(&key);
                debug!("Stopped listener {}", key);
            }
        })
    }

    /// Tear down every listener.
    pub fn cleanup_all(&self) -> usize {
        let drained: Vec<(String, ListenerEntry)> = lock(&self.listeners).drain().collect();
        for (key, entry) in &drained {
            entry.cancel.cancel();
            debug!("Stopped listener {}", key);
        }
        if !drained.is_empty() {
            info!("Stopped {} listener(s)", drained.len());
        }
        drained.len()
    }

    /// Keys of active listeners, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.listeners).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of active listeners.
    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Check if no listener is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        for entry in lock(&self.listeners).values() {
            entry.cancel.cancel();
        }
    }
}

impl ListenerContext {
    async fn deliver(&self, doc: StoredDocument, callback: &RecordCallback, cancel: &CancellationToken) {
        if self.ledger.read().await.was_deleted(&doc.id) {
            debug!("Ignoring live update for deleted record {}", doc.id);
            return;
        }
        let record = doc.into_record();
        if let Err(e) = self.cache.put(&record).await {
            warn!("Failed to cache live update for {}: {}", record.id(), e);
        }
        if !cancel.is_cancelled() {
            callback(record);
        }
    }

    async fn record_error(&self, id: &RecordId, error: &Error) {
        warn!(
            "Listener for {} failed: {}; reconnecting in {:?}",
            id, error, self.reconnect_delay
        );
        self.state.write().await.last_error = Some(format!("listener {}: {}", id, error));
    }
}

async fn run_listener(
    ctx: ListenerContext,
    id: RecordId,
    callback: RecordCallback,
    cancel: CancellationToken,
) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = ctx.remote.subscribe(&ctx.collection, &id) => result,
        };

        match opened {
            Ok(mut stream) => loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(Some(doc))) => ctx.deliver(doc, &callback, &cancel).await,
                    Some(Ok(None)) => debug!("Watched record {} does not exist remotely", id),
                    Some(Err(e)) => {
                        ctx.record_error(&id, &e).await;
                        break;
                    }
                    None => {
                        ctx.record_error(&id, &Error::Network("subscription closed".to_string()))
                            .await;
                        break;
                    }
                }
            },
            Err(e) => ctx.record_error(&id, &e).await,
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ctx.reconnect_delay) => {
                debug!("Resubscribing to {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profilesync_common::Document;
    use profilesync_storage::{MemoryLocalStore, MemoryRemoteStore};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const USERS: &str = "users";

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        cache: RecordCache,
        state: Arc<RwLock<SyncState>>,
        ledger: Arc<RwLock<DeletionLedger>>,
        manager: ListenerManager,
    }

    fn setup() -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = RecordCache::new(Arc::new(MemoryLocalStore::new()), "profile:");
        let state = Arc::new(RwLock::new(SyncState::new()));
        let ledger = Arc::new(RwLock::new(DeletionLedger::new()));
        let manager = ListenerManager::new(ListenerContext {
            remote: remote.clone(),
            cache: cache.clone(),
            collection: USERS.to_string(),
            reconnect_delay: Duration::from_secs(5),
            state: state.clone(),
            ledger: ledger.clone(),
        });
        Fixture {
            remote,
            cache,
            state,
            ledger,
            manager,
        }
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    fn fields(email: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("email".to_string(), json!(email));
        doc
    }

    fn channel() -> (RecordCallback, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: RecordCallback = Arc::new(move |record| {
            let _ = tx.send(record);
        });
        (callback, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Record>) -> Record {
        timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("no update received")
            .expect("channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_cached_and_forwarded() {
        let f = setup();
        f.remote.set(USERS, &id("u1"), fields("a@b.com"), true).await.unwrap();

        let (callback, mut rx) = channel();
        let _sub = f.manager.watch(id("u1"), callback);

        let first = next(&mut rx).await;
        assert_eq!(first.field("email"), Some(&json!("a@b.com")));

        f.remote.set(USERS, &id("u1"), fields("new@b.com"), true).await.unwrap();
        let second = next(&mut rx).await;
        assert_eq!(second.field("email"), Some(&json!("new@b.com")));

        let cached = f.cache.get(&id("u1")).await.unwrap().unwrap();
        assert_eq!(cached.field("email"), Some(&json!("new@b.com")));
        assert_eq!(f.manager.active_keys(), vec!["record:u1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_error() {
        let f = setup();
        f.remote.set(USERS, &id("u1"), fields("a@b.com"), true).await.unwrap();

        let (callback, mut rx) = channel();
        let _sub = f.manager.watch(id("u1"), callback);
        next(&mut rx).await;

        f.remote.break_subscriptions(USERS, &id("u1"), "stream reset");

        // The fresh subscription replays the current snapshot.
        let replayed = next(&mut rx).await;
        assert_eq!(replayed.field("email"), Some(&json!("a@b.com")));
        assert_eq!(f.remote.subscriptions_opened(), 2);
        assert!(f
            .state
            .read()
            .await
            .last_error
            .as_deref()
            .unwrap()
            .contains("stream reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let f = setup();
        f.remote.set(USERS, &id("u1"), fields("a@b.com"), true).await.unwrap();

        let (callback, mut rx) = channel();
        let sub = f.manager.watch(id("u1"), callback);
        next(&mut rx).await;

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(f.manager.is_empty());

        f.remote.set(USERS, &id("u1"), fields("late@b.com"), true).await.unwrap();
        assert!(timeout(Duration::from_secs(10), rx.recv()).await.ok().flatten().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewatch_replaces_previous_listener() {
        let f = setup();
        let (first_cb, _first_rx) = channel();
        let (second_cb, _second_rx) = channel();

        let first = f.manager.watch(id("u1"), first_cb);
        let _second = f.manager.watch(id("u1"), second_cb);
        assert_eq!(f.manager.len(), 1);

        // The stale handle must not tear down the replacement.
        first.unsubscribe();
        assert_eq!(f.manager.active_keys(), vec!["record:u1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_all() {
        let f = setup();
        let (cb, _rx) = channel();
        let sub = f.manager.watch(id("u1"), cb.clone());
        f.manager.watch(id("u2"), cb);

        assert_eq!(f.manager.cleanup_all(), 2);
        assert!(f.manager.is_empty());
        sub.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_records_are_not_resurrected() {
        let f = setup();
        f.remote.set(USERS, &id("u2"), fields("gone@b.com"), true).await.unwrap();
        f.ledger.write().await.record_deletion(id("u2"), None);

        let (callback, mut rx) = channel();
        let _sub = f.manager.watch(id("u2"), callback);

        assert!(timeout(Duration::from_secs(1), rx.recv()).await.is_err());
        assert!(f.cache.get(&id("u2")).await.unwrap().is_none());
    }
}
