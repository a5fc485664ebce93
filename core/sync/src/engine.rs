//! Sync orchestrator.
//!
//! [`SyncEngine`] is the only entry point the rest of the application
//! uses. Writes run in two phases:
//! 1. local durability: normalize, stamp, write the cache (and the ledger for deletes)
//! 2. remote durability: try the remote store, otherwise queue and retry later
//!
//! Reads try the remote store first and degrade to the local cache. Nothing
//! on the read or write path returns a transport error to the caller.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use profilesync_common::{timestamp, Error, Record, RecordId, Result};
use profilesync_storage::{
    remote::SYNC_VERSION_FIELD, LocalStore, ReachabilitySignal, RemoteStore, StoredDocument,
};

use crate::cache::RecordCache;
use crate::config::SyncConfig;
use crate::ledger::DeletionLedger;
use crate::listener::{ListenerContext, ListenerManager};
use crate::queue::{
    EnqueueOutcome, OperationKind, OperationOrigin, PendingOperation, PendingQueue,
};
use crate::reachability::{ConnectivityObserver, ReachabilityMonitor};
use crate::retry::RetryPolicy;
use crate::scheduler::{
    AutoRefreshScheduler, AutoRefreshStatus, DataUpdate, RefreshTarget, SchedulerPhase,
    TickOutcome,
};
use crate::state::{FailedOperation, SyncState, SyncStatus};
use crate::subscription::Subscription;

/// How a write was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// The remote store accepted the write.
    Committed,
    /// The write is durable locally and queued for the remote store.
    Queued,
}

/// Result of one queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOutcome {
    /// Operations committed.
    pub committed: usize,
    /// Malformed operations dropped before the commit.
    pub skipped: usize,
}

/// Result of a manual sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub committed: usize,
    pub skipped: usize,
    /// Records pulled from the remote store; `None` when the pull failed.
    pub pulled: Option<usize>,
    pub duration: Duration,
}

/// Operational snapshot for tooling.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub backend: String,
    pub status: SyncStatus,
    pub pending: Vec<PendingOperation>,
    pub listener_keys: Vec<String>,
    pub ledger_entries: usize,
    pub data_update_subscribers: usize,
    pub auto_refresh: AutoRefreshStatus,
}

/// Offline-first sync engine for one record collection.
///
/// Cheap to clone; clones share the same engine. Must be used from within
/// a tokio runtime.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: SyncConfig,
    actor: String,
    remote: Arc<dyn RemoteStore>,
    cache: RecordCache,
    queue: Mutex<PendingQueue>,
    ledger: Arc<RwLock<DeletionLedger>>,
    state: Arc<RwLock<SyncState>>,
    retry: RetryPolicy,
    listeners: ListenerManager,
    scheduler: AutoRefreshScheduler,
    reachability: ReachabilityMonitor,
    sync_version: AtomicU64,
    redrain_scheduled: AtomicBool,
    closed: CancellationToken,
    weak_self: Weak<EngineInner>,
}

impl SyncEngine {
    /// Open the engine.
    ///
    /// Restores the pending queue and deletion ledger from the local store,
    /// prunes ledger entries past the retention window, starts watching
    /// connectivity, and drains restored operations when online.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Local store unreadable
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        signal: Arc<dyn ReachabilitySignal>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = RecordCache::new(local, config.cache_prefix.clone());
        let operations: Vec<PendingOperation> = cache
            .load_meta(&config.queue_key)
            .await?
            .unwrap_or_default();
        let mut ledger: DeletionLedger = cache
            .load_meta(&config.ledger_key)
            .await?
            .unwrap_or_default();
        let pruned = ledger.prune_older_than(config.ledger_retention_days, Utc::now());

        let actor = config
            .actor
            .clone()
            .unwrap_or_else(|| format!("device-{}", Uuid::new_v4()));
        let state = Arc::new(RwLock::new(SyncState::default()));
        let ledger = Arc::new(RwLock::new(ledger));
        let listener_ctx = ListenerContext {
            remote: remote.clone(),
            cache: cache.clone(),
            collection: config.collection.clone(),
            reconnect_delay: config.listener_reconnect_delay,
            state: state.clone(),
            ledger: ledger.clone(),
        };
        let refresh_interval = config.auto_refresh_interval;
        let retry = RetryPolicy::from(&config);

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let target: Weak<dyn RefreshTarget> = weak.clone();
            EngineInner {
                config,
                actor,
                remote,
                cache,
                queue: Mutex::new(PendingQueue::from_operations(operations)),
                ledger,
                state,
                retry,
                listeners: ListenerManager::new(listener_ctx),
                scheduler: AutoRefreshScheduler::new(target, refresh_interval),
                reachability: ReachabilityMonitor::new(signal),
                sync_version: AtomicU64::new(0),
                redrain_scheduled: AtomicBool::new(false),
                closed: CancellationToken::new(),
                weak_self: weak.clone(),
            }
        });

        if pruned > 0 {
            info!("Pruned {} expired deletion ledger entries", pruned);
            inner.persist_ledger(&*inner.ledger.read().await).await;
        }

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let observer: Weak<dyn ConnectivityObserver> = weak;
        inner.reachability.start(observer);

        let pending = inner.queue.lock().await.len();
        info!(
            "Sync engine opened on '{}' ({}): {} pending, online = {}",
            inner.config.collection,
            inner.remote.name(),
            pending,
            inner.online()
        );

        if pending > 0 && inner.online() {
            let engine = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.drain_pending().await {
                    warn!("Initial drain failed: {}", e);
                }
            });
        }

        Ok(Self { inner })
    }

    /// Save a record (create or merge-update).
    ///
    /// Timestamp fields are repaired rather than rejected. The record is
    /// durable locally before this returns; remote delivery may be deferred.
    pub async fn save_record(&self, record: Record) -> WriteOutcome {
        let staged = self.inner.stage_save(record).await;
        self.inner.push_save(staged).await
    }

    /// Fetch a record, preferring the remote copy.
    ///
    /// Falls back to the local cache on timeout, error, or while offline.
    /// A record the remote store reports missing but the cache still holds
    /// is queued for a background push.
    pub async fn get_record(&self, id: &RecordId) -> Option<Record> {
        self.inner.read_record(id).await
    }

    /// Fetch every record.
    ///
    /// A successful remote pull refreshes the cache; otherwise the cache is
    /// scanned. Deleted records are never returned.
    pub async fn get_all_records(&self) -> Vec<Record> {
        match self.inner.pull_all().await {
            Ok(records) => records,
            Err(e) => {
                debug!("Serving all records from cache: {}", e);
                self.inner.cached_records().await
            }
        }
    }

    /// Find the first record whose `field` equals `value`.
    pub async fn get_record_by_field(&self, field: &str, value: &Value) -> Option<Record> {
        self.inner.find_by_field(field, value).await
    }

    /// Delete a record.
    ///
    /// The record disappears from the cache and is noted in the deletion
    /// ledger before this returns, whether or not the remote delete went
    /// through.
    pub async fn delete_record(&self, id: &RecordId) -> WriteOutcome {
        self.inner.delete(id).await
    }

    /// Drain the pending queue, then pull the full collection.
    ///
    /// # Errors
    /// - `Offline` when the device is offline
    /// - The commit error when the batched commit fails
    pub async fn trigger_sync(&self) -> Result<SyncReport> {
        if !self.inner.online() {
            return Err(Error::Offline);
        }
        let start = Instant::now();
        info!("Manual sync started");

        let drained = self.inner.drain_pending().await?;
        let pulled = match self.inner.pull_all().await {
            Ok(records) => Some(records.len()),
            Err(e) => {
                warn!("Pull after drain failed: {}", e);
                None
            }
        };

        let report = SyncReport {
            committed: drained.committed,
            skipped: drained.skipped,
            pulled,
            duration: start.elapsed(),
        };
        info!(
            "Manual sync finished in {:?}: {} committed, {} skipped, {:?} pulled",
            report.duration, report.committed, report.skipped, report.pulled
        );
        Ok(report)
    }

    /// Drain the pending queue without pulling.
    ///
    /// # Errors
    /// - `Offline` when the device is offline
    /// - The commit error when the batched commit fails
    pub async fn flush_pending(&self) -> Result<DrainOutcome> {
        if !self.inner.online() {
            return Err(Error::Offline);
        }
        self.inner.drain_pending().await
    }

    /// Current sync health.
    pub async fn status(&self) -> SyncStatus {
        self.inner.status().await
    }

    /// Start auto-refresh with `interval`, or the configured default.
    ///
    /// # Errors
    /// - Zero interval
    pub fn start_auto_refresh(&self, interval: Option<Duration>) -> Result<()> {
        self.inner
            .scheduler
            .start(interval.unwrap_or(self.inner.config.auto_refresh_interval))
    }

    /// Stop auto-refresh. An in-flight refresh still completes.
    pub fn stop_auto_refresh(&self) {
        self.inner.scheduler.stop();
    }

    /// Change the auto-refresh period.
    ///
    /// # Errors
    /// - Zero interval
    pub fn set_auto_refresh_interval(&self, interval: Duration) -> Result<()> {
        self.inner.scheduler.set_interval(interval)
    }

    /// Auto-refresh state.
    pub fn auto_refresh_status(&self) -> AutoRefreshStatus {
        self.inner.scheduler.status()
    }

    /// Subscribe to refresh results.
    pub fn on_data_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DataUpdate) + Send + Sync + 'static,
    {
        self.inner.scheduler.on_data_update(Arc::new(callback))
    }

    /// Run one refresh cycle now and fan it out to subscribers.
    pub async fn refresh_now(&self) -> TickOutcome {
        self.inner.scheduler.refresh_now().await
    }

    /// Watch one record for remote changes.
    pub fn watch_record<F>(&self, id: RecordId, callback: F) -> Subscription
    where
        F: Fn(Record) + Send + Sync + 'static,
    {
        self.inner.listeners.watch(id, Arc::new(callback))
    }

    /// Tear down every record watch.
    pub fn stop_all_listeners(&self) -> usize {
        self.inner.listeners.cleanup_all()
    }

    /// Queue contents, listeners, and status for operational tooling.
    pub async fn diagnostics(&self) -> Diagnostics {
        let inner = &self.inner;
        Diagnostics {
            backend: inner.remote.name().to_string(),
            status: inner.status().await,
            pending: inner.queue.lock().await.operations().to_vec(),
            listener_keys: inner.listeners.active_keys(),
            ledger_entries: inner.ledger.read().await.len(),
            data_update_subscribers: inner.scheduler.subscriber_count(),
            auto_refresh: inner.scheduler.status(),
        }
    }

    /// Operations waiting for the remote store.
    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.queue.lock().await.operations().to_vec()
    }

    /// Whether `id` is in the deletion ledger.
    pub async fn was_deleted(&self, id: &RecordId) -> bool {
        self.inner.ledger.read().await.was_deleted(id)
    }

    /// Drop deletion ledger entries older than `days`.
    pub async fn prune_deletion_ledger(&self, days: u32) -> usize {
        let mut ledger = self.inner.ledger.write().await;
        let pruned = ledger.prune_older_than(days, Utc::now());
        if pruned > 0 {
            info!("Pruned {} deletion ledger entries older than {} days", pruned, days);
            self.inner.persist_ledger(&ledger).await;
        }
        pruned
    }

    /// Operations evicted at the retry ceiling since the last call.
    pub async fn take_failed_operations(&self) -> Vec<FailedOperation> {
        self.inner.state.write().await.take_failed()
    }

    /// Forget the last error.
    pub async fn clear_last_error(&self) {
        self.inner.state.write().await.last_error = None;
    }

    /// Whether the device is online.
    pub fn is_online(&self) -> bool {
        self.inner.online()
    }

    /// Actor recorded in deletion ledger entries.
    pub fn actor(&self) -> &str {
        &self.inner.actor
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Stop auto-refresh, every listener, connectivity monitoring and
    /// pending re-drain timers. Local reads and writes keep working.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.cancel();
        inner.scheduler.stop();
        inner.listeners.cleanup_all();
        inner.reachability.stop();
        info!("Sync engine shut down");
    }
}

impl EngineInner {
    fn online(&self) -> bool {
        self.reachability.is_online()
    }

    fn next_sync_version(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut current = self.sync_version.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.sync_version.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    async fn note_failure(&self, context: &str, error: &Error) -> u32 {
        warn!("{} failed: {}", context, error);
        let mut state = self.state.write().await;
        state.record_failure(context, error);
        state.retry_count
    }

    async fn bounded<T, F>(&self, limit: Duration, what: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} after {:?}", what, limit))),
        }
    }

    async fn cache_put(&self, record: &Record) {
        if let Err(e) = self.cache.put(record).await {
            warn!("Failed to cache {}: {}", record.id(), e);
        }
    }

    async fn cached(&self, id: &RecordId) -> Option<Record> {
        match self.cache.get(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to read cached {}: {}", id, e);
                None
            }
        }
    }

    async fn cached_records(&self) -> Vec<Record> {
        let records = match self.cache.scan().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to scan cache: {}", e);
                return Vec::new();
            }
        };
        self.ledger.read().await.filter(records)
    }

    async fn persist_queue(&self, queue: &PendingQueue) {
        if let Err(e) = self
            .cache
            .store_meta(&self.config.queue_key, queue.operations())
            .await
        {
            warn!("Failed to persist pending queue: {}", e);
        }
    }

    async fn persist_ledger(&self, ledger: &DeletionLedger) {
        if let Err(e) = self.cache.store_meta(&self.config.ledger_key, ledger).await {
            warn!("Failed to persist deletion ledger: {}", e);
        }
    }

    async fn enqueue(&self, op: PendingOperation) -> EnqueueOutcome {
        let mut queue = self.queue.lock().await;
        let outcome = queue.enqueue(op);
        if outcome != EnqueueOutcome::Ignored {
            self.persist_queue(&queue).await;
        }
        outcome
    }

    async fn dequeue(&self, id: &RecordId) {
        let mut queue = self.queue.lock().await;
        if queue.remove(id).is_some() {
            debug!("Dropped pending operation for {} after direct write", id);
            self.persist_queue(&queue).await;
        }
    }

    /// Phase 1 of a save: repair timestamps, stamp the sync version, and
    /// write the cache.
    async fn stage_save(&self, record: Record) -> Record {
        let id = record.id().clone();
        let mut fields = record.into_fields();

        let repaired =
            timestamp::normalize_fields(&mut fields, &self.config.timestamp_fields, Utc::now());
        if !repaired.is_empty() {
            warn!("Replaced invalid timestamp(s) {:?} on {}", repaired, id);
        }
        fields.insert(
            SYNC_VERSION_FIELD.to_string(),
            json!(self.next_sync_version()),
        );

        let record = Record::from_document(id, fields);
        self.cache_put(&record).await;
        record
    }

    /// Phase 2 of a save: remote write, or queue on failure.
    async fn push_save(&self, record: Record) -> WriteOutcome {
        let id = record.id().clone();

        if self.online() {
            let written = self
                .remote
                .set(&self.config.collection, &id, record.fields().clone(), true)
                .await;
            match written {
                Ok(stored) => {
                    self.cache_put(&stored.into_record()).await;
                    self.dequeue(&id).await;
                    debug!("Saved {} to remote", id);
                    return WriteOutcome::Committed;
                }
                Err(e) => {
                    let retry_count = self.note_failure(&format!("save {}", id), &e).await;
                    self.enqueue(PendingOperation::upsert(
                        id.clone(),
                        record.into_fields(),
                        OperationOrigin::Caller,
                    ))
                    .await;
                    self.schedule_redrain(retry_count);
                    return WriteOutcome::Queued;
                }
            }
        }

        debug!("Offline; queued save of {}", id);
        self.enqueue(PendingOperation::upsert(
            id,
            record.into_fields(),
            OperationOrigin::Caller,
        ))
        .await;
        WriteOutcome::Queued
    }

    async fn read_record(&self, id: &RecordId) -> Option<Record> {
        let deleted = self.ledger.read().await.was_deleted(id);
        let mut remote_absent = false;

        if self.online() {
            let what = format!("get {}", id);
            match self
                .bounded(
                    self.config.remote_read_timeout,
                    &what,
                    self.remote.get(&self.config.collection, id),
                )
                .await
            {
                Ok(Some(doc)) if !deleted => {
                    let record = doc.into_record();
                    self.cache_put(&record).await;
                    return Some(record);
                }
                Ok(Some(_)) => debug!("Ignoring remote copy of deleted record {}", id),
                Ok(None) => remote_absent = true,
                Err(e) => {
                    self.note_failure(&what, &e).await;
                }
            }
        }

        let cached = self.cached(id).await;
        if let Some(record) = &cached {
            if remote_absent && !deleted {
                self.schedule_repair(record.clone());
            }
        }
        cached
    }

    async fn find_by_field(&self, field: &str, value: &Value) -> Option<Record> {
        if self.online() {
            let what = format!("query {} = {}", field, value);
            match self
                .bounded(
                    self.config.remote_read_timeout,
                    &what,
                    self.remote.query(&self.config.collection, field, value),
                )
                .await
            {
                Ok(docs) => {
                    let records: Vec<Record> =
                        docs.into_iter().map(StoredDocument::into_record).collect();
                    let mut records = self.ledger.read().await.filter(records);
                    records.sort_by(|a, b| a.id().cmp(b.id()));
                    let found = records.into_iter().next();
                    if let Some(record) = &found {
                        self.cache_put(record).await;
                    }
                    return found;
                }
                Err(e) => {
                    self.note_failure(&what, &e).await;
                }
            }
        }

        self.cached_records()
            .await
            .into_iter()
            .find(|r| r.field_equals(field, value))
    }

    async fn delete(&self, id: &RecordId) -> WriteOutcome {
        if self.online() {
            match self.remote.delete(&self.config.collection, id).await {
                Ok(()) => {
                    if let Err(e) = self.cache.remove(id).await {
                        warn!("Failed to remove cached {}: {}", id, e);
                    }
                    self.record_deletion(id).await;
                    self.dequeue(id).await;
                    info!("Deleted {}", id);
                    return WriteOutcome::Committed;
                }
                Err(e) => {
                    let retry_count = self.note_failure(&format!("delete {}", id), &e).await;
                    self.delete_locally(id).await;
                    self.schedule_redrain(retry_count);
                    return WriteOutcome::Queued;
                }
            }
        }

        debug!("Offline; queued delete of {}", id);
        self.delete_locally(id).await;
        WriteOutcome::Queued
    }

    /// Local half of a delete: ledger first, then cache, then queue.
    async fn delete_locally(&self, id: &RecordId) {
        self.record_deletion(id).await;
        if let Err(e) = self.cache.remove(id).await {
            warn!("Failed to remove cached {}: {}", id, e);
        }
        self.enqueue(PendingOperation::delete(id.clone(), OperationOrigin::Caller))
            .await;
    }

    async fn record_deletion(&self, id: &RecordId) {
        let mut ledger = self.ledger.write().await;
        ledger.record_deletion(id.clone(), Some(self.actor.clone()));
        self.persist_ledger(&ledger).await;
    }

    /// Pull the full collection, filter it through the ledger and mirror it
    /// into the cache. Records with a queued local upsert are served from
    /// the cache, including ones the remote store has not seen yet.
    async fn pull_all(&self) -> Result<Vec<Record>> {
        if !self.online() {
            return Err(Error::Offline);
        }

        self.state.write().await.begin_sync();
        let listed = self
            .bounded(
                self.config.remote_sync_timeout,
                "pull",
                self.remote.list_all(&self.config.collection),
            )
            .await;
        self.state.write().await.end_sync();

        let docs = match listed {
            Ok(docs) => docs,
            Err(e) => {
                self.note_failure("pull", &e).await;
                return Err(e);
            }
        };

        let pending: HashMap<RecordId, OperationKind> = self
            .queue
            .lock()
            .await
            .operations()
            .iter()
            .map(|op| (op.record_id.clone(), op.kind))
            .collect();
        let fetched: Vec<Record> = docs.into_iter().map(StoredDocument::into_record).collect();
        let returned: HashSet<RecordId> = fetched.iter().map(|r| r.id().clone()).collect();
        let visible = self.ledger.read().await.filter(fetched);

        let mut records = Vec::with_capacity(visible.len());
        for record in visible {
            if pending.contains_key(record.id()) {
                if let Some(local) = self.cached(record.id()).await {
                    records.push(local);
                    continue;
                }
            }
            self.cache_put(&record).await;
            records.push(record);
        }

        let mut unsynced: Vec<&RecordId> = pending
            .iter()
            .filter(|(id, kind)| **kind == OperationKind::Upsert && !returned.contains(*id))
            .map(|(id, _)| id)
            .collect();
        unsynced.sort();
        let mut local_only = Vec::with_capacity(unsynced.len());
        for id in unsynced {
            if let Some(local) = self.cached(id).await {
                local_only.push(local);
            }
        }
        records.extend(self.ledger.read().await.filter(local_only));
        records.sort_by(|a, b| a.id().cmp(b.id()));

        self.state.write().await.record_pull();
        debug!("Pulled {} record(s)", records.len());
        Ok(records)
    }

    /// Drain on a detached task so a dropped caller cannot strand the
    /// queue's in-flight flag.
    async fn drain_pending(&self) -> Result<DrainOutcome> {
        let Some(engine) = self.weak_self.upgrade() else {
            return Ok(DrainOutcome::default());
        };
        tokio::spawn(async move { engine.drain_once().await })
            .await
            .map_err(|e| Error::Commit(format!("drain task aborted: {}", e)))?
    }

    async fn drain_once(&self) -> Result<DrainOutcome> {
        if !self.online() {
            debug!("Offline; drain skipped");
            return Ok(DrainOutcome::default());
        }

        let batch = {
            let mut queue = self.queue.lock().await;
            let Some(batch) = queue.begin_drain() else {
                return Ok(DrainOutcome::default());
            };
            if !batch.skipped.is_empty() {
                self.persist_queue(&queue).await;
            }
            batch
        };
        let skipped = batch.skipped.len();
        if batch.is_empty() {
            return Ok(DrainOutcome {
                skipped,
                ..DrainOutcome::default()
            });
        }

        debug!("Committing {} pending operation(s)", batch.len());
        self.state.write().await.begin_sync();
        let committed = self
            .bounded(
                self.config.remote_sync_timeout,
                "commit",
                self.remote
                    .batch_write(&self.config.collection, batch.writes.clone()),
            )
            .await;
        self.state.write().await.end_sync();

        match committed {
            Ok(()) => {
                let committed = {
                    let mut queue = self.queue.lock().await;
                    let n = queue.finish_success(&batch);
                    self.persist_queue(&queue).await;
                    n
                };
                self.state.write().await.record_commit();
                info!("Committed {} pending operation(s)", committed);
                Ok(DrainOutcome { committed, skipped })
            }
            Err(e) => {
                let (evicted, remaining) = {
                    let mut queue = self.queue.lock().await;
                    let evicted = queue.finish_failure(&batch, &self.retry);
                    self.persist_queue(&queue).await;
                    (evicted, queue.len())
                };
                let evicted_count = evicted.len();
                let retry_count = {
                    let mut state = self.state.write().await;
                    state.record_failure("commit", &e);
                    state.record_evicted(evicted, &e);
                    state.retry_count
                };
                warn!(
                    "Commit of {} operation(s) failed: {}; {} evicted, {} remaining",
                    batch.len(),
                    e,
                    evicted_count,
                    remaining
                );
                if remaining > 0 {
                    self.schedule_redrain(retry_count);
                }
                Err(e)
            }
        }
    }

    /// Arm a single delayed re-drain, `base × retry_count` from now.
    fn schedule_redrain(&self, retry_count: u32) {
        if self.closed.is_cancelled() || self.redrain_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = self.retry.delay_for_attempt(retry_count);
        debug!("Re-drain scheduled in {:?}", delay);

        let weak = self.weak_self.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(engine) = weak.upgrade() else {
                return;
            };
            engine.redrain_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = engine.drain_pending().await {
                debug!("Scheduled re-drain failed: {}", e);
            }
        });
    }

    /// Queue a background push of a record only the cache knows about.
    fn schedule_repair(&self, record: Record) {
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let id = record.id().clone();
            let op = PendingOperation::upsert(id.clone(), record.into_fields(), OperationOrigin::Repair);
            if engine.enqueue(op).await != EnqueueOutcome::Ignored {
                info!("Queued repair push for {}", id);
                let retry_count = engine.state.read().await.retry_count;
                engine.schedule_redrain(retry_count);
            }
        });
    }

    async fn status(&self) -> SyncStatus {
        let pending_count = self.queue.lock().await.len();
        let refresh = self.scheduler.status();
        let state = self.state.read().await;
        SyncStatus {
            is_online: self.online(),
            sync_in_progress: state.sync_in_progress()
                || refresh.phase == SchedulerPhase::Refreshing,
            pending_count,
            last_sync: state.last_sync,
            last_error: state.last_error.clone(),
            retry_count: state.retry_count,
            auto_refresh_enabled: refresh.enabled,
            next_refresh_at: refresh.next_refresh_at,
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl RefreshTarget for EngineInner {
    async fn is_online(&self) -> bool {
        self.online()
    }

    async fn refresh_cycle(&self) -> Result<Vec<Record>> {
        if let Err(e) = self.drain_pending().await {
            warn!("Drain before refresh failed: {}", e);
        }
        self.pull_all().await
    }
}

#[async_trait]
impl ConnectivityObserver for EngineInner {
    async fn connectivity_changed(&self, online: bool) {
        if !online {
            return;
        }
        match self.drain_pending().await {
            Ok(outcome) if outcome.committed > 0 => {
                info!("Reconnected; committed {} queued operation(s)", outcome.committed)
            }
            Ok(_) => {}
            Err(e) => warn!("Drain after reconnect failed: {}", e),
        }
    }
}
