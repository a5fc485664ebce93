//! Auto-refresh scheduling.
//!
//! A repeating timer that drains the pending queue and pulls the full
//! collection, then fans the result out to data-update subscribers.
//!
//! ```text
//! Stopped --start--> Armed --tick--> Refreshing --done--> Armed --stop--> Stopped
//! ```
//!
//! A stop during `Refreshing` lets the refresh finish first. Ticks that
//! fire while a refresh is in flight are skipped, never queued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use profilesync_common::{Error, Record, Result};

use crate::subscription::Subscription;

/// What produced a data update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateSource {
    /// The periodic timer.
    AutoRefresh,
    /// An explicit refresh request.
    Manual,
}

/// Payload delivered to data-update subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct DataUpdate {
    /// Every record after the deletion filter.
    pub records: Vec<Record>,
    /// When the refresh finished.
    pub timestamp: DateTime<Utc>,
    /// What triggered the refresh.
    pub source: UpdateSource,
}

/// Callback receiving refresh results.
pub type DataUpdateCallback = Arc<dyn Fn(&DataUpdate) + Send + Sync>;

/// The work a refresh tick performs.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    /// Whether the device is online.
    async fn is_online(&self) -> bool;

    /// Drain pending writes, then pull and filter the full collection.
    async fn refresh_cycle(&self) -> Result<Vec<Record>>;
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPhase {
    /// No timer armed.
    Stopped,
    /// Timer armed, waiting for the next tick.
    Armed,
    /// A refresh is running.
    Refreshing,
}

/// Snapshot of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRefreshStatus {
    pub enabled: bool,
    pub phase: SchedulerPhase,
    pub interval: Duration,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The scheduler was stopped before the tick ran.
    Disabled,
    /// The device is offline.
    Offline,
    /// Another refresh is in flight.
    InProgress,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Refresh finished; carries the number of records fanned out.
    Completed(usize),
    /// Refresh failed; carries the error message.
    Failed(String),
    /// Tick skipped.
    Skipped(SkipReason),
}

struct Timing {
    interval: Duration,
    next_refresh_at: Option<DateTime<Utc>>,
    last_refresh_at: Option<DateTime<Utc>>,
    timer: Option<CancellationToken>,
}

struct SchedulerShared {
    target: Weak<dyn RefreshTarget>,
    enabled: AtomicBool,
    refreshing: AtomicBool,
    timing: Mutex<Timing>,
    subscribers: Mutex<HashMap<u64, DataUpdateCallback>>,
    next_subscriber: AtomicU64,
}

/// Periodic refresh driver.
pub struct AutoRefreshScheduler {
    shared: Arc<SchedulerShared>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deadline(interval: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(interval)
        .ok()
        .map(|d| Utc::now() + d)
}

impl AutoRefreshScheduler {
    /// Create a stopped scheduler.
    pub fn new(target: Weak<dyn RefreshTarget>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                target,
                enabled: AtomicBool::new(false),
                refreshing: AtomicBool::new(false),
                timing: Mutex::new(Timing {
                    interval,
                    next_refresh_at: None,
                    last_refresh_at: None,
                    timer: None,
                }),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Arm the timer. Restarts it with the new period when already running.
    ///
    /// # Errors
    /// - Zero interval
    pub fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidInput(
                "auto-refresh interval must be positive".to_string(),
            ));
        }
        self.shared.enabled.store(true, Ordering::SeqCst);
        self.arm(interval);
        info!("Auto-refresh started every {:?}", interval);
        Ok(())
    }

    /// Disarm the timer. An in-flight refresh still completes.
    pub fn stop(&self) {
        let was_enabled = self.shared.enabled.swap(false, Ordering::SeqCst);
        let mut timing = guard(&self.shared.timing);
        if let Some(timer) = timing.timer.take() {
            timer.cancel();
        }
        timing.next_refresh_at = None;
        if was_enabled {
            info!("Auto-refresh stopped");
        }
    }

    /// Change the period. Re-arms the timer only when it is running.
    ///
    /// # Errors
    /// - Zero interval
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidInput(
                "auto-refresh interval must be positive".to_string(),
            ));
        }
        if self.is_enabled() {
            self.arm(interval);
            debug!("Auto-refresh re-armed every {:?}", interval);
        } else {
            guard(&self.shared.timing).interval = interval;
        }
        Ok(())
    }

    fn arm(&self, interval: Duration) {
        let token = CancellationToken::new();
        {
            let mut timing = guard(&self.shared.timing);
            if let Some(old) = timing.timer.replace(token.clone()) {
                old.cancel();
            }
            timing.interval = interval;
            timing.next_refresh_at = deadline(interval);
        }
        tokio::spawn(run_timer(self.shared.clone(), interval, token));
    }

    /// Register a data-update subscriber.
    pub fn on_data_update(&self, callback: DataUpdateCallback) -> Subscription {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        guard(&self.shared.subscribers).insert(id, callback);

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                guard(&shared.subscribers).remove(&id);
            }
        })
    }

    /// Run one refresh now, outside the timer.
    pub async fn refresh_now(&self) -> TickOutcome {
        tick(&self.shared, UpdateSource::Manual).await
    }

    /// Whether the timer is armed.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Current state.
    pub fn phase(&self) -> SchedulerPhase {
        if self.shared.refreshing.load(Ordering::SeqCst) {
            SchedulerPhase::Refreshing
        } else if self.is_enabled() {
            SchedulerPhase::Armed
        } else {
            SchedulerPhase::Stopped
        }
    }

    /// When the next tick is due, if armed.
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        guard(&self.shared.timing).next_refresh_at
    }

    /// Number of data-update subscribers.
    pub fn subscriber_count(&self) -> usize {
        guard(&self.shared.subscribers).len()
    }

    /// Snapshot of the scheduler.
    pub fn status(&self) -> AutoRefreshStatus {
        let phase = self.phase();
        let timing = guard(&self.shared.timing);
        AutoRefreshStatus {
            enabled: self.is_enabled(),
            phase,
            interval: timing.interval,
            next_refresh_at: timing.next_refresh_at,
            last_refresh_at: timing.last_refresh_at,
        }
    }
}

impl Drop for AutoRefreshScheduler {
    fn drop(&mut self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        if let Some(timer) = guard(&self.shared.timing).timer.take() {
            timer.cancel();
        }
    }
}

impl SchedulerShared {
    fn touch_next_refresh(&self) {
        let mut timing = guard(&self.timing);
        timing.next_refresh_at = if self.enabled.load(Ordering::SeqCst) {
            deadline(timing.interval)
        } else {
            None
        };
    }

    fn fan_out(&self, update: &DataUpdate) {
        let callbacks: Vec<DataUpdateCallback> =
            guard(&self.subscribers).values().cloned().collect();
        for callback in callbacks {
            callback(update);
        }
    }
}

async fn run_timer(shared: Arc<SchedulerShared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Runs outside the select so a stop never aborts a refresh midway.
        match tick(&shared, UpdateSource::AutoRefresh).await {
            TickOutcome::Completed(count) => debug!("Auto-refresh delivered {} record(s)", count),
            TickOutcome::Failed(e) => warn!("Auto-refresh failed: {}", e),
            TickOutcome::Skipped(reason) => debug!("Auto-refresh tick skipped: {:?}", reason),
        }
    }
    debug!("Auto-refresh timer exited");
}

async fn tick(shared: &Arc<SchedulerShared>, source: UpdateSource) -> TickOutcome {
    // Manual refreshes do not move the timer, so they leave the countdown alone.
    let timed = source == UpdateSource::AutoRefresh;
    if timed {
        if !shared.enabled.load(Ordering::SeqCst) {
            return TickOutcome::Skipped(SkipReason::Disabled);
        }
        shared.touch_next_refresh();
    }
    let Some(target) = shared.target.upgrade() else {
        return TickOutcome::Skipped(SkipReason::Disabled);
    };
    if !target.is_online().await {
        return TickOutcome::Skipped(SkipReason::Offline);
    }
    if shared
        .refreshing
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return TickOutcome::Skipped(SkipReason::InProgress);
    }

    let outcome = match target.refresh_cycle().await {
        Ok(records) => {
            let update = DataUpdate {
                records,
                timestamp: Utc::now(),
                source,
            };
            guard(&shared.timing).last_refresh_at = Some(update.timestamp);
            shared.fan_out(&update);
            TickOutcome::Completed(update.records.len())
        }
        Err(e) => TickOutcome::Failed(e.to_string()),
    };

    shared.refreshing.store(false, Ordering::SeqCst);
    if timed {
        shared.touch_next_refresh();
    }
    outcome
}
