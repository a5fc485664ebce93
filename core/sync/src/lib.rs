//! Profilesync Sync Engine
//!
//! Offline-first synchronization of user profiles between a per-device
//! local store and an authoritative remote document store:
//! - Two-phase writes: local durability first, remote delivery queued and retried
//! - Coalescing pending-operation queue committed as one atomic batch
//! - Deletion ledger that keeps deleted records from reappearing
//! - Live per-record listeners with automatic reconnect
//! - Auto-refresh scheduler with overlap and offline guards
//! - Reachability monitoring that drains the queue on reconnect

pub mod cache;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod listener;
pub mod queue;
pub mod reachability;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod subscription;

// Re-export main types
pub use cache::RecordCache;
pub use config::SyncConfig;
pub use engine::{Diagnostics, DrainOutcome, SyncEngine, SyncReport, WriteOutcome};
pub use ledger::{DeletionEntry, DeletionLedger};
pub use listener::{ListenerManager, RecordCallback};
pub use queue::{EnqueueOutcome, OperationKind, OperationOrigin, PendingOperation, PendingQueue};
pub use reachability::{ConnectivityObserver, ReachabilityMonitor};
pub use retry::RetryPolicy;
pub use scheduler::{
    AutoRefreshScheduler, AutoRefreshStatus, DataUpdate, DataUpdateCallback, RefreshTarget,
    SchedulerPhase, SkipReason, TickOutcome, UpdateSource,
};
pub use state::{FailedOperation, SyncState, SyncStatus};
pub use subscription::Subscription;
