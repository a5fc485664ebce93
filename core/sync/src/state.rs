//! Live sync state and the derived status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use profilesync_common::Error;

use crate::queue::PendingOperation;

/// Failed operations kept until the host drains them; oldest go first.
pub const MAX_FAILED_OPERATIONS: usize = 100;

/// A queued operation that hit the retry ceiling and was dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOperation {
    /// The evicted operation, with its final retry count.
    pub operation: PendingOperation,
    /// Error from the last attempt.
    pub error: String,
    /// When it was evicted.
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time view of sync health, suitable for a status indicator.
///
/// Recomputed on every request; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the device is online.
    pub is_online: bool,
    /// Whether a drain or pull is running.
    pub sync_in_progress: bool,
    /// Number of queued operations.
    pub pending_count: usize,
    /// Last successful commit or pull.
    pub last_sync: Option<DateTime<Utc>>,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
    /// Remote failures since the last successful commit.
    pub retry_count: u32,
    /// Whether auto-refresh is armed.
    pub auto_refresh_enabled: bool,
    /// When the next auto-refresh tick is due.
    pub next_refresh_at: Option<DateTime<Utc>>,
}

/// Mutable engine state shared by the orchestrator and the listener manager.
#[derive(Debug, Default)]
pub struct SyncState {
    /// Last successful commit or pull.
    pub last_sync: Option<DateTime<Utc>>,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Remote failures since the last successful commit.
    pub retry_count: u32,
    active_syncs: u32,
    failed: Vec<FailedOperation>,
}

impl SyncState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remote failure.
    pub fn record_failure(&mut self, context: &str, error: &Error) {
        self.last_error = Some(format!("{}: {}", context, error));
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Record a successful commit.
    pub fn record_commit(&mut self) {
        self.retry_count = 0;
        self.last_sync = Some(Utc::now());
    }

    /// Record a successful pull.
    pub fn record_pull(&mut self) {
        self.last_sync = Some(Utc::now());
    }

    /// Record operations evicted at the retry ceiling.
    pub fn record_evicted(&mut self, evicted: Vec<PendingOperation>, error: &Error) {
        if evicted.is_empty() {
            return;
        }
        let now = Utc::now();
        let ids: Vec<String> = evicted.iter().map(|op| op.record_id.to_string()).collect();
        self.last_error = Some(format!(
            "{} operation(s) permanently failed after {} attempts ({}): {}",
            evicted.len(),
            evicted.iter().map(|op| op.retry_count).max().unwrap_or(0),
            ids.join(", "),
            error
        ));
        self.failed.extend(evicted.into_iter().map(|operation| FailedOperation {
            operation,
            error: error.to_string(),
            failed_at: now,
        }));
        if self.failed.len() > MAX_FAILED_OPERATIONS {
            let excess = self.failed.len() - MAX_FAILED_OPERATIONS;
            self.failed.drain(..excess);
        }
    }

    /// Drain the list of permanently failed operations.
    pub fn take_failed(&mut self) -> Vec<FailedOperation> {
        std::mem::take(&mut self.failed)
    }

    /// Mark a drain or pull as started.
    pub fn begin_sync(&mut self) {
        self.active_syncs += 1;
    }

    /// Mark a drain or pull as finished.
    pub fn end_sync(&mut self) {
        self.active_syncs = self.active_syncs.saturating_sub(1);
    }

    /// Whether a drain or pull is running.
    pub fn sync_in_progress(&self) -> bool {
        self.active_syncs > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OperationOrigin, PendingOperation};
    use profilesync_common::RecordId;

    #[test]
    fn test_failure_increments_retry_count() {
        let mut state = SyncState::new();
        state.record_failure("save u1", &Error::Network("down".to_string()));
        state.record_failure("save u1", &Error::Network("down".to_string()));

        assert_eq!(state.retry_count, 2);
        assert_eq!(
            state.last_error.as_deref(),
            Some("save u1: Network error: down")
        );
    }

    #[test]
    fn test_commit_resets_retry_count() {
        let mut state = SyncState::new();
        state.record_failure("commit", &Error::Commit("quota".to_string()));
        state.record_commit();

        assert_eq!(state.retry_count, 0);
        assert!(state.last_sync.is_some());
        assert!(state.last_error.is_some());
    }

    #[test]
    fn test_evicted_reported_once() {
        let mut state = SyncState::new();
        let mut op = PendingOperation::delete(RecordId::new("u9").unwrap(), OperationOrigin::Caller);
        op.retry_count = 3;
        state.record_evicted(vec![op], &Error::Commit("rejected".to_string()));

        assert!(state.last_error.as_deref().unwrap().contains("u9"));
        assert_eq!(state.take_failed().len(), 1);
        assert!(state.take_failed().is_empty());
    }

    #[test]
    fn test_failed_operations_are_capped() {
        let mut state = SyncState::new();
        for i in 0..MAX_FAILED_OPERATIONS + 5 {
            let id = RecordId::new(format!("u{}", i)).unwrap();
            let op = PendingOperation::delete(id, OperationOrigin::Caller);
            state.record_evicted(vec![op], &Error::Commit("rejected".to_string()));
        }

        let failed = state.take_failed();
        assert_eq!(failed.len(), MAX_FAILED_OPERATIONS);
        assert_eq!(failed[0].operation.record_id.as_str(), "u5");
        assert_eq!(
            failed.last().unwrap().operation.record_id.as_str(),
            format!("u{}", MAX_FAILED_OPERATIONS + 4)
        );
    }

    #[test]
    fn test_nested_syncs() {
        let mut state = SyncState::new();
        state.begin_sync();
        state.begin_sync();
        state.end_sync();
        assert!(state.sync_in_progress());
        state.end_sync();
        assert!(!state.sync_in_progress());
    }
}
