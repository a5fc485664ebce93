//! Deletion guard ledger.
//!
//! Remote reads can return a record shortly after it was deleted (stale
//! replicas, eventual consistency). Every deletion is noted here, and reads
//! are filtered through the ledger so a deleted record does not reappear.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use profilesync_common::{Record, RecordId};

/// A recorded deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionEntry {
    /// The deleted record.
    pub record_id: RecordId,
    /// When the deletion happened.
    pub deleted_at: DateTime<Utc>,
    /// Identity of whoever deleted it, if known.
    pub actor: Option<String>,
}

/// Append-only list of deletions, pruned only by age.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeletionLedger {
    entries: Vec<DeletionEntry>,
}

impl DeletionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a record was deleted.
    pub fn record_deletion(&mut self, record_id: RecordId, actor: Option<String>) {
        self.record_deletion_at(record_id, actor, Utc::now());
    }

    /// Note a deletion at an explicit time.
    pub fn record_deletion_at(
        &mut self,
        record_id: RecordId,
        actor: Option<String>,
        deleted_at: DateTime<Utc>,
    ) {
        debug!("Ledger: recorded deletion of {}", record_id);
        self.entries.push(DeletionEntry {
            record_id,
            deleted_at,
            actor,
        });
    }

    /// Whether the record has a deletion entry.
    pub fn was_deleted(&self, record_id: &RecordId) -> bool {
        self.entries.iter().any(|e| &e.record_id == record_id)
    }

    /// Drop every record that has a deletion entry.
    pub fn filter(&self, records: Vec<Record>) -> Vec<Record> {
        if self.entries.is_empty() {
            return records;
        }
        records
            .into_iter()
            .filter(|r| !self.was_deleted(r.id()))
            .collect()
    }

    /// Remove entries older than `days`. Returns how many were removed.
    pub fn prune_older_than(&mut self, days: u32, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(i64::from(days));
        let before = self.entries.len();
        self.entries.retain(|e| e.deleted_at >= cutoff);
        before - self.entries.len()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[DeletionEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    #[test]
    fn test_filter_removes_deleted() {
        let mut ledger = DeletionLedger::new();
        ledger.record_deletion(id("u2"), Some("admin".to_string()));

        let records = vec![Record::new(id("u1")), Record::new(id("u2")), Record::new(id("u3"))];
        let kept: Vec<String> = ledger
            .filter(records)
            .iter()
            .map(|r| r.id().to_string())
            .collect();

        assert_eq!(kept, vec!["u1", "u3"]);
        assert!(ledger.was_deleted(&id("u2")));
        assert!(!ledger.was_deleted(&id("u1")));
    }

    #[test]
    fn test_prune_by_age() {
        let now = Utc::now();
        let mut ledger = DeletionLedger::new();
        ledger.record_deletion_at(id("old"), None, now - Duration::days(31));
        ledger.record_deletion_at(id("recent"), None, now - Duration::days(2));

        assert_eq!(ledger.prune_older_than(30, now), 1);
        assert!(!ledger.was_deleted(&id("old")));
        assert!(ledger.was_deleted(&id("recent")));
    }

    #[test]
    fn test_repeated_deletions_are_appended() {
        let mut ledger = DeletionLedger::new();
        ledger.record_deletion(id("u1"), None);
        ledger.record_deletion(id("u1"), None);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let mut ledger = DeletionLedger::new();
        ledger.record_deletion(id("u1"), Some("admin".to_string()));

        let value = serde_json::to_value(&ledger).unwrap();
        assert!(value.is_array());
        let restored: DeletionLedger = serde_json::from_value(value).unwrap();
        assert_eq!(restored.entries(), ledger.entries());
    }
}
