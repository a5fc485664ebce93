//! Pending operation queue.
//!
//! Holds mutations that have not reached the remote store yet. At most one
//! operation exists per record id; a newer caller intent replaces the older
//! one. A drain takes every queued operation, turns it into one atomic
//! batch, and settles the outcome:
//! - success removes every operation that was part of the batch
//! - failure bumps their retry counts and evicts those at the ceiling
//!
//! Operations enqueued while a batch is in flight survive either outcome,
//! because settlement matches on operation id rather than record id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use profilesync_common::{Document, Error, RecordId, Result};
use profilesync_storage::BatchWrite;

use crate::retry::RetryPolicy;

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create or merge-update the record.
    Upsert,
    /// Delete the record.
    Delete,
}

/// Who asked for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOrigin {
    /// An explicit save or delete.
    Caller,
    /// A background push of a record found only in the local cache.
    Repair,
}

/// A mutation waiting for delivery to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique ID for this operation.
    pub id: String,
    /// Target record.
    pub record_id: RecordId,
    /// Type of mutation.
    pub kind: OperationKind,
    /// Full record fields for upserts, `None` for deletes.
    pub payload: Option<Document>,
    /// When the operation was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Who asked for it.
    pub origin: OperationOrigin,
}

impl PendingOperation {
    /// Queue a create-or-update.
    pub fn upsert(record_id: RecordId, payload: Document, origin: OperationOrigin) -> Self {
        Self::with_kind(record_id, OperationKind::Upsert, Some(payload), origin)
    }

    /// Queue a delete.
    pub fn delete(record_id: RecordId, origin: OperationOrigin) -> Self {
        Self::with_kind(record_id, OperationKind::Delete, None, origin)
    }

    fn with_kind(
        record_id: RecordId,
        kind: OperationKind,
        payload: Option<Document>,
        origin: OperationOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_id,
            kind,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            origin,
        }
    }

    /// Normalize into a batch entry.
    ///
    /// # Errors
    /// - Missing or malformed record id
    /// - Upsert without a payload
    pub fn to_batch_write(&self) -> Result<BatchWrite> {
        if !self.record_id.is_valid() {
            return Err(Error::InvalidInput(format!(
                "operation {} has malformed record id '{}'",
                self.id, self.record_id
            )));
        }
        match self.kind {
            OperationKind::Upsert => {
                let fields = self.payload.clone().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "upsert {} for {} has no payload",
                        self.id, self.record_id
                    ))
                })?;
                Ok(BatchWrite::Set {
                    id: self.record_id.clone(),
                    fields,
                })
            }
            OperationKind::Delete => Ok(BatchWrite::Delete {
                id: self.record_id.clone(),
            }),
        }
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No operation existed for the record.
    Queued,
    /// An older operation for the record was replaced.
    Replaced,
    /// A repair was dropped because the record already has a queued intent.
    Ignored,
}

/// Operations handed to the remote store as one commit.
#[derive(Debug, Clone)]
pub struct DrainBatch {
    /// Batch entries, one per included operation.
    pub writes: Vec<BatchWrite>,
    /// Operations dropped because they could not be normalized.
    pub skipped: Vec<PendingOperation>,
    included: HashSet<String>,
}

impl DrainBatch {
    /// Number of operations in the commit.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is left to commit.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// In-memory queue of pending operations, in enqueue order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    operations: Vec<PendingOperation>,
    draining: bool,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from a persisted snapshot, keeping the latest
    /// operation per record.
    pub fn from_operations(operations: Vec<PendingOperation>) -> Self {
        let mut queue = Self::new();
        for op in operations {
            queue.operations.retain(|o| o.record_id != op.record_id);
            queue.operations.push(op);
        }
        queue
    }

    /// Add an operation, replacing any queued operation for the same record.
    ///
    /// A repair never replaces an existing operation: it only fills a gap.
    pub fn enqueue(&mut self, op: PendingOperation) -> EnqueueOutcome {
        let existing = self
            .operations
            .iter()
            .position(|o| o.record_id == op.record_id);

        match existing {
            Some(_) if op.origin == OperationOrigin::Repair => {
                debug!(
                    "Ignoring repair for {}: an operation is already queued",
                    op.record_id
                );
                EnqueueOutcome::Ignored
            }
            Some(index) => {
                let old = self.operations.remove(index);
                debug!(
                    "Coalesced {:?} for {} into {:?}",
                    old.kind, op.record_id, op.kind
                );
                self.operations.push(op);
                EnqueueOutcome::Replaced
            }
            None => {
                self.operations.push(op);
                EnqueueOutcome::Queued
            }
        }
    }

    /// Remove the operation queued for a record.
    pub fn remove(&mut self, record_id: &RecordId) -> Option<PendingOperation> {
        let index = self
            .operations
            .iter()
            .position(|o| &o.record_id == record_id)?;
        Some(self.operations.remove(index))
    }

    /// Get the operation queued for a record.
    pub fn get(&self, record_id: &RecordId) -> Option<&PendingOperation> {
        self.operations.iter().find(|o| &o.record_id == record_id)
    }

    /// All queued operations in enqueue order.
    pub fn operations(&self) -> &[PendingOperation] {
        &self.operations
    }

    /// Count of queued operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether a drain is in flight.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Start a drain.
    ///
    /// Returns `None` when the queue is empty or a drain is already in
    /// flight. Operations that cannot be normalized are removed from the
    /// queue and reported in `skipped`; the rest form the batch. The caller
    /// must settle the batch with [`finish_success`](Self::finish_success)
    /// or [`finish_failure`](Self::finish_failure).
    pub fn begin_drain(&mut self) -> Option<DrainBatch> {
        if self.draining || self.operations.is_empty() {
            return None;
        }

        let mut writes = Vec::with_capacity(self.operations.len());
        let mut included = HashSet::new();
        let mut skipped = Vec::new();

        let operations = std::mem::take(&mut self.operations);
        for op in operations {
            match op.to_batch_write() {
                Ok(write) => {
                    included.insert(op.id.clone());
                    writes.push(write);
                    self.operations.push(op);
                }
                Err(e) => {
                    warn!("Skipping pending operation: {}", e);
                    skipped.push(op);
                }
            }
        }

        self.draining = !writes.is_empty();
        Some(DrainBatch {
            writes,
            skipped,
            included,
        })
    }

    /// Settle a committed batch. Returns how many operations were removed.
    pub fn finish_success(&mut self, batch: &DrainBatch) -> usize {
        let before = self.operations.len();
        self.operations.retain(|o| !batch.included.contains(&o.id));
        self.draining = false;
        before - self.operations.len()
    }

    /// Settle a failed batch. Returns the operations evicted at the ceiling.
    pub fn finish_failure(
        &mut self,
        batch: &DrainBatch,
        policy: &RetryPolicy,
    ) -> Vec<PendingOperation> {
        let mut evicted = Vec::new();
        let operations = std::mem::take(&mut self.operations);

        for mut op in operations {
            if batch.included.contains(&op.id) {
                op.retry_count += 1;
                if policy.is_exhausted(op.retry_count) {
                    warn!(
                        "Evicting {:?} for {} after {} attempts",
                        op.kind, op.record_id, op.retry_count
                    );
                    evicted.push(op);
                    continue;
                }
            }
            self.operations.push(op);
        }

        self.draining = false;
        evicted
    }
}
