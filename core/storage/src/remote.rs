//! Remote document store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use profilesync_common::{Document, Record, RecordId, Result};

/// Server-assigned modification timestamp field.
pub const LAST_UPDATED_FIELD: &str = "lastUpdated";

/// Client-assigned, monotonically increasing write stamp. Observability only.
pub const SYNC_VERSION_FIELD: &str = "syncVersion";

/// A document as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Document id within its collection.
    pub id: RecordId,
    /// Document fields, including `lastUpdated` and `syncVersion` when present.
    pub fields: Document,
    /// Server-assigned modification time.
    pub last_updated: DateTime<Utc>,
}

impl StoredDocument {
    /// Client-assigned sync version, if the document carries one.
    pub fn sync_version(&self) -> Option<u64> {
        self.fields.get(SYNC_VERSION_FIELD).and_then(Value::as_u64)
    }

    /// Convert into a record.
    pub fn into_record(self) -> Record {
        Record::from_document(self.id, self.fields)
    }
}

/// One entry of an atomic multi-document commit.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    /// Merge `fields` into the document, creating it if absent.
    Set { id: RecordId, fields: Document },
    /// Remove the document.
    Delete { id: RecordId },
}

impl BatchWrite {
    /// Target document id.
    pub fn id(&self) -> &RecordId {
        match self {
            BatchWrite::Set { id, .. } | BatchWrite::Delete { id } => id,
        }
    }
}

/// Live updates for one document.
///
/// Yields the current state first, then every change. `Ok(None)` means the
/// document does not exist; an `Err` item means the subscription broke and
/// the consumer should resubscribe. Dropping the stream unsubscribes.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<Option<StoredDocument>>> + Send>>;

/// Remote document store.
///
/// All operations are async. Implementations must handle their own
/// authentication and rate limiting.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "firestore").
    fn name(&self) -> &str;

    /// Fetch one document.
    ///
    /// # Returns
    /// `Ok(None)` when the document does not exist.
    ///
    /// # Errors
    /// - Network errors
    /// - Permission errors
    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<StoredDocument>>;

    /// Write a document.
    ///
    /// With `merge = true`, fields are merged into an existing document;
    /// otherwise the document is replaced.
    ///
    /// # Postconditions
    /// - Returns the document as stored, with `lastUpdated` assigned by the server
    async fn set(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Document,
        merge: bool,
    ) -> Result<StoredDocument>;

    /// Delete a document. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &RecordId) -> Result<()>;

    /// Documents whose `field` equals `value`.
    async fn query(&self, collection: &str, field: &str, value: &Value)
        -> Result<Vec<StoredDocument>>;

    /// Every document in the collection.
    async fn list_all(&self, collection: &str) -> Result<Vec<StoredDocument>>;

    /// Apply all writes atomically: either every write lands or none does.
    ///
    /// # Errors
    /// - Commit rejected (quota, permission, malformed payload)
    /// - Network errors
    async fn batch_write(&self, collection: &str, writes: Vec<BatchWrite>) -> Result<()>;

    /// Open a live subscription to one document.
    async fn subscribe(&self, collection: &str, id: &RecordId) -> Result<ChangeStream>;
}
