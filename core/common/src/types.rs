//! Common types used throughout profilesync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::timestamp;

/// The remote store's native document representation: a map of named fields.
pub type Document = serde_json::Map<String, Value>;

/// Unique identifier for a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new RecordId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty and must not contain '/'
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a path separator
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') {
            return Err(crate::Error::InvalidInput(format!(
                "RecordId cannot contain '/': {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is well-formed.
    ///
    /// Ids built through [`RecordId::new`] always are; ids restored from
    /// persisted state may not be.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty() && !self.0.contains('/')
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A synchronized user profile.
///
/// The identifier is fixed at construction. Everything else, including the
/// `createdAt` creation timestamp, lives in the field map so the record maps
/// one-to-one onto a remote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    fields: Document,
}

impl Record {
    /// Create a record stamped with the current time as its creation timestamp.
    pub fn new(id: RecordId) -> Self {
        let mut fields = Document::new();
        fields.insert(
            timestamp::CREATED_AT.to_string(),
            timestamp::to_value(&Utc::now()),
        );
        Self { id, fields }
    }

    /// Build a record from a document as stored remotely or locally.
    ///
    /// An `id` key inside the document is ignored; the id argument is authoritative.
    pub fn from_document(id: RecordId, mut fields: Document) -> Self {
        fields.remove("id");
        Self { id, fields }
    }

    /// Set a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Set a field. Writes to `id` are ignored.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if name == "id" {
            return;
        }
        self.fields.insert(name, value.into());
    }

    /// Get the record id.
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Get a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get all fields.
    pub fn fields(&self) -> &Document {
        &self.fields
    }

    /// Mutable access to the fields.
    pub fn fields_mut(&mut self) -> &mut Document {
        &mut self.fields
    }

    /// Consume the record, returning its fields.
    pub fn into_fields(self) -> Document {
        self.fields
    }

    /// Creation timestamp, if present and valid.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.fields
            .get(timestamp::CREATED_AT)
            .and_then(timestamp::validate)
    }

    /// Whether `field` equals `value`.
    pub fn field_equals(&self, field: &str, value: &Value) -> bool {
        if field == "id" {
            return value.as_str() == Some(self.id.as_str());
        }
        self.fields.get(field) == Some(value)
    }
}
