//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use profilesync_common::{Error, Result};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote collection holding the records.
    pub collection: String,
    /// Local key prefix for cached records.
    pub cache_prefix: String,
    /// Local key of the persisted pending-queue snapshot.
    pub queue_key: String,
    /// Local key of the persisted deletion ledger.
    pub ledger_key: String,
    /// Upper bound for a single-record remote read or query.
    pub remote_read_timeout: Duration,
    /// Upper bound for a full-collection pull or a batched commit.
    pub remote_sync_timeout: Duration,
    /// Delay before a broken realtime listener resubscribes.
    pub listener_reconnect_delay: Duration,
    /// Attempts per pending operation before it is evicted.
    pub max_retries: u32,
    /// Linear backoff base: a re-drain waits `base × global retry count`.
    pub retry_base_delay: Duration,
    /// Cap for the re-drain backoff.
    pub max_retry_delay: Duration,
    /// Default auto-refresh period.
    pub auto_refresh_interval: Duration,
    /// Deletion ledger entries older than this are pruned when the engine opens.
    pub ledger_retention_days: u32,
    /// Timestamp fields repaired on save, in addition to `createdAt`.
    pub timestamp_fields: Vec<String>,
    /// Actor recorded in deletion ledger entries. Generated when absent.
    pub actor: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collection: "users".to_string(),
            cache_prefix: "profile:".to_string(),
            queue_key: "sync:pending_queue".to_string(),
            ledger_key: "sync:deletion_ledger".to_string(),
            remote_read_timeout: Duration::from_secs(10),
            remote_sync_timeout: Duration::from_secs(30),
            listener_reconnect_delay: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            auto_refresh_interval: Duration::from_secs(30),
            ledger_retention_days: 30,
            timestamp_fields: vec![
                "createdAt".to_string(),
                "updatedAt".to_string(),
                "lastLogin".to_string(),
            ],
            actor: None,
        }
    }
}

impl SyncConfig {
    /// Set the remote collection.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Set the remote read timeout.
    pub fn with_remote_read_timeout(mut self, timeout: Duration) -> Self {
        self.remote_read_timeout = timeout;
        self
    }

    /// Set the bound on pulls and commits.
    pub fn with_remote_sync_timeout(mut self, timeout: Duration) -> Self {
        self.remote_sync_timeout = timeout;
        self
    }

    /// Set the listener reconnect delay.
    pub fn with_listener_reconnect_delay(mut self, delay: Duration) -> Self {
        self.listener_reconnect_delay = delay;
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff base.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Set the default auto-refresh period.
    pub fn with_auto_refresh_interval(mut self, interval: Duration) -> Self {
        self.auto_refresh_interval = interval;
        self
    }

    /// Set the ledger retention window.
    pub fn with_ledger_retention_days(mut self, days: u32) -> Self {
        self.ledger_retention_days = days;
        self
    }

    /// Set the actor recorded in ledger entries.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    /// - Empty collection or key names
    /// - Cache prefix that would also match the queue or ledger key
    /// - Zero retry ceiling, timeout or refresh interval
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(Error::InvalidInput("collection cannot be empty".to_string()));
        }
        if self.cache_prefix.is_empty() || self.queue_key.is_empty() || self.ledger_key.is_empty() {
            return Err(Error::InvalidInput(
                "cache prefix and metadata keys cannot be empty".to_string(),
            ));
        }
        if self.queue_key.starts_with(&self.cache_prefix)
            || self.ledger_key.starts_with(&self.cache_prefix)
        {
            return Err(Error::InvalidInput(format!(
                "metadata keys must not start with the cache prefix '{}'",
                self.cache_prefix
            )));
        }
        if self.queue_key == self.ledger_key {
            return Err(Error::InvalidInput(
                "queue and ledger keys must differ".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".to_string()));
        }
        if self.remote_read_timeout.is_zero()
            || self.remote_sync_timeout.is_zero()
            || self.auto_refresh_interval.is_zero()
        {
            return Err(Error::InvalidInput(
                "timeouts and intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.remote_read_timeout, Duration::from_secs(10));
        assert_eq!(config.remote_sync_timeout, Duration::from_secs(30));
        assert_eq!(config.listener_reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.ledger_retention_days, 30);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{ "collection": "profiles", "max_retries": 5 }"#)
            .unwrap();
        assert_eq!(config.collection, "profiles");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.cache_prefix, "profile:");
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SyncConfig::default().with_actor("device-a");
        let restored = SyncConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_rejects_overlapping_prefix() {
        let mut config = SyncConfig::default();
        config.cache_prefix = "sync:".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sync_timeout() {
        let config = SyncConfig::default().with_remote_sync_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_retries() {
        assert!(SyncConfig::default().with_max_retries(0).validate().is_err());
    }
}
