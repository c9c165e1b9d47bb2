//! Cache projector - applies logged operations to the cache
//!
//! Each consumed operation record is projected onto the cache key of the
//! document it touches:
//!
//! - `create` caches the created document
//! - `update` caches a replacement directly, or applies `$set` / `$unset` /
//!   `$inc` to the cached document; with nothing cached the key is removed so
//!   reads fall through to the store instead of seeing a partial document
//! - `delete` removes the key
//!
//! Cached values carry the ids of the last few operations that produced
//! them. Seeing one of those ids again means the message was redelivered and
//! it is skipped, which keeps non-idempotent operators like `$inc` safe under
//! at-least-once delivery.
//!
//! Known keys are tracked with the expiry of their last write and pruned once
//! expired. Entries the cache evicts early stay counted until then.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::buffer::{BufferMetrics, OperationKind, OperationRecord, SharedSettings};
use crate::cache::{single_id, CacheKeys, CacheStore, CachedDocument};
use crate::db::update::{apply_update, is_operator_update};
use crate::log::LogMessage;
use crate::types::{BufferError, Result};

/// Projects operation records onto the cache
pub struct CacheProjector {
    cache: Arc<dyn CacheStore>,
    settings: SharedSettings,
    metrics: Arc<BufferMetrics>,
    /// Keys written and not yet removed, with their expiry
    known_keys: DashMap<String, Instant>,
}

impl CacheProjector {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        settings: SharedSettings,
        metrics: Arc<BufferMetrics>,
    ) -> Self {
        Self {
            cache,
            settings,
            metrics,
            known_keys: DashMap::new(),
        }
    }

    /// Number of unexpired keys the projector tracks
    pub fn known_key_count(&self) -> usize {
        self.prune_known_keys();
        self.known_keys.len()
    }

    /// Forget keys whose cache entry has expired, returning how many
    pub fn prune_known_keys(&self) -> usize {
        let now = Instant::now();
        let before = self.known_keys.len();
        self.known_keys.retain(|_, expires| *expires > now);
        let pruned = before.saturating_sub(self.known_keys.len());
        if pruned > 0 {
            debug!(pruned = pruned, "Expired cache keys pruned");
        }
        pruned
    }

    /// Apply one delivered message and acknowledge it.
    ///
    /// Failures are counted and logged; the message is still acknowledged so
    /// a poison message cannot stall the subscriber.
    pub async fn handle(&self, mut message: LogMessage) {
        self.metrics.record_log_message();

        if let Err(e) = self.process_message(&message).await {
            self.metrics.record_consume_failure();
            warn!(key = message.key, error = %e, "Log message skipped");
        }

        if let Err(e) = message.ack().await {
            warn!(key = message.key, error = %e, "Failed to ack log message");
        }
    }

    /// Count a delivery error reported by the log itself
    pub fn record_delivery_error(&self, error: &BufferError) {
        self.metrics.record_consume_failure();
        warn!(error = %error, "Log delivery error");
    }

    /// Decode and apply one message
    pub async fn process_message(&self, message: &LogMessage) -> Result<()> {
        let record = OperationRecord::from_bytes(&message.payload).map_err(|e| {
            BufferError::Consume(format!("undecodable message on '{}': {}", message.key, e))
        })?;

        self.apply(&record).await.map_err(|e| match e {
            BufferError::Consume(_) => e,
            other => BufferError::Consume(format!("op {}: {}", record.id(), other)),
        })
    }

    /// Project one record onto the cache
    pub async fn apply(&self, record: &OperationRecord) -> Result<()> {
        let (keys, ttl) = {
            let settings = self.settings.read().await;
            (CacheKeys::new(settings.cache_key_prefix.clone()), settings.cache_ttl)
        };

        let Some(key) = keys.record(record) else {
            debug!(op_id = %record.id(), "Operation has no cache key");
            return Ok(());
        };

        match record.kind() {
            OperationKind::Create => {
                let previous = self.read(&key).await?;
                if Self::is_redelivery(previous.as_ref(), record) {
                    return Ok(());
                }
                let document = record.payload().cloned().unwrap_or_default();
                self.write(&key, previous, record.id(), document, ttl).await?;
            }
            OperationKind::Update => self.project_update(&key, record, ttl).await?,
            OperationKind::Delete => self.remove(&key).await?,
        }

        debug!(
            op_id = %record.id(),
            kind = %record.kind(),
            key = key,
            "Operation projected"
        );
        Ok(())
    }

    async fn project_update(
        &self,
        key: &str,
        record: &OperationRecord,
        ttl: Duration,
    ) -> Result<()> {
        let update = record
            .payload()
            .ok_or_else(|| BufferError::Consume("update without payload".into()))?;

        let cached = self.read(key).await?;
        if Self::is_redelivery(cached.as_ref(), record) {
            return Ok(());
        }

        if !is_operator_update(update) {
            let mut document = update.clone();
            if !document.contains_key("_id") {
                if let Some(id) = record.filter().and_then(single_id) {
                    document.insert("_id", id.clone());
                }
            }
            return self.write(key, cached, record.id(), document, ttl).await;
        }

        match cached {
            Some(cached) => {
                let mut document = cached.document.clone();
                apply_update(&mut document, update)?;
                self.write(key, Some(cached), record.id(), document, ttl).await
            }
            None => self.remove(key).await,
        }
    }

    fn is_redelivery(cached: Option<&CachedDocument>, record: &OperationRecord) -> bool {
        let seen = cached.is_some_and(|c| c.has_applied(record.id()));
        if seen {
            debug!(op_id = %record.id(), "Redelivered operation skipped");
        }
        seen
    }

    async fn read(&self, key: &str) -> Result<Option<CachedDocument>> {
        Ok(match self.cache.get(key).await? {
            Some(bytes) => match CachedDocument::decode(&bytes) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    warn!(key = key, error = %e, "Unreadable cache entry replaced");
                    None
                }
            },
            None => None,
        })
    }

    async fn write(
        &self,
        key: &str,
        previous: Option<CachedDocument>,
        op_id: Uuid,
        document: Document,
        ttl: Duration,
    ) -> Result<()> {
        let entry = match previous {
            Some(previous) => previous.succeeded_by(op_id, document),
            None => CachedDocument::new(op_id, document),
        };
        self.cache.set(key, entry.encode()?, ttl).await?;
        self.known_keys.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cache.delete(key).await?;
        self.known_keys.remove(key);
        Ok(())
    }
}
