//! Write buffer
//!
//! Holds accepted operation records until they are flushed. Every append is
//! published to the event log; reaching the size threshold flushes inline
//! before the append returns.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::flush::{FlushEngine, FlushMode, FlushReport};
use super::operation::OperationRecord;
use super::stats::BufferMetrics;
use crate::config::{BufferSettings, FailurePolicy};
use crate::db::DocumentStore;
use crate::log::EventLog;
use crate::types::{BufferError, Result};

/// Settings shared between the buffer, the projector and the coordinator
pub type SharedSettings = Arc<RwLock<BufferSettings>>;

/// In-memory buffer of pending writes
pub struct WriteBuffer {
    pending: Mutex<Vec<OperationRecord>>,
    /// Serializes flushes so a drain never overlaps an in-flight write
    flush_lock: Mutex<()>,
    dead_letters: Mutex<VecDeque<OperationRecord>>,
    log: Arc<dyn EventLog>,
    engine: FlushEngine,
    metrics: Arc<BufferMetrics>,
    settings: SharedSettings,
}

impl WriteBuffer {
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn DocumentStore>,
        metrics: Arc<BufferMetrics>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            dead_letters: Mutex::new(VecDeque::new()),
            log,
            engine: FlushEngine::new(store),
            metrics,
            settings,
        }
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Buffer a record and publish it to the event log.
    ///
    /// The record stays buffered when publishing fails; the publish error is
    /// still returned so the caller knows cache consistency is delayed.
    pub async fn append(&self, record: OperationRecord) -> Result<OperationRecord> {
        let length = {
            let mut pending = self.pending.lock().await;
            pending.push(record.clone());
            pending.len()
        };
        self.metrics.record_buffered();

        debug!(
            op_id = %record.id(),
            model = record.model(),
            kind = %record.kind(),
            buffered = length,
            "Operation buffered"
        );

        let published = self.publish(&record).await;

        let max_size = self.settings.read().await.max_buffer_size;
        if length >= max_size {
            debug!(buffered = length, max_size = max_size, "Buffer threshold reached");
            self.flush().await;
        }

        published.map(|()| record)
    }

    async fn publish(&self, record: &OperationRecord) -> Result<()> {
        let result = match record.to_bytes() {
            Ok(payload) => self.log.publish(&record.log_key(), payload).await,
            Err(e) => Err(e),
        };

        result.map_err(|e| {
            self.metrics.record_publish_failure();
            warn!(
                op_id = %record.id(),
                key = record.log_key(),
                error = %e,
                "Publish failed, cache consistency delayed"
            );
            match e {
                BufferError::Publish(_) => e,
                other => BufferError::Publish(other.to_string()),
            }
        })
    }

    // =========================================================================
    // Flush side
    // =========================================================================

    /// Drain the buffer and write it to the store.
    ///
    /// Only records present when the drain starts are written; anything
    /// appended meanwhile waits for the next flush. Empty buffers are a no-op.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;

        let drained = std::mem::take(&mut *self.pending.lock().await);
        if drained.is_empty() {
            return FlushReport::default();
        }

        let drained_count = drained.len();
        let (report, failed) = self.engine.execute(drained, FlushMode::Buffered).await;
        self.metrics.record_flush(
            report.flushed_operations() as u64,
            report.failed_operations() as u64,
        );

        if !failed.is_empty() {
            self.handle_failed(failed).await;
        }

        info!(
            operations = drained_count,
            groups = report.groups.len(),
            failed = report.failed_operations(),
            duration_ms = report.duration_ms,
            "Flush completed"
        );
        report
    }

    async fn handle_failed(&self, failed: Vec<OperationRecord>) {
        let (policy, capacity) = {
            let settings = self.settings.read().await;
            (settings.failure_policy, settings.dead_letter_capacity)
        };

        match policy {
            FailurePolicy::Drop => {
                warn!(dropped = failed.len(), "Dropping records the store did not apply");
            }
            FailurePolicy::DeadLetter => self.dead_letter(failed, capacity).await,
        }
    }

    async fn dead_letter(&self, records: Vec<OperationRecord>, capacity: usize) {
        let added = records.len();
        let mut queue = self.dead_letters.lock().await;
        queue.extend(records);

        let overflow = queue.len().saturating_sub(capacity);
        if overflow > 0 {
            queue.drain(..overflow);
            warn!(
                dropped = overflow,
                capacity = capacity,
                "Dead-letter queue full, oldest records dropped"
            );
        }
        warn!(added = added, queued = queue.len(), "Failed records dead-lettered");
    }

    /// Write dead-lettered records as a fresh grouped flush.
    /// Operations that fail again return to the dead-letter queue.
    pub async fn redrive_dead_letters(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;

        let records: Vec<OperationRecord> = self.dead_letters.lock().await.drain(..).collect();
        if records.is_empty() {
            return FlushReport::default();
        }

        info!(records = records.len(), "Redriving dead letters");
        let (report, failed) = self.engine.execute(records, FlushMode::Redrive).await;
        self.metrics.record_flush(
            report.flushed_operations() as u64,
            report.failed_operations() as u64,
        );

        if !failed.is_empty() {
            let capacity = self.settings.read().await.dead_letter_capacity;
            self.dead_letter(failed, capacity).await;
        }
        report
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Number of buffered records
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Snapshot of the dead-letter queue, oldest first
    pub async fn dead_letters(&self) -> Vec<OperationRecord> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().await.len()
    }
}
