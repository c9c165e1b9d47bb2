//! Buffer coordinator
//!
//! Owns the write buffer, the cache projector and their background tasks,
//! and holds the injected log, cache and store clients. One coordinator is
//! shared by every buffered repository.
//!
//! Lifecycle:
//! - `start()` subscribes to the log and spawns the subscriber and the flush
//!   timer. It is idempotent and also runs lazily on the first operation.
//! - `shutdown()` stops the timer, runs a final flush, stops the subscriber
//!   and disconnects the log, then disconnects the cache. Each step finishes
//!   before the next begins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::buffer::{
    BufferMetrics, FlushReport, OperationOptions, OperationRecord, SharedSettings, Statistics,
    WriteBuffer,
};
use crate::cache::{CacheKeys, CacheLookup, CacheStore, CachedDocument};
use crate::config::BufferSettings;
use crate::db::DocumentStore;
use crate::log::EventLog;
use crate::projection::{spawn_subscriber, CacheProjector, SubscriberHandle};
use crate::types::{BufferError, Result};

/// Write buffer, cache projection and their lifecycle
pub struct BufferCoordinator {
    settings: SharedSettings,
    buffer: Arc<WriteBuffer>,
    projector: Arc<CacheProjector>,
    log: Arc<dyn EventLog>,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<BufferMetrics>,
    started: OnceCell<()>,
    tasks: Mutex<BackgroundTasks>,
    /// Appends hold a read guard; shutdown takes the write guard to wait for them
    appends: RwLock<()>,
    closed: AtomicBool,
}

#[derive(Default)]
struct BackgroundTasks {
    timer: Option<FlushTimer>,
    subscriber: Option<SubscriberHandle>,
}

impl BufferCoordinator {
    /// Create a coordinator over connected backends
    pub fn new(
        settings: BufferSettings,
        log: Arc<dyn EventLog>,
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        settings.validate().map_err(BufferError::Config)?;

        info!(
            models = %settings.models,
            max_buffer_size = settings.max_buffer_size,
            flush_interval_ms = settings.flush_interval.as_millis() as u64,
            cache_ttl_secs = settings.cache_ttl.as_secs(),
            enabled = settings.enabled,
            "Write buffer initialized"
        );

        let settings: SharedSettings = Arc::new(RwLock::new(settings));
        let metrics = Arc::new(BufferMetrics::new());
        let buffer = Arc::new(WriteBuffer::new(
            Arc::clone(&log),
            store,
            Arc::clone(&metrics),
            Arc::clone(&settings),
        ));
        let projector = Arc::new(CacheProjector::new(
            Arc::clone(&cache),
            Arc::clone(&settings),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            settings,
            buffer,
            projector,
            log,
            cache,
            metrics,
            started: OnceCell::new(),
            tasks: Mutex::new(BackgroundTasks::default()),
            appends: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe to the log and start the background tasks
    pub async fn start(&self) -> Result<()> {
        self.check_open()?;
        self.started.get_or_try_init(|| self.start_tasks()).await?;
        Ok(())
    }

    async fn start_tasks(&self) -> Result<()> {
        let stream = self.log.subscribe().await.map_err(|e| match e {
            BufferError::Connect(_) => e,
            other => BufferError::Connect(format!("Event log subscribe failed: {}", other)),
        })?;

        let interval = self.settings.read().await.flush_interval;
        let mut tasks = self.tasks.lock().await;
        // Shutdown may have run while subscribing; it sets `closed` before
        // taking this lock, so nothing spawned past this check is orphaned.
        if self.closed.load(Ordering::SeqCst) {
            debug!("Shutdown during start, background tasks not spawned");
            return Err(BufferError::InvalidOperation("write buffer is shut down".into()));
        }
        tasks.subscriber = Some(spawn_subscriber(Arc::clone(&self.projector), stream));
        tasks.timer = Some(FlushTimer::spawn(
            Arc::clone(&self.buffer),
            Arc::clone(&self.projector),
            interval,
        ));

        info!("Write buffer started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.started.initialized() && !self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BufferError::InvalidOperation("write buffer is shut down".into()))
        } else {
            Ok(())
        }
    }

    /// Stop the timer, flush what is left, then disconnect log and cache
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down write buffer");

        // Wait for appends that passed the open check
        drop(self.appends.write().await);

        let (timer, subscriber) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.timer.take(), tasks.subscriber.take())
        };

        if let Some(timer) = timer {
            timer.stop().await;
        }

        let report = self.buffer.flush().await;
        if !report.is_empty() {
            info!(
                flushed = report.flushed_operations(),
                failed = report.failed_operations(),
                "Final flush completed"
            );
        }

        if let Some(subscriber) = subscriber {
            subscriber.stop().await;
        }

        let mut first_error = None;
        if let Err(e) = self.log.disconnect().await {
            warn!(error = %e, "Event log disconnect failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.cache.disconnect().await {
            warn!(error = %e, "Cache disconnect failed");
            first_error.get_or_insert(e);
        }

        info!("Write buffer stopped");
        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Buffer an insert
    pub async fn create(&self, model: &str, document: Document) -> Result<OperationRecord> {
        self.append(OperationRecord::create(model, document)?).await
    }

    /// Buffer an update of the first document matching `filter`
    pub async fn update(
        &self,
        model: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<OperationRecord> {
        self.append(OperationRecord::update(model, filter, update, options)?)
            .await
    }

    /// Buffer a delete of the first document matching `filter`
    pub async fn delete(&self, model: &str, filter: Document) -> Result<OperationRecord> {
        self.append(OperationRecord::delete(model, filter)?).await
    }

    /// Buffer a record and publish it.
    ///
    /// A [`BufferError::Publish`] means the record is buffered and will be
    /// flushed, but the cache will not see it until the log recovers.
    pub async fn append(&self, record: OperationRecord) -> Result<OperationRecord> {
        let _guard = self.appends.read().await;
        self.check_open()?;
        self.start().await?;
        self.buffer.append(record).await
    }

    /// Flush everything currently buffered
    pub async fn flush(&self) -> FlushReport {
        self.buffer.flush().await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Whether a model's calls go through the buffer
    pub async fn should_buffer(&self, model: &str) -> bool {
        self.settings.read().await.should_buffer(model)
    }

    /// Serve a read from the cache when the filter names a single `_id`.
    ///
    /// Cache failures degrade to a miss; the store stays authoritative.
    pub async fn read_through(&self, model: &str, filter: &Document) -> Result<CacheLookup> {
        let key = {
            let settings = self.settings.read().await;
            if !settings.read_through || !settings.should_buffer(model) {
                return Ok(CacheLookup::Bypass);
            }
            match CacheKeys::new(settings.cache_key_prefix.clone()).lookup(model, filter) {
                Some(key) => key,
                None => return Ok(CacheLookup::Bypass),
            }
        };

        self.start().await?;

        let cached = match self.cache.get(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(key = key, error = %e, "Cache read failed, falling back to store");
                None
            }
        };

        match cached.map(|bytes| CachedDocument::decode(&bytes)) {
            Some(Ok(cached)) => {
                self.metrics.record_cache_hit();
                debug!(key = key, "Cache hit");
                Ok(CacheLookup::Hit(cached.document))
            }
            Some(Err(e)) => {
                warn!(key = key, error = %e, "Unreadable cache entry");
                self.metrics.record_cache_miss();
                Ok(CacheLookup::Miss)
            }
            None => {
                self.metrics.record_cache_miss();
                debug!(key = key, "Cache miss");
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// Count a read served by the document store
    pub fn record_store_query(&self) {
        self.metrics.record_store_query();
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Current statistics; counters never reset implicitly
    pub async fn statistics(&self) -> Statistics {
        self.metrics.snapshot(
            self.buffer.len().await,
            self.projector.known_key_count(),
            self.buffer.dead_letter_count().await,
        )
    }

    /// Zero the statistics counters
    pub fn reset_statistics(&self) {
        self.metrics.reset();
        info!("Buffer statistics reset");
    }

    /// Current settings
    pub async fn settings(&self) -> BufferSettings {
        self.settings.read().await.clone()
    }

    /// Replace the runtime settings. A new flush interval restarts the timer.
    pub async fn configure(&self, settings: BufferSettings) -> Result<()> {
        settings.validate().map_err(BufferError::Config)?;

        let interval = settings.flush_interval;
        let interval_changed = {
            let mut current = self.settings.write().await;
            let changed = current.flush_interval != interval;
            *current = settings;
            changed
        };

        if interval_changed {
            let mut tasks = self.tasks.lock().await;
            if let Some(timer) = tasks.timer.take() {
                timer.stop().await;
                tasks.timer = Some(FlushTimer::spawn(
                    Arc::clone(&self.buffer),
                    Arc::clone(&self.projector),
                    interval,
                ));
            }
        }

        info!(interval_changed = interval_changed, "Buffer settings updated");
        Ok(())
    }

    /// Records of failed flush groups, oldest first
    pub async fn dead_letters(&self) -> Vec<OperationRecord> {
        self.buffer.dead_letters().await
    }

    /// Retry dead-lettered records as one grouped flush
    pub async fn redrive_dead_letters(&self) -> FlushReport {
        self.buffer.redrive_dead_letters().await
    }
}

// =============================================================================
// Flush Timer
// =============================================================================

/// Recurring flush; ticks with an empty buffer only prune expired cache keys
struct FlushTimer {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    fn spawn(buffer: Arc<WriteBuffer>, projector: Arc<CacheProjector>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = interval.as_millis() as u64, "Flush timer started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Flush timer stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        projector.prune_known_keys();
                        if buffer.is_empty().await {
                            continue;
                        }
                        let report = buffer.flush().await;
                        debug!(
                            groups = report.groups.len(),
                            flushed = report.flushed_operations(),
                            "Timer flush completed"
                        );
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop ticking; a flush already running completes first
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("Flush timer task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::ModelSelection;
    use crate::db::MemoryDocumentStore;
    use crate::log::MemoryEventLog;
    use bson::doc;

    /// Log whose `subscribe` parks until the gate opens
    struct GatedLog {
        inner: MemoryEventLog,
        entered: tokio::sync::Notify,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl EventLog for GatedLog {
        async fn publish(&self, key: &str, payload: bytes::Bytes) -> Result<()> {
            self.inner.publish(key, payload).await
        }

        async fn subscribe(&self) -> Result<crate::log::LogStream> {
            let stream = self.inner.subscribe().await?;
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| BufferError::Connect(e.to_string()))?;
            Ok(stream)
        }

        async fn disconnect(&self) -> Result<()> {
            self.inner.disconnect().await
        }
    }

    fn coordinator(settings: BufferSettings) -> (BufferCoordinator, Arc<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let coordinator = BufferCoordinator::new(
            settings,
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemoryCache::with_defaults()),
            store.clone(),
        )
        .unwrap();
        (coordinator, store)
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_settings() {
        let result = BufferCoordinator::new(
            BufferSettings {
                max_buffer_size: 0,
                ..Default::default()
            },
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemoryCache::with_defaults()),
            Arc::new(MemoryDocumentStore::new()),
        );
        assert!(matches!(result, Err(BufferError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_lazy() {
        let (coordinator, _) = coordinator(BufferSettings::default());
        assert!(!coordinator.is_running());

        coordinator.create("users", doc! { "_id": 1 }).await.unwrap();
        assert!(coordinator.is_running());

        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_through_bypass_cases() {
        let (coordinator, _) = coordinator(BufferSettings {
            models: ModelSelection::only(["users"]),
            ..Default::default()
        });

        let by_email = doc! { "email": "a@b.c" };
        assert_eq!(
            coordinator.read_through("users", &by_email).await.unwrap(),
            CacheLookup::Bypass
        );
        assert_eq!(
            coordinator.read_through("orders", &doc! { "_id": 1 }).await.unwrap(),
            CacheLookup::Bypass
        );
        assert_eq!(
            coordinator.read_through("users", &doc! { "_id": 1 }).await.unwrap(),
            CacheLookup::Miss
        );

        let stats = coordinator.statistics().await;
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_disabled_read_through() {
        let (coordinator, _) = coordinator(BufferSettings {
            read_through: false,
            ..Default::default()
        });
        assert_eq!(
            coordinator.read_through("users", &doc! { "_id": 1 }).await.unwrap(),
            CacheLookup::Bypass
        );
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_rejects_appends() {
        let (coordinator, store) = coordinator(BufferSettings::default());
        coordinator.create("users", doc! { "_id": 1 }).await.unwrap();
        coordinator.create("users", doc! { "_id": 2 }).await.unwrap();

        coordinator.shutdown().await.unwrap();
        assert_eq!(store.documents("users").await.len(), 2);
        assert_eq!(coordinator.statistics().await.current_buffer_size, 0);

        let err = coordinator.create("users", doc! { "_id": 3 }).await.unwrap_err();
        assert!(matches!(err, BufferError::InvalidOperation(_)));
        assert!(coordinator.start().await.is_err());

        // Second shutdown is a no-op
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_replaces_settings() {
        let (coordinator, store) = coordinator(BufferSettings::default());
        coordinator.start().await.unwrap();

        coordinator
            .configure(BufferSettings {
                max_buffer_size: 1,
                flush_interval: Duration::from_millis(50),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(coordinator.settings().await.max_buffer_size, 1);

        coordinator.create("users", doc! { "_id": 1 }).await.unwrap();
        assert_eq!(store.documents("users").await.len(), 1);

        let invalid = BufferSettings {
            cache_ttl: Duration::ZERO,
            ..Default::default()
        };
        assert!(coordinator.configure(invalid).await.is_err());
        assert_eq!(coordinator.settings().await.max_buffer_size, 1);

        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_statistics() {
        let (coordinator, _) = coordinator(BufferSettings::default());
        coordinator.create("users", doc! { "_id": 1 }).await.unwrap();
        assert_eq!(coordinator.statistics().await.buffered_operations, 1);

        coordinator.reset_statistics();
        let stats = coordinator.statistics().await;
        assert_eq!(stats.buffered_operations, 0);
        // Gauges reflect live state, not counters
        assert_eq!(stats.current_buffer_size, 1);

        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_start_spawns_no_tasks() {
        let log = Arc::new(GatedLog {
            inner: MemoryEventLog::new(),
            entered: tokio::sync::Notify::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let coordinator = Arc::new(
            BufferCoordinator::new(
                BufferSettings::default(),
                log.clone(),
                Arc::new(MemoryCache::with_defaults()),
                Arc::new(MemoryDocumentStore::new()),
            )
            .unwrap(),
        );

        let starting = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.start().await }
        });
        log.entered.notified().await;

        coordinator.shutdown().await.unwrap();
        log.gate.add_permits(1);

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(BufferError::InvalidOperation(_))));
        assert!(!coordinator.is_running());

        let tasks = coordinator.tasks.lock().await;
        assert!(tasks.timer.is_none());
        assert!(tasks.subscriber.is_none());
    }
}
