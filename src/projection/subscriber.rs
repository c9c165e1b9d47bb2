//! Log subscriber - feeds consumed log messages to the cache projector
//!
//! Runs as a background task until shut down or until the log stream ends.
//! Per-message failures are handled by the projector and never end the loop.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::engine::CacheProjector;
use crate::log::LogStream;

/// Handle to a running subscriber task
pub struct SubscriberHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl SubscriberHandle {
    /// Signal shutdown and wait for the task to finish its current message
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("Log subscriber task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn the subscriber loop over an opened log stream
pub fn spawn_subscriber(
    projector: Arc<CacheProjector>,
    mut stream: LogStream,
) -> SubscriberHandle {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

    let handle = tokio::spawn(async move {
        info!("Log subscriber started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Log subscriber shutting down");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(message)) => projector.handle(message).await,
                        Some(Err(e)) => projector.record_delivery_error(&e),
                        None => {
                            info!("Log stream closed, subscriber stopping");
                            break;
                        }
                    }
                }
            }
        }
    });

    SubscriberHandle {
        shutdown_tx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferMetrics, OperationRecord};
    use crate::cache::{CacheStore, MemoryCache};
    use crate::config::BufferSettings;
    use crate::log::{EventLog, MemoryEventLog};
    use bson::doc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn test_subscriber_projects_and_survives_bad_messages() {
        let log = MemoryEventLog::new();
        let cache = Arc::new(MemoryCache::with_defaults());
        let metrics = Arc::new(BufferMetrics::new());
        let settings = Arc::new(RwLock::new(BufferSettings {
            cache_key_prefix: String::new(),
            ..Default::default()
        }));
        let projector = Arc::new(CacheProjector::new(cache.clone(), settings, metrics.clone()));

        let handle = spawn_subscriber(projector, log.subscribe().await.unwrap());

        log.publish("users-create", bytes::Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let record = OperationRecord::create("users", doc! { "_id": 5 }).unwrap();
        log.publish(&record.log_key(), record.to_bytes().unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while metrics.snapshot(0, 0, 0).log_messages < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber did not consume both messages");

        assert_eq!(metrics.snapshot(0, 0, 0).consume_failures, 1);
        assert!(cache.get("users:i:5").await.unwrap().is_some());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_subscriber_stops_when_log_disconnects() {
        let log = MemoryEventLog::new();
        let projector = Arc::new(CacheProjector::new(
            Arc::new(MemoryCache::with_defaults()),
            Arc::new(RwLock::new(BufferSettings::default())),
            Arc::new(BufferMetrics::new()),
        ));

        let handle = spawn_subscriber(projector, log.subscribe().await.unwrap());
        log.disconnect().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("subscriber did not stop");
    }
}
