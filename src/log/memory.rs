//! In-process event log on a tokio broadcast channel

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use super::{EventLog, LogMessage, LogStream};
use crate::types::{BufferError, Result};

const DEFAULT_CAPACITY: usize = 4096;

/// [`EventLog`] for tests and single-process runs.
///
/// Keeps a copy of every published message for inspection. Publishing can be
/// switched off to simulate an unreachable log.
pub struct MemoryEventLog {
    sender: RwLock<Option<broadcast::Sender<(String, Bytes)>>>,
    published: Mutex<Vec<(String, Bytes)>>,
    unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with a bound on messages a slow subscriber may lag behind
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: RwLock::new(Some(sender)),
            published: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Toggle simulated unavailability
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages published so far, as `(key, payload)`
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().await.clone()
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BufferError::Publish("event log unavailable".into()));
        }

        let sender = self.sender.read().await;
        let sender = sender
            .as_ref()
            .ok_or_else(|| BufferError::Publish("event log disconnected".into()))?;

        self.published.lock().await.push((key.to_string(), payload.clone()));

        // No receivers is fine; the message is simply not consumed.
        if sender.send((key.to_string(), payload)).is_err() {
            debug!(key = key, "Published with no active subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<LogStream> {
        let sender = self.sender.read().await;
        let receiver = sender
            .as_ref()
            .ok_or_else(|| BufferError::Connect("event log disconnected".into()))?
            .subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok((key, payload)) => Some((Ok(LogMessage::new(key, payload)), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Log subscriber lagged behind");
                    Some((
                        Err(BufferError::Consume(format!(
                            "subscriber lagged, {} messages skipped",
                            skipped
                        ))),
                        receiver,
                    ))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the sender ends every subscriber stream
        self.sender.write().await.take();
        Ok(())
    }
}
