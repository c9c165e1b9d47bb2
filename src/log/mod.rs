//! Event log seam
//!
//! Every accepted operation is published once, keyed by `model-kind`. The
//! buffer's own subscriber reads the same topic to keep the cache current.
//! Delivery is at-least-once; consumers acknowledge after applying.

pub mod memory;

pub use memory::MemoryEventLog;

use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::types::Result;

/// Stream of consumed log messages
pub type LogStream = BoxStream<'static, Result<LogMessage>>;

/// Acknowledgement handle for one delivered message
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// One delivered message
pub struct LogMessage {
    /// Routing key (`model-kind`)
    pub key: String,
    /// Serialized operation record
    pub payload: Bytes,
    acker: Option<Box<dyn Acknowledge>>,
}

impl LogMessage {
    /// A message that needs no acknowledgement
    pub fn new(key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            key: key.into(),
            payload,
            acker: None,
        }
    }

    /// A message acknowledged through `acker`
    pub fn with_ack(key: impl Into<String>, payload: Bytes, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            key: key.into(),
            payload,
            acker: Some(acker),
        }
    }

    /// Acknowledge the message; a no-op for backends without acks
    pub async fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMessage")
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .field("acked", &self.acker.is_none())
            .finish()
    }
}

/// Ordered publish/subscribe channel
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Publish one serialized operation under its routing key
    async fn publish(&self, key: &str, payload: Bytes) -> Result<()>;

    /// Start consuming new messages from the tail of the topic
    async fn subscribe(&self) -> Result<LogStream>;

    /// Flush outstanding publishes and release the connection
    async fn disconnect(&self) -> Result<()>;
}
