//! Event log on a NATS JetStream stream
//!
//! The topic is the stream name; each message goes to `<topic>.<model>-<kind>`.
//! Every buffer instance reads through its own ephemeral pull consumer that
//! starts at the tail of the stream and acks explicitly.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream};
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::NatsClient;
use crate::log::{Acknowledge, EventLog, LogMessage, LogStream};
use crate::types::{BufferError, Result};

/// Retention of logged operations
const STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Ephemeral consumers are removed after this much inactivity
const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(60);

/// Prefix of per-instance consumer names
pub const CONSUMER_NAME_PREFIX: &str = "mongo-write-buffer";

/// [`EventLog`] backed by a JetStream stream
pub struct NatsEventLog {
    client: NatsClient,
    topic: String,
    consumer_name: String,
}

impl NatsEventLog {
    /// Ensure the stream exists and prepare a per-instance consumer name
    pub async fn new(client: &NatsClient, topic: &str) -> Result<Self> {
        let log = Self {
            client: client.clone(),
            topic: topic.to_string(),
            consumer_name: consumer_name(),
        };
        log.ensure_stream().await?;
        Ok(log)
    }

    /// Subject a routing key publishes to
    pub fn subject(&self, key: &str) -> String {
        format!("{}.{}", self.topic, key)
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    async fn ensure_stream(&self) -> Result<Stream> {
        let stream = self
            .client
            .jetstream()
            .get_or_create_stream(jetstream::stream::Config {
                name: self.topic.clone(),
                subjects: vec![format!("{}.>", self.topic)],
                max_age: STREAM_MAX_AGE,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BufferError::Connect(format!("Failed to create stream: {}", e)))?;

        info!("Using stream {} with subjects {}.>", self.topic, self.topic);
        Ok(stream)
    }

    async fn create_consumer(&self, stream: &Stream) -> Result<PullConsumer> {
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                name: Some(self.consumer_name.clone()),
                deliver_policy: jetstream::consumer::DeliverPolicy::New,
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                filter_subject: format!("{}.>", self.topic),
                inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
                ..Default::default()
            })
            .await
            .map_err(|e| BufferError::Connect(format!("Failed to create consumer: {}", e)))?;

        info!("Using consumer {}", self.consumer_name);
        Ok(consumer)
    }
}

/// `mongo-write-buffer-<8 hex chars>`
fn consumer_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", CONSUMER_NAME_PREFIX, &id[..8])
}

struct JetStreamAck(jetstream::Message);

#[async_trait::async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|e| BufferError::Consume(format!("Ack failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl EventLog for NatsEventLog {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<()> {
        let subject = self.subject(key);
        let ack = self
            .client
            .jetstream()
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| BufferError::Publish(format!("Publish to {} failed: {}", subject, e)))?;

        // Wait for the server to persist the message
        ack.await
            .map_err(|e| BufferError::Publish(format!("Publish to {} not acked: {}", subject, e)))?;

        debug!(subject = subject, "Published operation");
        Ok(())
    }

    async fn subscribe(&self) -> Result<LogStream> {
        let stream = self.ensure_stream().await?;
        let consumer = self.create_consumer(&stream).await?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BufferError::Connect(format!("Failed to open message stream: {}", e)))?;

        let prefix = format!("{}.", self.topic);
        let stream = messages.map(move |item| match item {
            Ok(message) => {
                let subject = message.subject.as_str();
                let key = subject.strip_prefix(&prefix).unwrap_or(subject).to_string();
                let payload = message.payload.clone();
                Ok(LogMessage::with_ack(key, payload, Box::new(JetStreamAck(message))))
            }
            Err(e) => Err(BufferError::Consume(format!("JetStream delivery failed: {}", e))),
        });

        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.flush().await?;

        match self.client.jetstream().get_stream(&self.topic).await {
            Ok(stream) => {
                if let Err(e) = stream.delete_consumer(&self.consumer_name).await {
                    // Ephemeral consumers expire on their own
                    debug!("Consumer {} not deleted: {}", self.consumer_name, e);
                }
            }
            Err(e) => warn!("Stream {} unavailable on disconnect: {}", self.topic, e),
        }

        info!("Event log disconnected");
        Ok(())
    }
}
