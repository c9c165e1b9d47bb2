//! Cache store on a NATS JetStream key/value bucket
//!
//! Expiry is bucket-wide (`max_age`), and every put restarts an entry's age,
//! so a write-through refreshes the TTL. KV keys accept only
//! `[-/_=.a-zA-Z0-9]`; cache keys are escaped before use.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::client::NatsClient;
use crate::cache::CacheStore;
use crate::types::{BufferError, Result};

/// [`CacheStore`] backed by a JetStream KV bucket
pub struct NatsKvCache {
    client: NatsClient,
    store: kv::Store,
    bucket: String,
    max_age: Duration,
}

impl NatsKvCache {
    /// Open the bucket, creating it when missing
    pub async fn new(client: &NatsClient, bucket: &str, ttl: Duration) -> Result<Self> {
        let context = client.jetstream();

        let store = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    max_age: ttl,
                    storage: jetstream::stream::StorageType::Memory,
                    ..Default::default()
                })
                .await
                .map_err(|e| BufferError::Connect(format!("Failed to create KV bucket: {}", e)))?,
        };

        info!(bucket = bucket, ttl_secs = ttl.as_secs(), "Using KV cache bucket");

        Ok(Self {
            client: client.clone(),
            store,
            bucket: bucket.to_string(),
            max_age: ttl,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Map a cache key onto the KV key alphabet
pub fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b':' => escaped.push('.'),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'/' => {
                escaped.push(byte as char)
            }
            other => escaped.push_str(&format!("={:02X}", other)),
        }
    }
    escaped
}

#[async_trait::async_trait]
impl CacheStore for NatsKvCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.store
            .get(escape_key(key))
            .await
            .map_err(|e| BufferError::Cache(format!("KV get failed: {}", e)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        if ttl != self.max_age {
            debug!(
                requested_secs = ttl.as_secs(),
                bucket_secs = self.max_age.as_secs(),
                "KV entries expire with the bucket max age"
            );
        }

        self.store
            .put(escape_key(key), value)
            .await
            .map_err(|e| BufferError::Cache(format!("KV put failed: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(escape_key(key))
            .await
            .map_err(|e| BufferError::Cache(format!("KV delete failed: {}", e)))
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.client.flush().await {
            warn!("KV cache flush on disconnect failed: {}", e);
        }
        info!(bucket = self.bucket, "Cache disconnected");
        Ok(())
    }
}
