//! NATS client wrapper
//!
//! Connection management shared by the JetStream event log and the KV cache.

use std::time::Duration;

use async_nats::{jetstream, Client, ConnectOptions};
use tracing::info;

use crate::config::NatsArgs;
use crate::types::{BufferError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Initial connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// NATS client wrapper with JetStream support
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
    name: String,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        // No retry_on_initial_connect(): an unreachable server is a startup error.
        // Reconnection still applies after the first successful connect.
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(CONNECT_TIMEOUT);

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| BufferError::Connect(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            name: name.to_string(),
        })
    }

    /// Get the underlying NATS client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the JetStream context
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Flush pending messages
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BufferError::Nats(format!("Flush failed: {}", e)))
    }

    /// Get the client name
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    // Integration tests would require a running NATS server with JetStream
}
