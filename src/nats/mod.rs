//! NATS backends: JetStream event log and KV cache

pub mod client;
pub mod jetstream;
pub mod kv;

pub use client::NatsClient;
pub use jetstream::NatsEventLog;
pub use kv::{escape_key, NatsKvCache};
