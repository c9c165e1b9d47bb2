//! Mongo write buffer
//!
//! Buffers create, update and delete calls for selected models, publishes
//! each one to an event log, and flushes them to MongoDB as per-model bulk
//! writes. A subscriber on the same log projects every operation into a
//! cache so single-key reads can be served before the flush lands.
//!
//! Backends sit behind traits: [`log::EventLog`] (NATS JetStream),
//! [`cache::CacheStore`] (NATS KV or in-process) and [`db::DocumentStore`]
//! (MongoDB). In-memory implementations of each back the tests.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod log;
pub mod logging;
pub mod nats;
pub mod projection;
pub mod repository;
pub mod types;

pub use buffer::{FlushReport, OperationKind, OperationOptions, OperationRecord, Statistics};
pub use cache::CacheLookup;
pub use config::{Args, BufferSettings, FailurePolicy, ModelSelection};
pub use coordinator::BufferCoordinator;
pub use repository::{BufferedRepository, Entity, Repository, StoreRepository};
pub use types::{BufferError, Result};
