//! Log-to-cache projection
//!
//! The buffer's own consumer of the event log. Keeps the cache a projection
//! of logged writes; the document store remains the source of truth.

pub mod engine;
pub mod subscriber;

pub use engine::CacheProjector;
pub use subscriber::{spawn_subscriber, SubscriberHandle};
