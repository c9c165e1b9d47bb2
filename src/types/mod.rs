//! Shared types for the write buffer

pub mod error;

pub use error::{BufferError, Result};
