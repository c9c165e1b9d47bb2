//! Error types for the write buffer
//!
//! Pattern adapted from doorway's gateway error enum: one flat enum with
//! string payloads, plus `From` conversions for the backend client errors.

/// Main error type for buffer, cache, log and store operations
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Event log unreachable while publishing an accepted operation.
    /// The operation stays buffered.
    #[error("Publish error: {0}")]
    Publish(String),

    /// A consumed log message could not be decoded or applied to the cache
    #[error("Consume error: {0}")]
    Consume(String),

    /// Bulk write for one model group failed
    #[error("Flush failed for model '{model}': {message}")]
    FlushGroup { model: String, message: String },

    /// A backend could not be reached at startup
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BufferError {
    /// Whether this error only delays cache consistency.
    ///
    /// Transient log and cache failures degrade to "delayed consistency"
    /// instead of failing the caller's write.
    pub fn is_degraded_consistency(&self) -> bool {
        matches!(self, Self::Publish(_) | Self::Consume(_) | Self::Cache(_))
    }
}

impl From<serde_json::Error> for BufferError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<bson::ser::Error> for BufferError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(format!("BSON error: {}", err))
    }
}

impl From<bson::de::Error> for BufferError {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(format!("BSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for BufferError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<async_nats::Error> for BufferError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

/// Result type alias for write buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;
