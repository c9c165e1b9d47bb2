//! Configuration for the write buffer
//!
//! CLI arguments and environment variable handling using clap, plus the
//! runtime [`BufferSettings`] that `configure()` replaces at runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use uuid::Uuid;

/// Default buffer length that triggers an inline flush
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1000;

/// Default timer flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5000);

/// Default cache TTL (24 hours)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Default prefix for every cache key
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "mongo-buffer:";

/// Default event log topic
pub const DEFAULT_TOPIC: &str = "mongodb-operations";

/// Mongo write buffer - buffered writes, log replication, read-through cache
#[derive(Parser, Debug, Clone)]
#[command(name = "mongo-write-buffer")]
#[command(about = "Write buffering and read-through caching in front of MongoDB")]
pub struct Args {
    /// Unique identifier for this buffer instance
    #[arg(long, env = "INSTANCE_ID", default_value_t = Uuid::new_v4())]
    pub instance_id: Uuid,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "app")]
    pub mongodb_db: String,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Event log topic (JetStream stream name and subject prefix)
    #[arg(long, env = "LOG_TOPIC", default_value = DEFAULT_TOPIC)]
    pub log_topic: String,

    /// Cache backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value = "nats-kv")]
    pub cache_backend: CacheBackend,

    /// KV bucket used when the cache backend is nats-kv
    #[arg(long, env = "CACHE_BUCKET", default_value = "mongo-write-buffer")]
    pub cache_bucket: String,

    /// Prefix applied to every cache key
    #[arg(long, env = "CACHE_KEY_PREFIX", default_value = DEFAULT_CACHE_KEY_PREFIX)]
    pub cache_key_prefix: String,

    /// Models to buffer: "all" or a comma-separated allow-list
    #[arg(long, env = "BUFFER_MODELS", default_value = "all")]
    pub buffer_models: ModelSelection,

    /// Buffer length that triggers an inline flush
    #[arg(long, env = "BUFFER_MAX_SIZE", default_value = "1000")]
    pub buffer_max_size: usize,

    /// Timer flush interval in milliseconds
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value = "5000")]
    pub flush_interval_ms: u64,

    /// Cache entry TTL in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "86400")]
    pub cache_ttl_secs: u64,

    /// Master switch; when false every call passes straight to the store
    #[arg(long, env = "BUFFER_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub buffer_enabled: bool,

    /// Skip the cache on reads
    #[arg(long, env = "DISABLE_READ_THROUGH", default_value = "false")]
    pub disable_read_through: bool,

    /// What happens to records of a model group whose bulk write failed
    #[arg(long, env = "FAILURE_POLICY", value_enum, default_value = "dead-letter")]
    pub failure_policy: FailurePolicy,

    /// Maximum records held in the dead-letter queue
    #[arg(long, env = "DEAD_LETTER_CAPACITY", default_value = "10000")]
    pub dead_letter_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Default for NatsArgs {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".to_string(),
            nats_user: None,
            nats_password: None,
        }
    }
}

/// Cache backend selection
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// In-process DashMap cache
    Memory,
    /// JetStream key/value bucket
    NatsKv,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Handling of records whose model group failed to flush
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep failed records in a bounded dead-letter queue for redrive
    #[default]
    DeadLetter,
    /// Log and discard failed records
    Drop,
}

/// Which models go through the buffer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModelSelection {
    /// Every model is buffered
    #[default]
    All,
    /// Only the listed models are buffered
    Only(BTreeSet<String>),
}

impl ModelSelection {
    /// Build an allow-list from model names
    pub fn only<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(models.into_iter().map(Into::into).collect())
    }

    /// Check whether a model is buffered
    pub fn includes(&self, model: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(models) => models.contains(model),
        }
    }
}

impl FromStr for ModelSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let models: BTreeSet<String> = trimmed
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        if models.is_empty() {
            return Err("model list must be \"all\" or a comma-separated list".to_string());
        }
        Ok(Self::Only(models))
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Only(models) => {
                let list: Vec<&str> = models.iter().map(String::as_str).collect();
                write!(f, "{}", list.join(","))
            }
        }
    }
}

/// Runtime settings of the buffer, replaceable through `configure()`
#[derive(Debug, Clone)]
pub struct BufferSettings {
    /// Models routed through the buffer
    pub models: ModelSelection,
    /// Buffer length that triggers an inline flush
    pub max_buffer_size: usize,
    /// Timer flush interval
    pub flush_interval: Duration,
    /// Cache entry TTL, refreshed on every write-through
    pub cache_ttl: Duration,
    /// Master switch for buffering
    pub enabled: bool,
    /// Serve single-key reads from the cache
    pub read_through: bool,
    /// Handling of failed model groups
    pub failure_policy: FailurePolicy,
    /// Maximum dead-letter queue length
    pub dead_letter_capacity: usize,
    /// Prefix applied to every cache key
    pub cache_key_prefix: String,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            models: ModelSelection::All,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            cache_ttl: DEFAULT_CACHE_TTL,
            enabled: true,
            read_through: true,
            failure_policy: FailurePolicy::DeadLetter,
            dead_letter_capacity: 10_000,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }
}

impl BufferSettings {
    /// Whether writes and reads for a model go through the buffer
    pub fn should_buffer(&self, model: &str) -> bool {
        self.enabled && self.models.includes(model)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), String> {
        if self.max_buffer_size == 0 {
            return Err("max buffer size must be at least 1".to_string());
        }
        if self.flush_interval.is_zero() {
            return Err("flush interval must be greater than zero".to_string());
        }
        if self.cache_ttl.is_zero() {
            return Err("cache TTL must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl Args {
    /// Runtime settings derived from the command line
    pub fn settings(&self) -> BufferSettings {
        BufferSettings {
            models: self.buffer_models.clone(),
            max_buffer_size: self.buffer_max_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            enabled: self.buffer_enabled,
            read_through: !self.disable_read_through,
            failure_policy: self.failure_policy,
            dead_letter_capacity: self.dead_letter_capacity,
            cache_key_prefix: self.cache_key_prefix.clone(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.log_topic.is_empty() || self.log_topic.contains(['.', '*', '>', ' ']) {
            return Err(format!("LOG_TOPIC '{}' is not a valid stream name", self.log_topic));
        }
        self.settings().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_selection_parse() {
        assert_eq!("all".parse::<ModelSelection>().unwrap(), ModelSelection::All);
        assert_eq!("ALL".parse::<ModelSelection>().unwrap(), ModelSelection::All);

        let only: ModelSelection = "users, orders,,".parse().unwrap();
        assert!(only.includes("users"));
        assert!(only.includes("orders"));
        assert!(!only.includes("todos"));
        assert_eq!(only.to_string(), "orders,users");

        assert!(" , ".parse::<ModelSelection>().is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = BufferSettings::default();
        assert_eq!(settings.max_buffer_size, 1000);
        assert_eq!(settings.flush_interval, Duration::from_millis(5000));
        assert_eq!(settings.cache_ttl, Duration::from_secs(86_400));
        assert!(settings.enabled);
        assert!(settings.read_through);
        assert_eq!(settings.failure_policy, FailurePolicy::DeadLetter);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_should_buffer() {
        let mut settings = BufferSettings {
            models: ModelSelection::only(["users"]),
            ..Default::default()
        };
        assert!(settings.should_buffer("users"));
        assert!(!settings.should_buffer("orders"));

        settings.enabled = false;
        assert!(!settings.should_buffer("users"));
    }

    #[test]
    fn test_args_parse_and_validate() {
        let args = Args::parse_from([
            "mongo-write-buffer",
            "--buffer-models",
            "users,todos",
            "--buffer-max-size",
            "3",
            "--failure-policy",
            "drop",
            "--cache-backend",
            "memory",
            "--buffer-enabled",
            "false",
        ]);
        assert!(args.validate().is_ok());

        let settings = args.settings();
        assert_eq!(settings.max_buffer_size, 3);
        assert_eq!(settings.failure_policy, FailurePolicy::Drop);
        assert!(!settings.enabled);
        assert_eq!(args.cache_backend, CacheBackend::Memory);
        assert!(settings.models.includes("todos"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let settings = BufferSettings {
            max_buffer_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = BufferSettings {
            flush_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
