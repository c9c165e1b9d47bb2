//! Cache store seam and the in-process TTL cache

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::CacheConfig;
use crate::types::{BufferError, Result};

/// Key/value store with per-write TTL
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a live entry
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write an entry, replacing any previous value and refreshing its TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove an entry; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release the backend connection
    async fn disconnect(&self) -> Result<()>;
}

/// A cached value with its expiry
#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(data: Bytes, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`CacheStore`] on a DashMap
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    evictions: AtomicU64,
    /// Reject writes, simulating an unreachable cache
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            evictions: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Number of stored entries, expired ones included until cleanup
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Toggle simulated unavailability
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BufferError::Cache("cache unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Remove expired entries
    pub fn cleanup(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(count = removed, "Cleaned up expired cache entries");
        }
        removed
    }

    /// Evict oldest entries when over capacity
    fn maybe_evict(&self) {
        if self.entries.len() <= self.config.max_entries {
            return;
        }

        let to_evict = self.entries.len() - self.config.max_entries;
        let mut entries: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.created_at))
            .collect();
        entries.sort_by_key(|(_, created)| *created);

        for (key, _) in entries.into_iter().take(to_evict) {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        debug!(evicted = to_evict, "Evicted cache entries");
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.data.clone()));
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.entries.insert(key.to_string(), CacheEntry::new(value, ttl));
        self.maybe_evict();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Spawn a background task that periodically drops expired entries
pub fn spawn_cleanup_task(cache: Arc<MemoryCache>) -> JoinHandle<()> {
    let interval = cache.config.cleanup_interval;

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = cache.cleanup();
            debug!(
                removed = removed,
                entries = cache.len(),
                evictions = cache.evictions(),
                "Cache cleanup completed"
            );
        }
    });

    info!("Cache cleanup task started");
    handle
}
