//! Buffer statistics
//!
//! Counters are shared by the producer path, the flush path and the log
//! subscriber. They never reset implicitly.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters
#[derive(Debug, Default)]
pub struct BufferMetrics {
    buffered_operations: AtomicU64,
    flushed_operations: AtomicU64,
    failed_operations: AtomicU64,
    flushes: AtomicU64,
    log_messages: AtomicU64,
    publish_failures: AtomicU64,
    consume_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    store_queries: AtomicU64,
}

impl BufferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_buffered(&self) {
        self.buffered_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, flushed: u64, failed: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_operations.fetch_add(flushed, Ordering::Relaxed);
        self.failed_operations.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_log_message(&self) {
        self.log_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consume_failure(&self) {
        self.consume_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_query(&self) {
        self.store_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.buffered_operations,
            &self.flushed_operations,
            &self.failed_operations,
            &self.flushes,
            &self.log_messages,
            &self.publish_failures,
            &self.consume_failures,
            &self.cache_hits,
            &self.cache_misses,
            &self.store_queries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Snapshot the counters together with the current gauges
    pub fn snapshot(
        &self,
        current_buffer_size: usize,
        cache_key_count: usize,
        dead_letters: usize,
    ) -> Statistics {
        Statistics {
            buffered_operations: self.buffered_operations.load(Ordering::Relaxed),
            flushed_operations: self.flushed_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            log_messages: self.log_messages.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            consume_failures: self.consume_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            store_queries: self.store_queries.load(Ordering::Relaxed),
            current_buffer_size,
            cache_key_count,
            dead_letters,
        }
    }
}

/// Point-in-time statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Operations accepted into the buffer
    pub buffered_operations: u64,
    /// Operations written by successful group flushes
    pub flushed_operations: u64,
    /// Operations the store did not apply
    pub failed_operations: u64,
    /// Non-empty flushes performed
    pub flushes: u64,
    /// Log messages consumed by the cache projector
    pub log_messages: u64,
    pub publish_failures: u64,
    pub consume_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Reads that fell through to the document store
    pub store_queries: u64,
    pub current_buffer_size: usize,
    /// Keys the projector has written and not yet removed
    pub cache_key_count: usize,
    pub dead_letters: usize,
}

impl Statistics {
    /// Cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}
