//! Read-after-write cache
//!
//! Holds a best-effort projection of recently logged writes. The document
//! store stays authoritative: a miss never means "does not exist".

pub mod keys;
pub mod store;

pub use keys::{canonical_json, filter_digest, single_id, CacheKeys};
pub use store::{spawn_cleanup_task, CacheStore, MemoryCache};

use std::time::Duration;

use bson::Document;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Result;

/// In-process cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before oldest-first eviction
    pub max_entries: usize,
    /// Interval between expired-entry sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Result of a cache-backed read
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Document served from the cache
    Hit(Document),
    /// Eligible but not cached; query the store
    Miss,
    /// Not eligible for the cache; query the store
    Bypass,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// The cached document, if any
    pub fn into_document(self) -> Option<Document> {
        match self {
            Self::Hit(document) => Some(document),
            Self::Miss | Self::Bypass => None,
        }
    }
}

/// Operation ids remembered per cached document, besides the latest
pub const RECENT_OPS_WINDOW: usize = 16;

/// Value stored under a cache key: the projected document and the ids of the
/// operations that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub op_id: Uuid,
    pub document: Document,
    /// Earlier operations on this key, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_ops: Vec<Uuid>,
}

impl CachedDocument {
    pub fn new(op_id: Uuid, document: Document) -> Self {
        Self {
            op_id,
            document,
            recent_ops: Vec::new(),
        }
    }

    /// Whether `op_id` already produced this entry or one it replaced
    pub fn has_applied(&self, op_id: Uuid) -> bool {
        self.op_id == op_id || self.recent_ops.contains(&op_id)
    }

    /// Entry for `document` written by `op_id`, remembering this entry's ids
    pub fn succeeded_by(mut self, op_id: Uuid, document: Document) -> Self {
        self.recent_ops.push(self.op_id);
        if self.recent_ops.len() > RECENT_OPS_WINDOW {
            let excess = self.recent_ops.len() - RECENT_OPS_WINDOW;
            self.recent_ops.drain(..excess);
        }
        self.op_id = op_id;
        self.document = document;
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_lookup_helpers() {
        let hit = CacheLookup::Hit(doc! { "_id": 1 });
        assert!(hit.is_hit());
        assert_eq!(hit.into_document(), Some(doc! { "_id": 1 }));
        assert!(!CacheLookup::Miss.is_hit());
        assert_eq!(CacheLookup::Bypass.into_document(), None);
    }

    #[test]
    fn test_cached_document_decode_rejects_garbage() {
        assert!(CachedDocument::decode(b"{\"document\":{}}").is_err());
        assert!(CachedDocument::decode(b"[]").is_err());
    }

    #[test]
    fn test_recent_ops_window_is_bounded() {
        let first = Uuid::new_v4();
        let mut entry = CachedDocument::new(first, doc! { "n": 0 });

        let last = RECENT_OPS_WINDOW as i32 + 1;
        let mut ids = vec![first];
        for n in 1..=last {
            let id = Uuid::new_v4();
            entry = entry.succeeded_by(id, doc! { "n": n });
            ids.push(id);
        }

        assert_eq!(entry.recent_ops.len(), RECENT_OPS_WINDOW);
        assert!(!entry.has_applied(first));
        assert!(ids[1..].iter().all(|id| entry.has_applied(*id)));
        assert_eq!(entry.document, doc! { "n": last });
    }

    #[test]
    fn test_entry_without_history_decodes() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"op_id":"{}","document":{{"_id":1}}}}"#, id);
        let entry = CachedDocument::decode(json.as_bytes()).unwrap();
        assert!(entry.recent_ops.is_empty());
        assert!(entry.has_applied(id));
    }
}
