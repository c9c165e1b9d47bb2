//! Cache key generation
//!
//! Documents are cached under `<prefix><model>:<tag>:<id>`, where the tag
//! names the identifier's BSON type (`oid`, `s`, `i`), so the string `"42"`
//! and the integer `42` never share a key. Filters that are not a
//! single identifier map to `<prefix><model>:query:<sha256>` over a canonical
//! (recursively key-sorted) JSON rendering of the filter, so two filters that
//! differ only in key order share a key.

use bson::{Bson, Document};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::buffer::{OperationKind, OperationRecord};

/// Builds cache keys for one key prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of a single document
    pub fn document(&self, model: &str, id: &Bson) -> String {
        format!("{}{}:{}", self.prefix, model, id_segment(id))
    }

    /// Key for an arbitrary filter: the document key when the filter names
    /// one identifier, a digest key otherwise
    pub fn filter(&self, model: &str, filter: &Document) -> String {
        match single_id(filter) {
            Some(id) => self.document(model, id),
            None => format!("{}{}:query:{}", self.prefix, model, filter_digest(filter)),
        }
    }

    /// Key a record's result is projected to, if it has one
    pub fn record(&self, record: &OperationRecord) -> Option<String> {
        match record.kind() {
            OperationKind::Create => record
                .payload()
                .and_then(|doc| doc.get("_id"))
                .map(|id| self.document(record.model(), id)),
            OperationKind::Update | OperationKind::Delete => {
                record.filter().map(|f| self.filter(record.model(), f))
            }
        }
    }

    /// Key for a read, or `None` when the filter is not eligible for the cache
    pub fn lookup(&self, model: &str, filter: &Document) -> Option<String> {
        single_id(filter).map(|id| self.document(model, id))
    }
}

/// The identifier of a filter of the exact shape `{ _id: <scalar> }`
pub fn single_id(filter: &Document) -> Option<&Bson> {
    if filter.len() != 1 {
        return None;
    }
    let id = filter.get("_id")?;
    matches!(
        id,
        Bson::ObjectId(_) | Bson::String(_) | Bson::Int32(_) | Bson::Int64(_)
    )
    .then_some(id)
}

/// Type-tagged identifier. Both integer widths share `i:`, matching how the
/// store compares them.
fn id_segment(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => format!("oid:{}", oid.to_hex()),
        Bson::String(s) => format!("s:{}", s),
        Bson::Int32(n) => format!("i:{}", n),
        Bson::Int64(n) => format!("i:{}", n),
        other => format!("x:{}", canonical_json(&other.clone().into_relaxed_extjson())),
    }
}

/// Hex SHA-256 of the canonical JSON form of a filter
pub fn filter_digest(filter: &Document) -> String {
    let json = Bson::Document(filter.clone()).into_relaxed_extjson();
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&json).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize with object keys sorted at every depth
pub fn canonical_json(value: &JsonValue) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), sort_keys(inner));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
