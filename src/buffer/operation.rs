//! Operation records - immutable descriptions of one pending write

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bson::{oid::ObjectId, Document};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BufferError, Result};

/// Process-local ordering hint shared by every record
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Kind of buffered write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write modifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOptions {
    #[serde(default)]
    pub upsert: bool,
}

impl OperationOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// One pending write.
///
/// Records are built through [`OperationRecord::create`],
/// [`OperationRecord::update`] and [`OperationRecord::delete`] and cannot be
/// changed afterwards. Updates and deletes always carry a filter; creates
/// always carry a payload with an `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    id: Uuid,
    model: String,
    kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Document>,
    #[serde(default)]
    options: OperationOptions,
    sequence: u64,
    /// Milliseconds since the Unix epoch
    timestamp: i64,
}

impl OperationRecord {
    /// Record an insert. A fresh `ObjectId` is assigned when `_id` is missing.
    pub fn create(model: &str, mut document: Document) -> Result<Self> {
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        Self::build(model, OperationKind::Create, None, Some(document), OperationOptions::default())
    }

    /// Record an update of the documents selected by `filter`
    pub fn update(
        model: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<Self> {
        if update.is_empty() {
            return Err(BufferError::InvalidOperation(format!(
                "empty update expression for model '{}'",
                model
            )));
        }
        Self::build(model, OperationKind::Update, Some(filter), Some(update), options)
    }

    /// Record a delete of the document selected by `filter`
    pub fn delete(model: &str, filter: Document) -> Result<Self> {
        Self::build(model, OperationKind::Delete, Some(filter), None, OperationOptions::default())
    }

    fn build(
        model: &str,
        kind: OperationKind,
        filter: Option<Document>,
        payload: Option<Document>,
        options: OperationOptions,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(BufferError::InvalidOperation("model name is empty".into()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            model: model.to_string(),
            kind,
            filter,
            payload,
            options,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn filter(&self) -> Option<&Document> {
        self.filter.as_ref()
    }

    pub fn payload(&self) -> Option<&Document> {
        self.payload.as_ref()
    }

    pub fn options(&self) -> OperationOptions {
        self.options
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Event log routing key, `model-kind`
    pub fn log_key(&self) -> String {
        format!("{}-{}", self.model, self.kind)
    }

    /// Serialize to JSON bytes for the event log
    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Deserialize from JSON bytes, re-checking the per-kind shape
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let record: Self = serde_json::from_slice(data)?;
        record.check_shape()?;
        Ok(record)
    }

    fn check_shape(&self) -> Result<()> {
        let ok = match self.kind {
            OperationKind::Create => self.payload.is_some(),
            OperationKind::Update => self.filter.is_some() && self.payload.is_some(),
            OperationKind::Delete => self.filter.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(BufferError::Serialization(format!(
                "{} record {} is missing its filter or payload",
                self.kind, self.id
            )))
        }
    }
}
