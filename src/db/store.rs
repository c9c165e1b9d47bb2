//! Persistent document store seam
//!
//! The flush engine talks to the backing store only through
//! [`DocumentStore`], so MongoDB can be swapped for the in-memory store in
//! tests and single-process development.

use bson::Document;
use serde::Serialize;

use crate::types::Result;

/// One buffered update, as issued inside a bulk write
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    pub filter: Document,
    pub update: Document,
    pub upsert: bool,
}

/// All writes for one model, applied creates, then updates, then deletes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWrite {
    /// Target collection
    pub model: String,
    /// Documents to insert
    pub creates: Vec<Document>,
    /// Update-one operations
    pub updates: Vec<UpdateSpec>,
    /// Delete-one filters
    pub deletes: Vec<Document>,
}

impl BulkWrite {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Default::default()
        }
    }

    /// Total operations in this write
    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of the first update
    pub fn updates_offset(&self) -> usize {
        self.creates.len()
    }

    /// Flat index of the first delete
    pub fn deletes_offset(&self) -> usize {
        self.creates.len() + self.updates.len()
    }
}

/// Counts reported by the store for one bulk write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkWriteSummary {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub deleted: u64,
}

/// Server error code for a unique index violation
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// One operation of a bulk write that was not applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteFailure {
    /// Position in the write's creates, then updates, then deletes
    pub index: usize,
    /// Server error code, when the store reported one
    pub code: Option<i32>,
    pub message: String,
}

impl WriteFailure {
    pub fn new(index: usize, code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            index,
            code,
            message: message.into(),
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == Some(DUPLICATE_KEY_CODE)
    }
}

/// Outcome of a bulk write the store accepted.
///
/// Writes are unordered, so some operations may fail while the rest apply.
/// `failures` lists exactly the operations that did not apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    pub summary: BulkWriteSummary,
    pub failures: Vec<WriteFailure>,
}

impl BulkWriteResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Backing document store
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply one model group's writes.
    ///
    /// `Err` means the group was rejected and nothing was applied. Partial
    /// application is reported through [`BulkWriteResult::failures`].
    async fn bulk_write(&self, write: &BulkWrite) -> Result<BulkWriteResult>;

    /// Insert a single document
    async fn insert_one(&self, model: &str, document: Document) -> Result<()>;

    /// Update the first matching document, returning the matched count
    async fn update_one(
        &self,
        model: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<u64>;

    /// Delete the first matching document, returning the deleted count
    async fn delete_one(&self, model: &str, filter: Document) -> Result<u64>;

    /// Find the first matching document
    async fn find_one(&self, model: &str, filter: Document) -> Result<Option<Document>>;

    /// Find all matching documents
    async fn find(&self, model: &str, filter: Document) -> Result<Vec<Document>>;
}
