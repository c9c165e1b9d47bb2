//! MongoDB client and document store
//!
//! Pattern adapted from doorway's MongoDB wrapper. Bulk writes are issued as
//! raw unordered `insert` / `update` / `delete` commands, split into batches
//! that stay under the server's count and size limits.

use std::ops::Range;

use bson::{doc, Bson, Document};
use futures_util::StreamExt;
use mongodb::{options::UpdateOptions, Client, Collection, Database};
use tracing::{debug, error, info, warn};

use super::store::{BulkWrite, BulkWriteResult, DocumentStore, WriteFailure};
use crate::types::{BufferError, Result};

/// Server limit on operations per write command (`maxWriteBatchSize`)
const MAX_WRITE_BATCH: usize = 100_000;

/// Encoded operations per command, kept below the 16 MiB document limit
const MAX_BATCH_BYTES: usize = 16 * 1024 * 1024 - 64 * 1024;

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and verify the connection with a ping
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast when the server is unreachable
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BufferError::Connect(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BufferError::Connect(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get the configured database
    pub fn database(&self) -> Database {
        self.client.database(&self.db_name)
    }

    /// Get an untyped collection
    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.database().collection::<Document>(name)
    }

    /// Get the raw MongoDB client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// [`DocumentStore`] backed by MongoDB
#[derive(Clone)]
pub struct MongoDocumentStore {
    mongo: MongoClient,
}

impl MongoDocumentStore {
    pub fn new(mongo: MongoClient) -> Self {
        Self { mongo }
    }

    pub fn client(&self) -> &MongoClient {
        &self.mongo
    }

    /// Run one write command over `ops` in batches.
    ///
    /// Returns the replies of the batches the server accepted. Operations it
    /// rejected, and every operation of a batch that failed outright, are
    /// added to `result.failures` at `offset` plus their position in `ops`.
    async fn run_batched(
        &self,
        model: &str,
        (verb, field): (&str, &str),
        ops: &[Document],
        offset: usize,
        result: &mut BulkWriteResult,
    ) -> Vec<Document> {
        let sizes: Vec<usize> = ops
            .iter()
            .map(|op| bson::to_vec(op).map(|bytes| bytes.len()).unwrap_or(0))
            .collect();

        let mut replies = Vec::new();
        for range in batch_ranges(&sizes, MAX_WRITE_BATCH, MAX_BATCH_BYTES) {
            // The command name must be the first field
            let mut command = Document::new();
            command.insert(verb, model);
            command.insert(field, ops[range.clone()].to_vec());
            command.insert("ordered", false);

            match self.mongo.database().run_command(command).await {
                Ok(reply) => {
                    result.failures.extend(write_errors(&reply, offset + range.start));
                    if let Ok(concern) = reply.get_document("writeConcernError") {
                        warn!(
                            model = model,
                            command = verb,
                            error = concern.get_str("errmsg").unwrap_or("unknown"),
                            "Write concern not satisfied"
                        );
                    }
                    replies.push(reply);
                }
                Err(e) => {
                    error!(model = model, command = verb, error = %e, "Write command failed");
                    let message = format!("{} {} failed: {}", model, verb, e);
                    result.failures.extend(
                        range.map(|i| WriteFailure::new(offset + i, None, message.clone())),
                    );
                }
            }
        }
        replies
    }
}

/// Split operations into consecutive batches bounded by count and bytes.
/// An operation larger than `max_bytes` gets a batch of its own.
fn batch_ranges(sizes: &[usize], max_count: usize, max_bytes: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, size) in sizes.iter().enumerate() {
        if i > start && (i - start >= max_count || bytes + size > max_bytes) {
            ranges.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }
    if start < sizes.len() {
        ranges.push(start..sizes.len());
    }
    ranges
}

/// Failures listed in a reply's `writeErrors`, indexed from `base`
fn write_errors(reply: &Document, base: usize) -> Vec<WriteFailure> {
    let Ok(errors) = reply.get_array("writeErrors") else {
        return Vec::new();
    };

    errors
        .iter()
        .filter_map(Bson::as_document)
        .map(|e| {
            let index = match e.get("index") {
                Some(Bson::Int32(n)) => usize::try_from(*n).unwrap_or(0),
                Some(Bson::Int64(n)) => usize::try_from(*n).unwrap_or(0),
                _ => 0,
            };
            WriteFailure::new(
                base + index,
                e.get_i32("code").ok(),
                e.get_str("errmsg").unwrap_or("unknown error"),
            )
        })
        .collect()
}

/// Read a numeric field from a command reply
fn reply_count(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}

#[async_trait::async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn bulk_write(&self, write: &BulkWrite) -> Result<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        let model = write.model.as_str();

        if !write.creates.is_empty() {
            let replies = self
                .run_batched(model, ("insert", "documents"), &write.creates, 0, &mut result)
                .await;
            result.summary.inserted = replies.iter().map(|r| reply_count(r, "n")).sum();
        }

        if !write.updates.is_empty() {
            let updates: Vec<Document> = write
                .updates
                .iter()
                .map(|u| {
                    doc! {
                        "q": u.filter.clone(),
                        "u": u.update.clone(),
                        "upsert": u.upsert,
                        "multi": false,
                    }
                })
                .collect();
            let offset = write.updates_offset();
            let replies = self
                .run_batched(model, ("update", "updates"), &updates, offset, &mut result)
                .await;

            for reply in &replies {
                let upserted = reply.get_array("upserted").map(|a| a.len() as u64).unwrap_or(0);
                result.summary.upserted += upserted;
                result.summary.matched += reply_count(reply, "n").saturating_sub(upserted);
                result.summary.modified += reply_count(reply, "nModified");
            }
        }

        if !write.deletes.is_empty() {
            let deletes: Vec<Document> = write
                .deletes
                .iter()
                .map(|filter| doc! { "q": filter.clone(), "limit": 1 })
                .collect();
            let offset = write.deletes_offset();
            let replies = self
                .run_batched(model, ("delete", "deletes"), &deletes, offset, &mut result)
                .await;
            result.summary.deleted = replies.iter().map(|r| reply_count(r, "n")).sum();
        }

        debug!(
            model = model,
            inserted = result.summary.inserted,
            modified = result.summary.modified,
            deleted = result.summary.deleted,
            failures = result.failures.len(),
            "Bulk write applied"
        );
        Ok(result)
    }

    async fn insert_one(&self, model: &str, document: Document) -> Result<()> {
        self.mongo
            .collection(model)
            .insert_one(document)
            .await
            .map_err(|e| BufferError::Database(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    async fn update_one(
        &self,
        model: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<u64> {
        let options = UpdateOptions::builder().upsert(upsert).build();
        let result = self
            .mongo
            .collection(model)
            .update_one(filter, update)
            .with_options(options)
            .await
            .map_err(|e| BufferError::Database(format!("Update failed: {}", e)))?;

        Ok(result.matched_count + u64::from(result.upserted_id.is_some()))
    }

    async fn delete_one(&self, model: &str, filter: Document) -> Result<u64> {
        let result = self
            .mongo
            .collection(model)
            .delete_one(filter)
            .await
            .map_err(|e| BufferError::Database(format!("Delete failed: {}", e)))?;
        Ok(result.deleted_count)
    }

    async fn find_one(&self, model: &str, filter: Document) -> Result<Option<Document>> {
        self.mongo
            .collection(model)
            .find_one(filter)
            .await
            .map_err(|e| BufferError::Database(format!("Find failed: {}", e)))
    }

    async fn find(&self, model: &str, filter: Document) -> Result<Vec<Document>> {
        let cursor = self
            .mongo
            .collection(model)
            .find(filter)
            .await
            .map_err(|e| BufferError::Database(format!("Find failed: {}", e)))?;

        let results: Vec<Document> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests would require a running MongoDB instance

    #[test]
    fn test_reply_count() {
        let reply = doc! { "n": 3, "nModified": 2_i64, "ok": 1.0 };
        assert_eq!(reply_count(&reply, "n"), 3);
        assert_eq!(reply_count(&reply, "nModified"), 2);
        assert_eq!(reply_count(&reply, "missing"), 0);
        assert_eq!(reply_count(&reply, "ok"), 0);
    }

    #[test]
    fn test_write_errors_are_offset() {
        let reply = doc! {
            "n": 1,
            "writeErrors": [
                { "index": 0, "code": 11000, "errmsg": "E11000 duplicate key" },
                { "index": 2, "code": 2, "errmsg": "bad update" },
            ],
            "ok": 1.0,
        };
        let failures = write_errors(&reply, 5);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].index, 5);
        assert!(failures[0].is_duplicate_key());
        assert_eq!(failures[1].index, 7);
        assert_eq!(failures[1].code, Some(2));
        assert!(write_errors(&doc! { "n": 3 }, 0).is_empty());
    }

    #[test]
    fn test_batch_ranges_split_by_count_and_size() {
        assert_eq!(batch_ranges(&[1; 5], 2, 100), vec![0..2, 2..4, 4..5]);
        assert_eq!(batch_ranges(&[40, 40, 40], 10, 100), vec![0..2, 2..3]);
        // Oversized operations still go out alone
        assert_eq!(batch_ranges(&[10, 500, 10], 10, 100), vec![0..1, 1..2, 2..3]);
        assert!(batch_ranges(&[], 10, 100).is_empty());
    }

    #[test]
    fn test_batch_ranges_under_limits_is_one_batch() {
        let sizes = vec![1_000; 1_000];
        assert_eq!(batch_ranges(&sizes, MAX_WRITE_BATCH, MAX_BATCH_BYTES), vec![0..1_000]);
    }
}
