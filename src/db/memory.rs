//! In-memory document store
//!
//! Same contract as the MongoDB store, backed by a map of collections.
//! Used for tests and memory-only development runs; keeps a log of every
//! bulk write it received so flush grouping can be inspected.

use std::collections::HashMap;
use std::time::Duration;

use bson::{Bson, Document};
use dashmap::DashSet;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::store::{
    BulkWrite, BulkWriteResult, BulkWriteSummary, DocumentStore, WriteFailure, DUPLICATE_KEY_CODE,
};
use super::update::{apply_update, matches_filter, upsert_document, values_equal};
use crate::types::{BufferError, Result};

/// In-memory [`DocumentStore`]
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    bulk_writes: Mutex<Vec<BulkWrite>>,
    failing_models: DashSet<String>,
    write_delay: RwLock<Option<Duration>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every bulk write for `model` fail until [`Self::heal_model`]
    pub fn fail_model(&self, model: &str) {
        self.failing_models.insert(model.to_string());
    }

    pub fn heal_model(&self, model: &str) {
        self.failing_models.remove(model);
    }

    /// Delay every bulk write, simulating a slow store
    pub async fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.write().await = delay;
    }

    /// Bulk writes received so far, in arrival order
    pub async fn bulk_writes(&self) -> Vec<BulkWrite> {
        self.bulk_writes.lock().await.clone()
    }

    /// All documents of a collection
    pub async fn documents(&self, model: &str) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(model)
            .cloned()
            .unwrap_or_default()
    }

    fn duplicate_id<'a>(collection: &[Document], document: &'a Document) -> Option<&'a Bson> {
        let id = document.get("_id")?;
        collection
            .iter()
            .any(|d| d.get("_id").is_some_and(|existing| values_equal(existing, id)))
            .then_some(id)
    }

    fn insert_into(collection: &mut Vec<Document>, document: Document) -> Result<()> {
        if let Some(id) = Self::duplicate_id(collection, &document) {
            return Err(BufferError::Database(format!("duplicate key _id: {}", id)));
        }
        collection.push(document);
        Ok(())
    }

    fn update_in(
        collection: &mut Vec<Document>,
        filter: &Document,
        update: &Document,
        upsert: bool,
        summary: &mut BulkWriteSummary,
    ) -> Result<()> {
        let position = collection.iter().position(|d| matches_filter(d, filter));
        if let Some(index) = position {
            let target = &mut collection[index];
            let before = target.clone();
            apply_update(target, update)?;
            summary.matched += 1;
            if *target != before {
                summary.modified += 1;
            }
        } else if upsert {
            let seeded = upsert_document(filter, update)?;
            Self::insert_into(collection, seeded)?;
            summary.upserted += 1;
        }
        Ok(())
    }

    fn delete_in(collection: &mut Vec<Document>, filter: &Document) -> u64 {
        match collection.iter().position(|d| matches_filter(d, filter)) {
            Some(index) => {
                collection.remove(index);
                1
            }
            None => 0,
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn bulk_write(&self, write: &BulkWrite) -> Result<BulkWriteResult> {
        let delay = *self.write_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.bulk_writes.lock().await.push(write.clone());

        if self.failing_models.contains(&write.model) {
            return Err(BufferError::Database(format!(
                "bulk write rejected for collection '{}'",
                write.model
            )));
        }

        let mut collections = self.collections.write().await;
        let collection = collections.entry(write.model.clone()).or_default();
        let mut result = BulkWriteResult::default();

        // Unordered: every operation is attempted, failures are collected.
        for (index, document) in write.creates.iter().enumerate() {
            if let Some(id) = Self::duplicate_id(collection, document) {
                result.failures.push(WriteFailure::new(
                    index,
                    Some(DUPLICATE_KEY_CODE),
                    format!("duplicate key _id: {}", id),
                ));
                continue;
            }
            collection.push(document.clone());
            result.summary.inserted += 1;
        }

        let offset = write.updates_offset();
        for (index, op) in write.updates.iter().enumerate() {
            let applied =
                Self::update_in(collection, &op.filter, &op.update, op.upsert, &mut result.summary);
            if let Err(e) = applied {
                result
                    .failures
                    .push(WriteFailure::new(offset + index, None, e.to_string()));
            }
        }

        for filter in &write.deletes {
            result.summary.deleted += Self::delete_in(collection, filter);
        }

        debug!(model = write.model, ops = write.len(), "Memory bulk write applied");
        if !result.is_complete() {
            warn!(
                model = write.model,
                failures = result.failures.len(),
                "Memory bulk write partly failed"
            );
        }
        Ok(result)
    }

    async fn insert_one(&self, model: &str, document: Document) -> Result<()> {
        let mut collections = self.collections.write().await;
        Self::insert_into(collections.entry(model.to_string()).or_default(), document)
    }

    async fn update_one(
        &self,
        model: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(model.to_string()).or_default();
        let mut summary = BulkWriteSummary::default();
        Self::update_in(collection, &filter, &update, upsert, &mut summary)?;
        Ok(summary.matched + summary.upserted)
    }

    async fn delete_one(&self, model: &str, filter: Document) -> Result<u64> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(model)
            .map(|c| Self::delete_in(c, &filter))
            .unwrap_or(0))
    }

    async fn find_one(&self, model: &str, filter: Document) -> Result<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(model)
            .and_then(|c| c.iter().find(|d| matches_filter(d, &filter)).cloned()))
    }

    async fn find(&self, model: &str, filter: Document) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(model)
            .map(|c| c.iter().filter(|d| matches_filter(d, &filter)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::UpdateSpec;
    use bson::doc;

    #[tokio::test]
    async fn test_bulk_write_applies_in_kind_order() {
        let store = MemoryDocumentStore::new();
        let write = BulkWrite {
            model: "users".into(),
            creates: vec![doc! { "_id": "a", "n": 1 }, doc! { "_id": "b", "n": 1 }],
            updates: vec![UpdateSpec {
                filter: doc! { "_id": "a" },
                update: doc! { "$inc": { "n": 1 } },
                upsert: false,
            }],
            deletes: vec![doc! { "_id": "b" }],
        };

        let result = store.bulk_write(&write).await.unwrap();
        assert!(result.is_complete());
        let summary = result.summary;
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.deleted, 1);

        let docs = store.documents("users").await;
        assert_eq!(docs, vec![doc! { "_id": "a", "n": 2 }]);
        assert_eq!(store.bulk_writes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails_but_rest_applies() {
        let store = MemoryDocumentStore::new();
        store.insert_one("users", doc! { "_id": "a" }).await.unwrap();

        let write = BulkWrite {
            model: "users".into(),
            creates: vec![doc! { "_id": "a" }, doc! { "_id": "c" }],
            ..Default::default()
        };
        let result = store.bulk_write(&write).await.unwrap();
        assert_eq!(result.summary.inserted, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].index, 0);
        assert!(result.failures[0].is_duplicate_key());
        assert_eq!(store.documents("users").await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_update_reports_flat_index() {
        let store = MemoryDocumentStore::new();
        let write = BulkWrite {
            model: "users".into(),
            creates: vec![doc! { "_id": "a", "n": 1 }],
            updates: vec![
                UpdateSpec {
                    filter: doc! { "_id": "a" },
                    update: doc! { "$inc": { "n": 1 } },
                    upsert: false,
                },
                UpdateSpec {
                    filter: doc! { "_id": "a" },
                    update: doc! { "$push": { "tags": "x" } },
                    upsert: false,
                },
            ],
            ..Default::default()
        };

        let result = store.bulk_write(&write).await.unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].index, 2);
        assert!(!result.failures[0].is_duplicate_key());
        assert_eq!(store.documents("users").await, vec![doc! { "_id": "a", "n": 2 }]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryDocumentStore::new();
        store.fail_model("orders");

        let write = BulkWrite {
            model: "orders".into(),
            creates: vec![doc! { "_id": 1 }],
            ..Default::default()
        };
        assert!(store.bulk_write(&write).await.is_err());
        assert!(store.documents("orders").await.is_empty());

        store.heal_model("orders");
        assert!(store.bulk_write(&write).await.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let store = MemoryDocumentStore::new();
        let matched = store
            .update_one("users", doc! { "_id": "u1" }, doc! { "$set": { "name": "Ada" } }, true)
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let found = store.find_one("users", doc! { "_id": "u1" }).await.unwrap();
        assert_eq!(found, Some(doc! { "_id": "u1", "name": "Ada" }));
        assert_eq!(store.find("users", doc! {}).await.unwrap().len(), 1);
        assert_eq!(store.delete_one("users", doc! { "_id": "u1" }).await.unwrap(), 1);
        assert!(store.find_one("users", doc! { "_id": "u1" }).await.unwrap().is_none());
    }
}
