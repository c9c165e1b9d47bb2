//! Unbuffered repository over a document store

use std::sync::Arc;

use bson::{oid::ObjectId, Document};
use tracing::debug;

use super::{Entity, Repository};
use crate::buffer::OperationOptions;
use crate::db::DocumentStore;
use crate::types::Result;

/// Repository that reads and writes the document store directly
#[derive(Clone)]
pub struct StoreRepository {
    model: String,
    store: Arc<dyn DocumentStore>,
}

impl StoreRepository {
    pub fn new(model: &str, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            model: model.to_string(),
            store,
        }
    }
}

#[async_trait::async_trait]
impl Repository for StoreRepository {
    fn model(&self) -> &str {
        &self.model
    }

    async fn create(&self, mut document: Document) -> Result<Document> {
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        self.store.insert_one(&self.model, document.clone()).await?;
        debug!(model = self.model, "Document inserted directly");
        Ok(document)
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<()> {
        let matched = self
            .store
            .update_one(&self.model, filter, update, options.upsert)
            .await?;
        debug!(model = self.model, matched = matched, "Document updated directly");
        Ok(())
    }

    async fn delete_one(&self, filter: Document) -> Result<()> {
        let deleted = self.store.delete_one(&self.model, filter).await?;
        debug!(model = self.model, deleted = deleted, "Document deleted directly");
        Ok(())
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Entity>> {
        Ok(self
            .store
            .find_one(&self.model, filter)
            .await?
            .map(Entity::from_document))
    }

    async fn find(&self, filter: Document) -> Result<Vec<Entity>> {
        Ok(self
            .store
            .find(&self.model, filter)
            .await?
            .into_iter()
            .map(Entity::from_document)
            .collect())
    }
}
