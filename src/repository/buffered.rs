//! Buffered repository decorator
//!
//! Wraps any [`Repository`]. For models the coordinator buffers, writes
//! become operation records and single-key reads try the cache first. Other
//! models, and reads the cache cannot serve, go to the wrapped repository.

use std::sync::Arc;

use bson::Document;
use tracing::{debug, warn};

use super::{Entity, Repository};
use crate::buffer::{FlushReport, OperationOptions, OperationRecord};
use crate::cache::CacheLookup;
use crate::coordinator::BufferCoordinator;
use crate::types::{BufferError, Result};

/// Repository that routes buffered models through the write buffer
pub struct BufferedRepository<R> {
    inner: R,
    coordinator: Arc<BufferCoordinator>,
}

impl<R: Repository> BufferedRepository<R> {
    pub fn new(inner: R, coordinator: Arc<BufferCoordinator>) -> Self {
        Self { inner, coordinator }
    }

    /// The wrapped repository, bypassing the buffer and the cache
    pub fn direct(&self) -> &R {
        &self.inner
    }

    pub fn coordinator(&self) -> &Arc<BufferCoordinator> {
        &self.coordinator
    }

    /// Flush every buffered write, not only this model's
    pub async fn flush(&self) -> FlushReport {
        self.coordinator.flush().await
    }

    async fn is_buffered(&self) -> bool {
        self.coordinator.should_buffer(self.inner.model()).await
    }

    /// Append a record. A publish failure leaves the record buffered, so the
    /// write still succeeds.
    async fn append(&self, record: OperationRecord) -> Result<()> {
        match self.coordinator.append(record).await {
            Ok(record) => {
                debug!(
                    op_id = %record.id(),
                    model = record.model(),
                    kind = %record.kind(),
                    "Write buffered"
                );
                Ok(())
            }
            Err(BufferError::Publish(message)) => {
                warn!(
                    model = self.inner.model(),
                    error = message,
                    "Write buffered without log publish"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl<R: Repository> Repository for BufferedRepository<R> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn create(&self, document: Document) -> Result<Document> {
        if !self.is_buffered().await {
            return self.inner.create(document).await;
        }

        let record = OperationRecord::create(self.inner.model(), document)?;
        let created = record.payload().cloned().unwrap_or_default();
        self.append(record).await?;
        Ok(created)
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<()> {
        if !self.is_buffered().await {
            return self.inner.update_one(filter, update, options).await;
        }

        let record = OperationRecord::update(self.inner.model(), filter, update, options)?;
        self.append(record).await
    }

    async fn delete_one(&self, filter: Document) -> Result<()> {
        if !self.is_buffered().await {
            return self.inner.delete_one(filter).await;
        }

        let record = OperationRecord::delete(self.inner.model(), filter)?;
        self.append(record).await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Entity>> {
        match self
            .coordinator
            .read_through(self.inner.model(), &filter)
            .await?
        {
            CacheLookup::Hit(document) => Ok(Some(Entity::from_document(document))),
            CacheLookup::Miss => {
                self.coordinator.record_store_query();
                self.inner.find_one(filter).await
            }
            CacheLookup::Bypass => self.inner.find_one(filter).await,
        }
    }

    async fn find(&self, filter: Document) -> Result<Vec<Entity>> {
        self.inner.find(filter).await
    }
}
