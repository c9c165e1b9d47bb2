//! Entity access
//!
//! [`Repository`] is the per-model operation set callers program against.
//! [`StoreRepository`] talks to the document store directly;
//! [`BufferedRepository`] decorates any repository and routes buffered
//! models through the write buffer and the read-through cache.

pub mod buffered;
pub mod store;

pub use buffered::BufferedRepository;
pub use store::StoreRepository;

use std::collections::BTreeSet;

use bson::{doc, Bson, Document};

use crate::buffer::OperationOptions;
use crate::types::{BufferError, Result};

/// A document with change tracking.
///
/// New entities are inserted on save. Loaded entities record which top-level
/// fields were set or unset, and saving them issues only those changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    document: Document,
    is_new: bool,
    modified: BTreeSet<String>,
}

impl Entity {
    /// A new, unsaved entity
    pub fn new(document: Document) -> Self {
        Self {
            document,
            is_new: true,
            modified: BTreeSet::new(),
        }
    }

    /// An entity loaded from the store or the cache
    pub fn from_document(document: Document) -> Self {
        Self {
            document,
            is_new: false,
            modified: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> Option<&Bson> {
        self.document.get("_id")
    }

    pub fn get(&self, field: &str) -> Option<&Bson> {
        self.document.get(field)
    }

    /// Set a field and mark it modified
    pub fn set(&mut self, field: &str, value: impl Into<Bson>) {
        self.document.insert(field, value.into());
        self.mark_modified(field);
    }

    /// Remove a field and mark it modified
    pub fn unset(&mut self, field: &str) {
        if self.document.remove(field).is_some() {
            self.mark_modified(field);
        }
    }

    fn mark_modified(&mut self, field: &str) {
        if !self.is_new {
            self.modified.insert(field.to_string());
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }

    pub fn modified_fields(&self) -> impl Iterator<Item = &str> {
        self.modified.iter().map(String::as_str)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    /// Filter selecting this entity by `_id`
    pub fn id_filter(&self) -> Result<Document> {
        let id = self
            .id()
            .cloned()
            .ok_or_else(|| BufferError::InvalidOperation("entity has no _id".into()))?;
        Ok(doc! { "_id": id })
    }

    /// `$set` / `$unset` update for the tracked changes, if any
    pub fn changes(&self) -> Option<Document> {
        if self.modified.is_empty() {
            return None;
        }

        let mut set = Document::new();
        let mut unset = Document::new();
        for field in &self.modified {
            match self.document.get(field) {
                Some(value) => {
                    set.insert(field.clone(), value.clone());
                }
                None => {
                    unset.insert(field.clone(), "");
                }
            }
        }

        let mut update = Document::new();
        if !set.is_empty() {
            update.insert("$set", set);
        }
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }
        Some(update)
    }

    /// Reset tracking after a successful save
    fn mark_saved(&mut self, document: Document) {
        self.document = document;
        self.is_new = false;
        self.modified.clear();
    }
}

/// Entity operations for one model
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Model (collection) name
    fn model(&self) -> &str;

    /// Insert a document, returning it with its `_id`
    async fn create(&self, document: Document) -> Result<Document>;

    /// Insert several documents
    async fn create_many(&self, documents: Vec<Document>) -> Result<Vec<Document>> {
        let mut created = Vec::with_capacity(documents.len());
        for document in documents {
            created.push(self.create(document).await?);
        }
        Ok(created)
    }

    /// Update the first document matching `filter`
    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<()>;

    /// Delete the first document matching `filter`
    async fn delete_one(&self, filter: Document) -> Result<()>;

    async fn find_one(&self, filter: Document) -> Result<Option<Entity>>;

    async fn find(&self, filter: Document) -> Result<Vec<Entity>>;

    async fn find_by_id(&self, id: Bson) -> Result<Option<Entity>> {
        self.find_one(doc! { "_id": id }).await
    }

    /// Insert a new entity or write a loaded entity's changes.
    /// Saving an unchanged loaded entity does nothing.
    async fn save(&self, entity: &mut Entity) -> Result<()> {
        if entity.is_new() {
            let created = self.create(entity.document().clone()).await?;
            entity.mark_saved(created);
            return Ok(());
        }

        if let Some(changes) = entity.changes() {
            self.update_one(entity.id_filter()?, changes, OperationOptions::default())
                .await?;
            let document = entity.document().clone();
            entity.mark_saved(document);
        }
        Ok(())
    }

    /// Delete a loaded entity by `_id`
    async fn remove(&self, entity: &Entity) -> Result<()> {
        self.delete_one(entity.id_filter()?).await
    }
}
