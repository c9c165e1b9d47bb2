//! Persistent document store

pub mod memory;
pub mod mongo;
pub mod store;
pub mod update;

pub use memory::MemoryDocumentStore;
pub use mongo::{MongoClient, MongoDocumentStore};
pub use store::{
    BulkWrite, BulkWriteResult, BulkWriteSummary, DocumentStore, UpdateSpec, WriteFailure,
    DUPLICATE_KEY_CODE,
};
