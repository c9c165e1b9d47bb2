//! End-to-end buffer behavior over the in-memory log, cache and store

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson};
use tokio_test::{assert_err, assert_ok};

use mongo_write_buffer::cache::MemoryCache;
use mongo_write_buffer::config::{BufferSettings, FailurePolicy, ModelSelection};
use mongo_write_buffer::db::{DocumentStore, MemoryDocumentStore};
use mongo_write_buffer::log::{EventLog, MemoryEventLog};
use mongo_write_buffer::{
    BufferCoordinator, BufferError, BufferedRepository, CacheLookup, OperationOptions,
    OperationRecord, Repository, StoreRepository,
};

struct Harness {
    store: Arc<MemoryDocumentStore>,
    log: Arc<MemoryEventLog>,
    coordinator: Arc<BufferCoordinator>,
}

impl Harness {
    fn new(settings: BufferSettings) -> Self {
        let store = Arc::new(MemoryDocumentStore::new());
        let log = Arc::new(MemoryEventLog::new());
        let coordinator = Arc::new(
            BufferCoordinator::new(
                settings,
                log.clone(),
                Arc::new(MemoryCache::with_defaults()),
                store.clone(),
            )
            .unwrap(),
        );
        Self {
            store,
            log,
            coordinator,
        }
    }

    fn repository(&self, model: &str) -> BufferedRepository<StoreRepository> {
        BufferedRepository::new(
            StoreRepository::new(model, self.store.clone()),
            self.coordinator.clone(),
        )
    }

    /// Wait until the projector has consumed `count` log messages
    async fn wait_for_messages(&self, count: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if self.coordinator.statistics().await.log_messages >= count {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("projector consumed fewer than {} messages", count);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn settings() -> BufferSettings {
    BufferSettings {
        flush_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

#[tokio::test]
async fn threshold_flush_groups_by_model() {
    let h = Harness::new(BufferSettings {
        max_buffer_size: 3,
        ..settings()
    });
    let c = &h.coordinator;

    c.create("users", doc! { "_id": "a", "name": "A" }).await.unwrap();
    c.update(
        "orders",
        doc! { "_id": "b" },
        doc! { "$set": { "status": "paid" } },
        OperationOptions::default(),
    )
    .await
    .unwrap();
    assert!(h.store.bulk_writes().await.is_empty());

    c.create("users", doc! { "_id": "c", "name": "C" }).await.unwrap();

    let writes = h.store.bulk_writes().await;
    assert_eq!(writes.len(), 2);
    let users = writes.iter().find(|w| w.model == "users").unwrap();
    assert_eq!(users.creates.len(), 2);
    assert!(users.updates.is_empty());
    let orders = writes.iter().find(|w| w.model == "orders").unwrap();
    assert_eq!(orders.updates.len(), 1);
    assert!(orders.creates.is_empty());

    let stats = c.statistics().await;
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.current_buffer_size, 0);

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn threshold_triggers_exactly_one_flush() {
    let h = Harness::new(BufferSettings {
        max_buffer_size: 2,
        ..settings()
    });

    h.coordinator.create("users", doc! { "_id": 1 }).await.unwrap();
    assert_eq!(h.coordinator.statistics().await.current_buffer_size, 1);
    h.coordinator.create("users", doc! { "_id": 2 }).await.unwrap();

    assert_eq!(h.store.bulk_writes().await.len(), 1);
    assert_eq!(h.store.documents("users").await.len(), 2);
    assert_eq!(h.coordinator.statistics().await.current_buffer_size, 0);

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn timer_flushes_once_and_skips_empty_buffer() {
    let h = Harness::new(BufferSettings {
        flush_interval: Duration::from_millis(50),
        ..Default::default()
    });

    h.coordinator.create("users", doc! { "_id": 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(h.store.bulk_writes().await.len(), 1);
    assert_eq!(h.store.documents("users").await.len(), 1);
    assert_eq!(h.coordinator.statistics().await.flushes, 1);

    // Explicit flush of an empty buffer is a no-op too
    assert!(h.coordinator.flush().await.is_empty());

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_after_create_leaves_no_cache_entry() {
    let h = Harness::new(settings());
    let c = &h.coordinator;

    c.create("users", doc! { "_id": 42, "name": "Ada" }).await.unwrap();
    h.wait_for_messages(1).await;
    assert!(c.read_through("users", &doc! { "_id": 42 }).await.unwrap().is_hit());

    c.delete("users", doc! { "_id": 42 }).await.unwrap();
    h.wait_for_messages(2).await;
    assert_eq!(
        c.read_through("users", &doc! { "_id": 42 }).await.unwrap(),
        CacheLookup::Miss
    );
    assert_eq!(c.statistics().await.cache_key_count, 0);

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_group_does_not_block_others() {
    let h = Harness::new(settings());
    let c = &h.coordinator;
    h.store.fail_model("orders");

    c.create("users", doc! { "_id": 1 }).await.unwrap();
    c.create("orders", doc! { "_id": 1, "total": 5 }).await.unwrap();

    let report = c.flush().await;
    assert!(report.group("users").unwrap().is_success());
    assert!(!report.group("orders").unwrap().is_success());
    assert!(matches!(
        report.errors().as_slice(),
        [BufferError::FlushGroup { model, .. }] if model == "orders"
    ));

    assert_eq!(h.store.documents("users").await.len(), 1);
    assert!(h.store.documents("orders").await.is_empty());

    let stats = c.statistics().await;
    assert_eq!(stats.flushed_operations, 1);
    assert_eq!(stats.failed_operations, 1);
    assert_eq!(stats.dead_letters, 1);

    // Redrive once the store recovers
    h.store.heal_model("orders");
    let redrive = c.redrive_dead_letters().await;
    assert!(redrive.is_success());
    assert_eq!(h.store.documents("orders").await.len(), 1);
    assert!(c.dead_letters().await.is_empty());

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn drop_policy_discards_failed_group() {
    let h = Harness::new(BufferSettings {
        failure_policy: FailurePolicy::Drop,
        ..settings()
    });
    h.store.fail_model("orders");

    h.coordinator.create("orders", doc! { "_id": 1 }).await.unwrap();
    let report = h.coordinator.flush().await;
    assert_eq!(report.failed_operations(), 1);
    assert!(h.coordinator.dead_letters().await.is_empty());

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn replayed_message_leaves_same_cache_state() {
    let h = Harness::new(settings());
    let c = &h.coordinator;

    c.create("users", doc! { "_id": 1, "count": 0 }).await.unwrap();
    h.wait_for_messages(1).await;

    let increment = OperationRecord::update(
        "users",
        doc! { "_id": 1 },
        doc! { "$inc": { "count": 1 } },
        OperationOptions::default(),
    )
    .unwrap();
    let payload = increment.to_bytes().unwrap();
    h.log.publish(&increment.log_key(), payload.clone()).await.unwrap();
    h.log.publish(&increment.log_key(), payload).await.unwrap();
    h.wait_for_messages(3).await;

    let cached = c
        .read_through("users", &doc! { "_id": 1 })
        .await
        .unwrap()
        .into_document()
        .unwrap();
    assert_eq!(cached.get_i32("count").unwrap(), 1);
    assert_eq!(c.statistics().await.consume_failures, 0);

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn appends_during_flush_wait_for_next_flush() {
    let h = Harness::new(settings());
    h.store.set_write_delay(Some(Duration::from_millis(100))).await;

    h.coordinator.create("users", doc! { "_id": 1 }).await.unwrap();

    let coordinator = h.coordinator.clone();
    let flushing = tokio::spawn(async move { coordinator.flush().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.coordinator.create("users", doc! { "_id": 2 }).await.unwrap();
    let first = flushing.await.unwrap();
    assert_eq!(first.flushed_operations(), 1);
    assert_eq!(h.coordinator.statistics().await.current_buffer_size, 1);

    h.store.set_write_delay(None).await;
    let second = h.coordinator.flush().await;
    assert_eq!(second.flushed_operations(), 1);

    let writes = h.store.bulk_writes().await;
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].creates, vec![doc! { "_id": 1 }]);
    assert_eq!(writes[1].creates, vec![doc! { "_id": 2 }]);

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_flushes_remaining_writes() {
    let h = Harness::new(settings());
    let users = h.repository("users");

    users.create(doc! { "_id": 1 }).await.unwrap();
    users
        .update_one(
            doc! { "_id": 1 },
            doc! { "$set": { "name": "Ada" } },
            OperationOptions::default(),
        )
        .await
        .unwrap();
    assert!(h.store.documents("users").await.is_empty());

    assert_ok!(h.coordinator.shutdown().await);
    assert_eq!(
        h.store.documents("users").await,
        vec![doc! { "_id": 1, "name": "Ada" }]
    );
    assert_err!(users.create(doc! { "_id": 2 }).await);
}

#[tokio::test]
async fn read_after_write_served_from_cache() {
    let h = Harness::new(settings());
    let users = h.repository("users");

    let created = users.create(doc! { "name": "Ada" }).await.unwrap();
    let id = created.get("_id").cloned().unwrap();
    h.wait_for_messages(1).await;

    let entity = users.find_by_id(id.clone()).await.unwrap().unwrap();
    assert_eq!(entity.get("name"), Some(&Bson::String("Ada".into())));
    assert!(h.store.documents("users").await.is_empty());

    let stats = h.coordinator.statistics().await;
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.store_queries, 0);

    // Saving a cached entity buffers only the changed field
    let mut entity = entity;
    entity.set("name", "Grace");
    users.save(&mut entity).await.unwrap();
    h.wait_for_messages(2).await;

    let reloaded = users.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(reloaded.get("name"), Some(&Bson::String("Grace".into())));

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn disabled_buffer_passes_every_call_through() {
    let h = Harness::new(BufferSettings {
        enabled: false,
        ..settings()
    });
    let users = h.repository("users");

    users.create(doc! { "_id": 1 }).await.unwrap();
    assert_eq!(h.store.documents("users").await.len(), 1);
    assert!(h.log.published().await.is_empty());
    assert!(users.find_by_id(Bson::Int32(1)).await.unwrap().is_some());

    let stats = h.coordinator.statistics().await;
    assert_eq!(stats.buffered_operations, 0);
    assert_eq!(stats.cache_misses, 0);
}

#[tokio::test]
async fn allow_list_buffers_only_listed_models() {
    let h = Harness::new(BufferSettings {
        models: ModelSelection::only(["users"]),
        ..settings()
    });
    let users = h.repository("users");
    let orders = h.repository("orders");

    users.create(doc! { "_id": 1 }).await.unwrap();
    orders.create(doc! { "_id": 1 }).await.unwrap();

    assert!(h.store.documents("users").await.is_empty());
    assert_eq!(h.store.documents("orders").await.len(), 1);
    assert_eq!(h.log.published().await.len(), 1);

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn publish_failure_keeps_write_buffered() {
    let h = Harness::new(settings());
    let users = h.repository("users");
    h.coordinator.start().await.unwrap();
    h.log.set_unavailable(true);

    users.create(doc! { "_id": 7 }).await.unwrap();
    assert_eq!(
        h.coordinator
            .read_through("users", &doc! { "_id": 7 })
            .await
            .unwrap(),
        CacheLookup::Miss
    );

    let err = h.coordinator.create("users", doc! { "_id": 8 }).await.unwrap_err();
    assert!(err.is_degraded_consistency());

    h.log.set_unavailable(false);
    let report = h.coordinator.flush().await;
    assert_eq!(report.flushed_operations(), 2);
    assert_eq!(h.coordinator.statistics().await.publish_failures, 2);

    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn string_and_integer_ids_are_cached_apart() {
    let h = Harness::new(settings());
    let c = &h.coordinator;

    c.create("users", doc! { "_id": "42", "name": "Text" }).await.unwrap();
    h.wait_for_messages(1).await;

    assert!(c.read_through("users", &doc! { "_id": "42" }).await.unwrap().is_hit());
    assert_eq!(
        c.read_through("users", &doc! { "_id": 42 }).await.unwrap(),
        CacheLookup::Miss
    );

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn partial_failure_redrive_applies_each_operation_once() {
    let h = Harness::new(settings());
    h.store.insert_one("orders", doc! { "_id": 1, "n": 0 }).await.unwrap();
    let c = &h.coordinator;

    c.create("orders", doc! { "_id": 1 }).await.unwrap();
    c.update(
        "orders",
        doc! { "_id": 1 },
        doc! { "$inc": { "n": 1 } },
        OperationOptions::default(),
    )
    .await
    .unwrap();

    let report = c.flush().await;
    assert_eq!(report.flushed_operations(), 1);
    assert_eq!(report.failed_operations(), 1);
    assert_eq!(c.dead_letters().await.len(), 1);

    assert!(c.redrive_dead_letters().await.is_success());
    c.redrive_dead_letters().await;

    assert!(c.dead_letters().await.is_empty());
    assert_eq!(h.store.documents("orders").await, vec![doc! { "_id": 1, "n": 1 }]);

    c.shutdown().await.unwrap();
}
