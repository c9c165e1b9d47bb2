//! Mongo write buffer service
//!
//! Connects the buffer to MongoDB and NATS, runs the log subscriber and the
//! flush timer until interrupted, then flushes and shuts down.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use mongo_write_buffer::{
    cache::{spawn_cleanup_task, CacheStore, MemoryCache},
    config::{Args, CacheBackend},
    db::{MongoClient, MongoDocumentStore},
    logging,
    nats::{NatsClient, NatsEventLog, NatsKvCache},
    BufferCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_format)?;

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let settings = args.settings();

    info!("======================================");
    info!("  Mongo Write Buffer");
    info!("======================================");
    info!("Instance ID: {}", args.instance_id);
    info!("MongoDB: {} / {}", args.mongodb_uri, args.mongodb_db);
    info!("NATS: {}", args.nats.nats_url);
    info!("Log topic: {}", args.log_topic);
    info!("Cache: {:?}", args.cache_backend);
    info!("Models: {}", settings.models);
    info!("Enabled: {}", settings.enabled);
    info!("======================================");

    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => client,
        Err(e) => {
            error!("MongoDB connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let nats_name = format!("mongo-write-buffer-{}", args.instance_id);
    let nats = match NatsClient::new(&args.nats, &nats_name).await {
        Ok(client) => client,
        Err(e) => {
            error!("NATS connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let log = Arc::new(NatsEventLog::new(&nats, &args.log_topic).await?);

    let mut cleanup_task = None;
    let cache: Arc<dyn CacheStore> = match args.cache_backend {
        CacheBackend::Memory => {
            let cache = Arc::new(MemoryCache::with_defaults());
            cleanup_task = Some(spawn_cleanup_task(Arc::clone(&cache)));
            cache
        }
        CacheBackend::NatsKv => {
            Arc::new(NatsKvCache::new(&nats, &args.cache_bucket, settings.cache_ttl).await?)
        }
    };

    let coordinator = BufferCoordinator::new(
        settings,
        log,
        cache,
        Arc::new(MongoDocumentStore::new(mongo)),
    )?;
    coordinator.start().await?;

    info!("Write buffer running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let result = coordinator.shutdown().await;
    if let Some(task) = cleanup_task {
        task.abort();
    }

    let stats = coordinator.statistics().await;
    info!(
        "Final statistics: {}",
        serde_json::to_string(&stats).unwrap_or_default()
    );

    if let Err(e) = result {
        error!("Shutdown error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
