//! Image Worker - consumes image tasks and writes compressed derivatives
//!
//! Each task downloads one source image, compresses it, uploads the result
//! to S3 and records the URL on the product. Several workers can share the
//! same consumer group.
//!
//! Environment variables (see `Config::from_env` for the full list):
//! - DATABASE_URL: PostgreSQL URL for the catalog
//! - REDIS_URL: Redis holding the task stream
//! - IMAGE_QUEUE_NAME / IMAGE_QUEUE_GROUP / IMAGE_QUEUE_CONSUMER
//! - S3_BUCKET, AWS_REGION, S3_ENDPOINT, S3_BASE_URL, S3_PATH_STYLE
//! - WORKER_CONCURRENCY: tasks handled in parallel (default: 4)
//! - WORKER_MAX_DELIVERIES: deliveries before a task is dead-lettered (default: 5)
//! - COMPRESSION_CODEC / COMPRESSION_QUALITY / COMPRESSION_MAX_DIMENSION

use anyhow::Context;
use product_service::db::{self, PgDeadLetterStore, PgProductStore};
use product_service::services::{ImageCompressor, ImageWorker, Reconciler, S3ObjectStore};
use product_service::Config;
use std::sync::Arc;
use task_queue::{subscribe, RedisStreamQueue};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("image_worker=info".parse()?)
                .add_directive("product_service=info".parse()?)
                .add_directive("task_queue=info".parse()?),
        )
        .init();

    info!("Starting Image Worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        bucket = %config.s3.bucket,
        stream = %config.queue.stream,
        group = %config.queue.group,
        codec = ?config.compression.codec,
        quality = config.compression.quality,
        "Configuration loaded"
    );

    let pool = db::init_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to initialize database")?;

    let s3 = s3_utils::connect(config.s3.clone()).await;
    if let Err(e) = s3.head_bucket().await {
        warn!(bucket = %config.s3.bucket, error = %e, "S3 bucket is not reachable yet");
    }
    let object_store = S3ObjectStore::new(s3, config.worker.fetch_timeout())
        .context("Failed to build object store")?;
    info!("Object store initialized");

    let worker = ImageWorker::new(
        Arc::new(object_store),
        Arc::new(ImageCompressor::new(config.compression.clone())),
        Reconciler::new(Arc::new(PgProductStore::new(pool.clone()))),
        Arc::new(PgDeadLetterStore::new(pool)),
        config.worker.worker_config(),
    );

    let queue = Arc::new(
        RedisStreamQueue::connect(&config.queue.redis_url, config.queue.stream_config())
            .await
            .context("Failed to connect to image queue")?,
    );
    info!(consumer = %queue.config().consumer, "Queue consumer initialized");

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl+c");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let stats = subscribe(
        queue,
        Arc::new(worker),
        config.worker.consumer_options(),
        shutdown_rx,
    )
    .await
    .context("Image consumer stopped with an error")?;

    info!(
        received = stats.received,
        acked = stats.acked,
        requeued = stats.requeued,
        returned = stats.returned_on_shutdown,
        reclaimed = stats.reclaimed,
        "Image Worker stopped"
    );
    Ok(())
}
