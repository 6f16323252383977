/// Configuration management for product-service
///
/// Loads configuration from environment variables with sensible defaults.
/// Both binaries read the same `Config`; each uses the sections it needs.
use resilience::RetryConfig;
use s3_utils::S3Config;
use std::str::FromStr;
use std::time::Duration;
use task_queue::{ConsumerOptions, StreamQueueConfig};
use tracing::warn;

use crate::error::{AppError, Result};
use crate::services::compression::{Codec, CompressionConfig};
use crate::services::worker::WorkerConfig;

pub const DEFAULT_QUEUE_NAME: &str = "image_processing_queue";
pub const DEFAULT_QUEUE_GROUP: &str = "image-workers";

#[derive(Clone, Debug)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub s3: S3Config,
    pub worker: WorkerSettings,
    pub compression: CompressionConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    /// Consumer name for this worker; random when unset
    pub consumer: Option<String>,
}

impl QueueConfig {
    pub fn stream_config(&self) -> StreamQueueConfig {
        let config = StreamQueueConfig::new(self.stream.clone(), self.group.clone());
        match &self.consumer {
            Some(name) => config.with_consumer(name.clone()),
            None => config,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub block_ms: u64,
    pub max_deliveries: u32,
    pub reclaim_idle_secs: u64,
    pub reclaim_interval_secs: u64,
    pub fetch_max_retries: u32,
    pub upload_max_retries: u32,
    pub fetch_timeout_secs: u64,
}

impl WorkerSettings {
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            batch_size: self.batch_size,
            block: Duration::from_millis(self.block_ms),
            concurrency: self.concurrency,
            reclaim_interval: Duration::from_secs(self.reclaim_interval_secs),
            reclaim_min_idle: Duration::from_secs(self.reclaim_idle_secs),
            ..ConsumerOptions::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_deliveries: self.max_deliveries,
            fetch_retry: RetryConfig {
                max_retries: self.fetch_max_retries,
                ..RetryConfig::default()
            },
            upload_retry: RetryConfig {
                max_retries: self.upload_max_retries,
                ..RetryConfig::default()
            },
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Parse `key`, falling back to `default` when unset or unparseable
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparseable environment value");
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let codec = match std::env::var("COMPRESSION_CODEC") {
            Ok(raw) => Codec::from_str(&raw)
                .map_err(|e| AppError::Configuration(format!("COMPRESSION_CODEC: {}", e)))?,
            Err(_) => Codec::Jpeg,
        };

        let quality: u8 = env_parse("COMPRESSION_QUALITY", 80);
        if !(1..=100).contains(&quality) {
            return Err(AppError::Configuration(format!(
                "COMPRESSION_QUALITY must be between 1 and 100, got {}",
                quality
            )));
        }

        let max_dimension: u32 = env_parse("COMPRESSION_MAX_DIMENSION", 1600);
        if max_dimension == 0 {
            return Err(AppError::Configuration(
                "COMPRESSION_MAX_DIMENSION must be positive".to_string(),
            ));
        }

        let max_deliveries: u32 = env_parse("WORKER_MAX_DELIVERIES", 5);
        if max_deliveries == 0 {
            return Err(AppError::Configuration(
                "WORKER_MAX_DELIVERIES must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            app: AppConfig {
                host: env_string("PRODUCT_SERVICE_HOST", "0.0.0.0"),
                port: env_parse("PRODUCT_SERVICE_PORT", 8080),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", "postgresql://localhost/catalog"),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            },
            queue: QueueConfig {
                redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
                stream: env_string("IMAGE_QUEUE_NAME", DEFAULT_QUEUE_NAME),
                group: env_string("IMAGE_QUEUE_GROUP", DEFAULT_QUEUE_GROUP),
                consumer: std::env::var("IMAGE_QUEUE_CONSUMER")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
            s3: S3Config::from_env(),
            worker: WorkerSettings {
                concurrency: env_parse("WORKER_CONCURRENCY", 4usize).max(1),
                batch_size: env_parse("WORKER_BATCH_SIZE", 10usize).max(1),
                block_ms: env_parse("WORKER_BLOCK_MS", 5000),
                max_deliveries,
                reclaim_idle_secs: env_parse("WORKER_RECLAIM_IDLE_SECS", 300),
                reclaim_interval_secs: env_parse("WORKER_RECLAIM_INTERVAL_SECS", 30),
                fetch_max_retries: env_parse("FETCH_MAX_RETRIES", 3),
                upload_max_retries: env_parse("UPLOAD_MAX_RETRIES", 3),
                fetch_timeout_secs: env_parse("FETCH_TIMEOUT_SECS", 30),
            },
            compression: CompressionConfig {
                codec,
                quality,
                max_dimension,
            },
        })
    }
}
