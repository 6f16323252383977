/// Shared S3 utilities
///
/// Provides S3 client construction, object URL derivation, and uploads
/// with failures classified as transient or permanent.
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use std::sync::Arc;
use tracing::info;

pub mod config;
pub mod error;
pub mod operations;

pub use config::S3Config;
pub use error::{is_transient_status, StorageError, StorageResult};
pub use operations::{classify_sdk_error, S3Operations};

/// Build an [`S3Operations`] handle from configuration.
///
/// Credentials come from the standard AWS provider chain (env, profile,
/// instance metadata).
pub async fn connect(config: S3Config) -> S3Operations {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    builder = builder.force_path_style(config.path_style);

    let client = Client::from_conf(builder.build());

    info!(
        bucket = %config.bucket,
        region = %config.region,
        endpoint = config.endpoint.as_deref().unwrap_or("aws"),
        "S3 client initialized"
    );

    S3Operations::new(Arc::new(client), config)
}
