/// S3 object operations used by the image pipeline
use crate::config::S3Config;
use crate::error::{StorageError, StorageResult};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct S3Operations {
    client: Arc<Client>,
    config: S3Config,
}

impl S3Operations {
    pub fn new(client: Arc<Client>, config: S3Config) -> Self {
        Self { client, config }
    }

    /// Upload an object and return its public URL.
    ///
    /// Writing the same key twice overwrites the object, so callers that
    /// derive keys deterministically can repeat the call safely.
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<String> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "put_object"))?;

        debug!(bucket = %self.config.bucket, key = %key, size, "Object stored");

        Ok(self.config.object_url(key))
    }

    /// Check the bucket is reachable with the configured credentials
    pub async fn head_bucket(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "head_bucket"))?;

        Ok(())
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }
}

/// Map an SDK failure onto the transient/permanent split.
///
/// Service errors are classified by their HTTP status; transport-level
/// failures (timeouts, dispatch, unparseable responses) are transient;
/// request construction failures are permanent.
pub fn classify_sdk_error<E>(err: SdkError<E>, operation: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));

    match &err {
        SdkError::ServiceError(ctx) => {
            StorageError::from_status(ctx.raw().status().as_u16(), message)
        }
        SdkError::ConstructionFailure(_) => StorageError::Permanent(message),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(message)
        }
        _ => StorageError::Transient(message),
    }
}
