//! Object storage client - source downloads and derivative uploads
//!
//! Failures are reported as [`StorageError`], split into transient (worth
//! retrying) and permanent.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use s3_utils::{S3Operations, StorageError, StorageResult};
use std::time::Duration;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::TaskKey;

/// Sources larger than this are rejected
pub const MAX_SOURCE_BYTES: u64 = 25 * 1024 * 1024;

/// Downloaded source object
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedObject {
    pub data: Bytes,
    pub content_type: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download the object at `url`.
    async fn get(&self, url: &str) -> StorageResult<FetchedObject>;

    /// Store `data` under `key` and return its public URL. Putting the same
    /// key again overwrites it.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String>;
}

/// Storage key of a derivative: `compressed/{product_id}/{task_key}.{ext}`
pub fn derivative_key(product_id: i64, task_key: &TaskKey, extension: &str) -> String {
    format!("compressed/{}/{}.{}", product_id, task_key, extension)
}

/// Classify a reqwest failure that happened before a status was received
fn classify_request_error(err: &reqwest::Error, url: &str) -> StorageError {
    let message = format!("GET {} failed: {}", url, err);
    if err.is_builder() {
        StorageError::Permanent(message)
    } else if let Some(status) = err.status() {
        StorageError::from_status(status.as_u16(), message)
    } else {
        // connect, timeout, body, decode
        StorageError::Transient(message)
    }
}

/// Response body buffer that refuses to grow past `limit` bytes
struct CappedBody {
    buf: BytesMut,
    limit: u64,
}

impl CappedBody {
    fn new(limit: u64, size_hint: Option<u64>) -> Self {
        let capacity = size_hint.unwrap_or(0).min(limit) as usize;
        Self {
            buf: BytesMut::with_capacity(capacity),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> StorageResult<()> {
        let total = self.buf.len() as u64 + chunk.len() as u64;
        if total > self.limit {
            return Err(StorageError::Permanent(format!(
                "source image too large: more than {} bytes",
                self.limit
            )));
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Downloads over HTTP(S), uploads to S3
#[derive(Clone)]
pub struct S3ObjectStore {
    s3: S3Operations,
    http_client: Client,
}

impl S3ObjectStore {
    pub fn new(s3: S3Operations, fetch_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { s3, http_client })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, url: &str) -> StorageResult<FetchedObject> {
        let parsed = url::Url::parse(url)
            .map_err(|e| StorageError::Permanent(format!("invalid source URL {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StorageError::Permanent(format!(
                "unsupported source URL scheme: {}",
                parsed.scheme()
            )));
        }

        debug!(url = %url, "Downloading source image");

        let mut response = self
            .http_client
            .get(parsed)
            .send()
            .await
            .map_err(|e| classify_request_error(&e, url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status.as_u16(),
                format!("GET {}", url),
            ));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_SOURCE_BYTES {
                return Err(StorageError::Permanent(format!(
                    "source image too large: {} bytes",
                    len
                )));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Content-Length is absent for chunked bodies
        let mut body = CappedBody::new(MAX_SOURCE_BYTES, response.content_length());
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_request_error(&e, url))?
        {
            body.push(&chunk)?;
        }
        let data = body.finish();

        debug!(url = %url, size = data.len(), "Downloaded source image");
        Ok(FetchedObject { data, content_type })
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
        self.s3.put_object(key, data, content_type).await
    }
}
