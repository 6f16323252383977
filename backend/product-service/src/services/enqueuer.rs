//! Enqueuer - turns a product's source images into queued image tasks
use resilience::{with_retry, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use task_queue::{Publisher, QueueError, QueueMessage};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{ImageTask, Product};

pub struct Enqueuer {
    publisher: Arc<dyn Publisher>,
    retry: RetryConfig,
}

impl Enqueuer {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            // Runs on the request path, so keep the extra wait short
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(500),
                ..RetryConfig::default()
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Publish one task per source image of a freshly created product.
    pub async fn enqueue_product(&self, product: &Product) -> Result<usize> {
        self.publish_all(product.id, product.image_tasks()).await
    }

    /// Publish tasks only for images that have no derivative yet.
    pub async fn enqueue_missing(&self, product: &Product) -> Result<usize> {
        self.publish_all(product.id, product.missing_image_tasks())
            .await
    }

    /// Publish in order and stop at the first failure. Tasks already
    /// published stay queued; the error says how many made it.
    async fn publish_all(&self, product_id: i64, tasks: Vec<ImageTask>) -> Result<usize> {
        let total = tasks.len();

        for (published, task) in tasks.iter().enumerate() {
            if let Err(e) = self.publish(task).await {
                warn!(
                    product_id,
                    task_key = %task.task_key,
                    published,
                    total,
                    error = %e,
                    "Failed to enqueue image task"
                );
                return Err(AppError::EnqueueFailed {
                    product_id,
                    reason: format!("{} of {} image tasks queued: {}", published, total, e),
                });
            }
        }

        if total > 0 {
            info!(product_id, tasks = total, "Image tasks enqueued");
        }
        Ok(total)
    }

    async fn publish(&self, task: &ImageTask) -> std::result::Result<String, QueueError> {
        let message = QueueMessage::json(task.task_key.as_str(), task)?;

        let id = with_retry(&self.retry, QueueError::is_unavailable, || {
            self.publisher.publish(&message)
        })
        .await
        .map_err(|e| e.into_inner())?;

        debug!(task_key = %task.task_key, message_id = %id, "Image task published");
        Ok(id)
    }
}
