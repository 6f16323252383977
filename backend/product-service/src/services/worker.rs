//! Image worker - processes one image task per queue delivery
//!
//! ```text
//! Received → Downloading → Compressing → Uploading → Reconciling → Acked
//!     └──────────────┴─────────────┴───────────┴────────────┴──→ Failed(retryable | terminal)
//! ```
//!
//! - Retryable failures are handed back to the queue (`Requeue`) until the
//!   delivery budget is spent, then treated as terminal.
//! - Terminal failures are written to the dead-letter sink and acked.
//! - Nothing is acked before the derivative is recorded on the product.

use async_trait::async_trait;
use resilience::{with_retry, RetryConfig, RetryError};
use s3_utils::StorageError;
use std::fmt;
use std::sync::Arc;
use task_queue::{Delivery, HandlerOutcome, MessageHandler};
use tracing::{debug, error, info, warn};

use crate::db::{DeadLetter, DeadLetterSink};
use crate::error::AppError;
use crate::models::{AppendOutcome, ImageTask};
use crate::services::compression::Compressor;
use crate::services::reconciler::Reconciler;
use crate::services::storage::{derivative_key, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
    Received,
    Downloading,
    Compressing,
    Uploading,
    Reconciling,
    Acked,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Downloading => "downloading",
            Self::Compressing => "compressing",
            Self::Uploading => "uploading",
            Self::Reconciling => "reconciling",
            Self::Acked => "acked",
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Another delivery may succeed
    Retryable,
    /// Will fail the same way every time
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed ({kind:?}): {reason}")]
pub struct TaskFailure {
    pub stage: TaskStage,
    pub kind: FailureKind,
    pub reason: String,
}

impl TaskFailure {
    pub fn retryable(stage: TaskStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Retryable,
            reason: reason.into(),
        }
    }

    pub fn terminal(stage: TaskStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Terminal,
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == FailureKind::Terminal
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deliveries allowed per task before a retryable failure is dead-lettered
    pub max_deliveries: u32,
    /// In-process retries for source downloads
    pub fetch_retry: RetryConfig,
    /// In-process retries for derivative uploads
    pub upload_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            fetch_retry: RetryConfig::default(),
            upload_retry: RetryConfig::default(),
        }
    }
}

pub struct ImageWorker {
    store: Arc<dyn ObjectStore>,
    compressor: Arc<dyn Compressor>,
    reconciler: Reconciler,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: WorkerConfig,
}

impl ImageWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        compressor: Arc<dyn Compressor>,
        reconciler: Reconciler,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            compressor,
            reconciler,
            dead_letters,
            config,
        }
    }

    /// Run one task through download, compression, upload and reconcile.
    pub async fn process(&self, task: &ImageTask) -> Result<AppendOutcome, TaskFailure> {
        let product_id = task.product_id;
        let task_key = task.task_key.as_str();
        debug!(product_id, task_key, stage = %TaskStage::Downloading, "Image task stage");

        let source = with_retry(&self.config.fetch_retry, StorageError::is_transient, || {
            self.store.get(&task.source_url)
        })
        .await
        .map_err(|e| match e {
            // Out of retries for a transient error: treat the source as unreachable
            RetryError::Exhausted { attempts, last } => TaskFailure::terminal(
                TaskStage::Downloading,
                format!("{} (after {} attempts)", last, attempts),
            ),
            RetryError::Permanent(e) => {
                TaskFailure::terminal(TaskStage::Downloading, e.to_string())
            }
        })?;

        debug!(
            product_id,
            task_key,
            stage = %TaskStage::Compressing,
            size = source.data.len(),
            "Image task stage"
        );

        let compressed = self
            .compressor
            .compress(source.data, source.content_type)
            .await
            .map_err(|e| TaskFailure::terminal(TaskStage::Compressing, e.to_string()))?;

        debug!(
            product_id,
            task_key,
            stage = %TaskStage::Uploading,
            size = compressed.data.len(),
            "Image task stage"
        );

        let key = derivative_key(task.product_id, &task.task_key, compressed.extension);
        let url = with_retry(&self.config.upload_retry, StorageError::is_transient, || {
            self.store
                .put(&key, compressed.data.clone(), compressed.content_type)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => TaskFailure::retryable(
                TaskStage::Uploading,
                format!("{} (after {} attempts)", last, attempts),
            ),
            RetryError::Permanent(e) => TaskFailure::terminal(TaskStage::Uploading, e.to_string()),
        })?;

        debug!(product_id, task_key, stage = %TaskStage::Reconciling, url = %url, "Image task stage");

        self.reconciler
            .reconcile(task.product_id, &task.task_key, &url)
            .await
            .map_err(|e| match e {
                AppError::NotFound(msg) => TaskFailure::terminal(TaskStage::Reconciling, msg),
                other => TaskFailure::retryable(TaskStage::Reconciling, other.to_string()),
            })
    }

    /// Parse and check a delivery's payload
    fn parse(delivery: &Delivery) -> Result<ImageTask, TaskFailure> {
        let task: ImageTask = delivery.message.decode().map_err(|e| {
            TaskFailure::terminal(TaskStage::Received, format!("unparseable payload: {}", e))
        })?;

        if !task.key_is_consistent() {
            return Err(TaskFailure::terminal(
                TaskStage::Received,
                "task key does not match product id and source URL",
            ));
        }

        Ok(task)
    }

    /// Record a terminal failure, then ack. If the record cannot be written
    /// the delivery goes back to the queue so the failure is not lost, until
    /// the delivery budget is spent; the last delivery logs it and acks.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        task: Option<&ImageTask>,
        failure: &TaskFailure,
    ) -> HandlerOutcome {
        let task_key = match task {
            Some(t) => t.task_key.to_string(),
            None if !delivery.message.key.is_empty() => delivery.message.key.clone(),
            None => format!("delivery:{}", delivery.id),
        };

        let entry = DeadLetter {
            task_key,
            product_id: task.map(|t| t.product_id),
            source_url: task.map(|t| t.source_url.clone()),
            stage: failure.stage.to_string(),
            reason: failure.reason.clone(),
            attempt: i32::try_from(delivery.message.attempt).unwrap_or(i32::MAX),
            payload: delivery.message.payload.clone(),
        };

        match self.dead_letters.record(&entry).await {
            Ok(first) => {
                warn!(
                    task_key = %entry.task_key,
                    product_id = ?entry.product_id,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    attempt = delivery.message.attempt,
                    repeat = !first,
                    "Image task dead-lettered"
                );
                HandlerOutcome::Ack
            }
            Err(e) if self.budget_spent(delivery) => {
                error!(
                    task_key = %entry.task_key,
                    product_id = ?entry.product_id,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    attempt = delivery.message.attempt,
                    payload = %entry.payload,
                    error = %e,
                    "Failed to write dead letter on final delivery, dropping task"
                );
                HandlerOutcome::Ack
            }
            Err(e) => {
                error!(
                    task_key = %entry.task_key,
                    attempt = delivery.message.attempt,
                    error = %e,
                    "Failed to write dead letter, requeueing"
                );
                HandlerOutcome::Requeue
            }
        }
    }

    /// Whether this delivery is the last one allowed for its message
    fn budget_spent(&self, delivery: &Delivery) -> bool {
        delivery.message.attempt.saturating_add(1) >= self.config.max_deliveries
    }
}

#[async_trait]
impl MessageHandler for ImageWorker {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let task = match Self::parse(delivery) {
            Ok(task) => task,
            Err(failure) => return self.dead_letter(delivery, None, &failure).await,
        };

        debug!(
            product_id = task.product_id,
            task_key = %task.task_key,
            attempt = delivery.message.attempt,
            stage = %TaskStage::Received,
            "Image task stage"
        );

        match self.process(&task).await {
            Ok(outcome) => {
                info!(
                    product_id = task.product_id,
                    task_key = %task.task_key,
                    stage = %TaskStage::Acked,
                    duplicate = outcome == AppendOutcome::AlreadyPresent,
                    "Image task completed"
                );
                HandlerOutcome::Ack
            }
            Err(failure) if failure.is_terminal() => {
                self.dead_letter(delivery, Some(&task), &failure).await
            }
            Err(failure) => {
                if self.budget_spent(delivery) {
                    let deliveries = delivery.message.attempt.saturating_add(1);
                    let exhausted = TaskFailure::terminal(
                        failure.stage,
                        format!(
                            "{} (gave up after {} deliveries)",
                            failure.reason, deliveries
                        ),
                    );
                    return self.dead_letter(delivery, Some(&task), &exhausted).await;
                }

                warn!(
                    product_id = task.product_id,
                    task_key = %task.task_key,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    attempt = delivery.message.attempt,
                    "Image task failed, requeueing"
                );
                HandlerOutcome::Requeue
            }
        }
    }
}
