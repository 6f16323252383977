/// Dead-letter repository - terminal image task failures
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::error::Result;

/// Width of the `task_key` column
pub const MAX_TASK_KEY_CHARS: usize = 128;

/// One task that will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Task key, or a delivery-derived key when the payload was unreadable
    pub task_key: String,
    pub product_id: Option<i64>,
    pub source_url: Option<String>,
    /// Worker stage that failed
    pub stage: String,
    pub reason: String,
    pub attempt: i32,
    /// Raw queue payload
    pub payload: String,
}

impl DeadLetter {
    /// Make the entry storable: Postgres text cannot hold NUL, and keys
    /// wider than the column are replaced by their digest.
    pub fn sanitized(&self) -> DeadLetter {
        let task_key = strip_nul(&self.task_key);
        let task_key = if task_key.chars().count() > MAX_TASK_KEY_CHARS {
            format!("sha256:{}", hex::encode(Sha256::digest(task_key.as_bytes())))
        } else {
            task_key
        };

        DeadLetter {
            task_key,
            product_id: self.product_id,
            source_url: self.source_url.as_deref().map(strip_nul),
            stage: strip_nul(&self.stage),
            reason: strip_nul(&self.reason),
            attempt: self.attempt,
            payload: strip_nul(&self.payload),
        }
    }
}

fn strip_nul(s: &str) -> String {
    s.replace('\0', "")
}

/// A stored dead letter with its failure history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub entry: DeadLetter,
    /// Terminal failures seen for this task key
    pub failure_count: i32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record a terminal failure, keeping one entry per task key. A repeat
    /// failure replaces stage, reason and payload with the latest ones.
    /// Returns `true` when the key had no entry yet.
    async fn record(&self, entry: &DeadLetter) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Dead letters recorded for a product, oldest first
    pub async fn list_for_product(&self, product_id: i64) -> Result<Vec<DeadLetterRecord>> {
        let rows: Vec<(String, Option<i64>, Option<String>, String, String, i32, String, i32)> =
            sqlx::query_as(
                r#"
                SELECT task_key, product_id, source_url, stage, reason, attempt, payload,
                       failure_count
                FROM image_task_dead_letters
                WHERE product_id = $1
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(task_key, product_id, source_url, stage, reason, attempt, payload, failure_count)| {
                    DeadLetterRecord {
                        entry: DeadLetter {
                            task_key,
                            product_id,
                            source_url,
                            stage,
                            reason,
                            attempt,
                            payload,
                        },
                        failure_count,
                    }
                },
            )
            .collect())
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterStore {
    async fn record(&self, entry: &DeadLetter) -> Result<bool> {
        let entry = entry.sanitized();

        // xmax is 0 only for a freshly inserted row
        let (inserted,): (bool,) = sqlx::query_as(
            r#"
            INSERT INTO image_task_dead_letters
                (task_key, product_id, source_url, stage, reason, attempt, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_key) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                source_url = EXCLUDED.source_url,
                stage = EXCLUDED.stage,
                reason = EXCLUDED.reason,
                attempt = EXCLUDED.attempt,
                payload = EXCLUDED.payload,
                failure_count = image_task_dead_letters.failure_count + 1,
                updated_at = NOW()
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&entry.task_key)
        .bind(entry.product_id)
        .bind(&entry.source_url)
        .bind(&entry.stage)
        .bind(&entry.reason)
        .bind(entry.attempt)
        .bind(&entry.payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }
}
