//! Redis Streams backend.
//!
//! Each message is one stream entry with the fields `key`, `payload` and
//! `attempt`. Consumers read through a consumer group, so an entry stays in
//! the group's pending list until it is acked. Ack removes the entry from
//! both the pending list and the stream.

use crate::{Delivery, Publisher, QueueMessage, QueueResult, TaskQueue};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_ATTEMPT: &str = "attempt";

/// Upper bound on pending entries inspected per reclaim pass
const RECLAIM_SCAN_LIMIT: usize = 100;

/// Stream, consumer group and consumer names
#[derive(Debug, Clone)]
pub struct StreamQueueConfig {
    pub stream: String,
    pub group: String,
    /// Unique per worker process
    pub consumer: String,
}

impl StreamQueueConfig {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }
}

#[derive(Clone)]
pub struct RedisStreamQueue {
    /// Used for publish/ack/nack/reclaim
    conn: ConnectionManager,
    /// Dedicated to XREADGROUP BLOCK, which would otherwise stall every
    /// other command multiplexed on the same connection
    reader: ConnectionManager,
    config: StreamQueueConfig,
}

impl RedisStreamQueue {
    pub async fn connect(redis_url: &str, config: StreamQueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let reader = ConnectionManager::new(client).await?;

        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "Connected to Redis stream queue"
        );

        Ok(Self {
            conn,
            reader,
            config,
        })
    }

    pub fn config(&self) -> &StreamQueueConfig {
        &self.config
    }

    fn entry_fields(message: &QueueMessage) -> [(&'static str, String); 3] {
        [
            (FIELD_KEY, message.key.clone()),
            (FIELD_PAYLOAD, message.payload.clone()),
            (FIELD_ATTEMPT, message.attempt.to_string()),
        ]
    }

    /// Re-append `message` with `attempt + 1` and drop entry `id`, atomically.
    async fn requeue(&self, id: &str, message: &QueueMessage) -> QueueResult<()> {
        let next = message.next_attempt();
        let fields = Self::entry_fields(&next);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .xadd(&self.config.stream, "*", &fields)
            .ignore()
            .xack(&self.config.stream, &self.config.group, &[id])
            .ignore()
            .xdel(&self.config.stream, &[id])
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }
}

/// Turn a raw stream entry into a delivery.
///
/// Entries with missing fields still become deliveries (with empty
/// key/payload) so the handler can reject them and they get acked
/// instead of sitting in the pending list forever.
fn to_delivery(entry: &StreamId) -> Delivery {
    let key: Option<String> = entry.get(FIELD_KEY);
    let payload: Option<String> = entry.get(FIELD_PAYLOAD);
    if key.is_none() || payload.is_none() {
        warn!(id = %entry.id, "Stream entry is missing fields");
    }

    Delivery {
        id: entry.id.clone(),
        message: QueueMessage {
            key: key.unwrap_or_default(),
            payload: payload.unwrap_or_default(),
            attempt: entry.get(FIELD_ATTEMPT).unwrap_or(0),
        },
    }
}

#[async_trait]
impl Publisher for RedisStreamQueue {
    async fn publish(&self, message: &QueueMessage) -> QueueResult<String> {
        let mut conn = self.conn.clone();
        let fields = Self::entry_fields(message);

        let id: String = conn
            .xadd::<_, _, _, _, String>(&self.config.stream, "*", &fields)
            .await?;

        debug!(stream = %self.config.stream, id = %id, key = %message.key, "Message published");
        Ok(id)
    }
}

#[async_trait]
impl TaskQueue for RedisStreamQueue {
    fn name(&self) -> &str {
        &self.config.stream
    }

    async fn declare(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.config.stream, group = %self.config.group, "Consumer group created");
                Ok(())
            }
            // Group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn receive(&self, max: usize, block: Duration) -> QueueResult<Vec<Delivery>> {
        let mut reader = self.reader.clone();
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max.max(1))
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = reader
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await?;

        let deliveries = reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|stream| stream.ids.iter().map(to_delivery))
                    .collect()
            })
            .unwrap_or_default();

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let id = delivery.id.as_str();

        redis::pipe()
            .atomic()
            .xack(&self.config.stream, &self.config.group, &[id])
            .ignore()
            .xdel(&self.config.stream, &[id])
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.requeue(&delivery.id, &delivery.message).await
    }

    async fn reclaim_stale(&self, min_idle: Duration) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as usize;

        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.stream,
                &self.config.group,
                "-",
                "+",
                RECLAIM_SCAN_LIMIT,
            )
            .await?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        // XCLAIM re-checks the idle time, so two workers reclaiming at once
        // cannot both take the same entry
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                min_idle_ms,
                &stale,
            )
            .await?;

        let mut moved = 0;
        for entry in &claimed.ids {
            let delivery = to_delivery(entry);
            self.requeue(&delivery.id, &delivery.message).await?;
            moved += 1;
        }

        if moved > 0 {
            info!(stream = %self.config.stream, moved, "Reclaimed stale deliveries");
        }

        Ok(moved)
    }
}
