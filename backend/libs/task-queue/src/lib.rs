//! # Durable Task Queue
//!
//! At-least-once work queue with explicit acknowledgement.
//!
//! ## Delivery model
//!
//! ```text
//! Publisher ──publish──▶ queue ──receive──▶ Consumer ──handle──▶ Ack | Requeue
//!                          ▲                                         │
//!                          └──────── nack / reclaim_stale ◀──────────┘
//! ```
//!
//! - A message stays owned by the queue until the consumer calls [`TaskQueue::ack`].
//! - [`TaskQueue::nack`] puts the message back at the tail with `attempt + 1`.
//! - Deliveries whose consumer crashed are found by [`TaskQueue::reclaim_stale`]
//!   and re-appended with `attempt + 1`, so a poisoned message cannot loop
//!   without its attempt counter growing.
//!
//! Handlers must therefore be idempotent: the same message can be seen
//! more than once.
//!
//! ## Backends
//!
//! - [`RedisStreamQueue`]: Redis Streams with a consumer group.
//! - [`MemoryQueue`]: in-process queue with the same semantics, for tests and
//!   local development.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod consumer;
mod error;
pub mod memory;
pub mod redis_stream;

pub use consumer::{
    subscribe, ConsumerOptions, ConsumerStats, HandlerOutcome, MessageHandler, QueueConsumer,
};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use redis_stream::{RedisStreamQueue, StreamQueueConfig};

/// A unit of work as stored on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Deduplication / idempotency key chosen by the producer
    pub key: String,
    /// Opaque body, JSON by convention
    pub payload: String,
    /// Number of earlier deliveries that ended in nack or reclaim
    pub attempt: u32,
}

impl QueueMessage {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            attempt: 0,
        }
    }

    /// Build a message whose payload is `body` serialized as JSON.
    pub fn json<T: Serialize>(key: impl Into<String>, body: &T) -> QueueResult<Self> {
        Ok(Self::new(key, serde_json::to_string(body)?))
    }

    /// Parse the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.payload)
    }

    /// Copy of this message for its next delivery.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// A message handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Backend-assigned id of this particular delivery
    pub id: String,
    pub message: QueueMessage,
}

/// Producer side of the queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Append a message durably. Returns the backend message id once the
    /// broker has accepted it.
    async fn publish(&self, message: &QueueMessage) -> QueueResult<String>;
}

/// Consumer side of the queue.
#[async_trait]
pub trait TaskQueue: Publisher {
    /// Queue name
    fn name(&self) -> &str;

    /// Idempotent setup of the queue and its consumer group.
    async fn declare(&self) -> QueueResult<()>;

    /// Take up to `max` new messages, waiting at most `block` for the first.
    async fn receive(&self, max: usize, block: Duration) -> QueueResult<Vec<Delivery>>;

    /// Remove a delivery for good. Acking an unknown delivery is a no-op.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Give a delivery back: re-append it with `attempt + 1` and ack the
    /// original in one step.
    async fn nack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Re-append deliveries that have been unacknowledged for at least
    /// `min_idle`. Returns how many were moved.
    async fn reclaim_stale(&self, min_idle: Duration) -> QueueResult<usize>;
}
