//! In-process queue with the same delivery semantics as the Redis backend.
//!
//! Also exposes a few inspection hooks (`published`, `ready_len`,
//! `in_flight_len`) and an availability switch that makes every call fail
//! with [`QueueError::Unavailable`], which is how broker outages are
//! simulated in tests.

use crate::{Delivery, Publisher, QueueError, QueueMessage, QueueResult, TaskQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct InFlight {
    message: QueueMessage,
    delivered_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    ready: VecDeque<(String, QueueMessage)>,
    in_flight: HashMap<String, InFlight>,
    published: Vec<QueueMessage>,
    declared: bool,
}

impl MemoryState {
    fn push(&mut self, message: QueueMessage) -> String {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        self.ready.push_back((id.clone(), message));
        id
    }
}

pub struct MemoryQueue {
    name: String,
    state: Mutex<MemoryState>,
    notify: Notify,
    available: AtomicBool,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every message accepted through [`Publisher::publish`], in order.
    /// Requeues are not included.
    pub fn published(&self) -> Vec<QueueMessage> {
        self.lock().published.clone()
    }

    /// Messages waiting for a consumer
    pub fn ready(&self) -> Vec<QueueMessage> {
        self.lock().ready.iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Delivered but neither acked nor nacked
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_declared(&self) -> bool {
        self.lock().declared
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-operation
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_available(&self) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable(format!(
                "memory queue {} is offline",
                self.name
            )))
        }
    }

    fn take_ready(&self, max: usize) -> Vec<Delivery> {
        let mut state = self.lock();
        let mut taken = Vec::new();
        while taken.len() < max {
            let Some((id, message)) = state.ready.pop_front() else {
                break;
            };
            state.in_flight.insert(
                id.clone(),
                InFlight {
                    message: message.clone(),
                    delivered_at: Instant::now(),
                },
            );
            taken.push(Delivery { id, message });
        }
        taken
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> QueueResult<String> {
        self.ensure_available()?;
        let id = {
            let mut state = self.lock();
            state.published.push(message.clone());
            state.push(message.clone())
        };
        self.notify.notify_one();
        debug!(queue = %self.name, id = %id, key = %message.key, "Message published");
        Ok(id)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn declare(&self) -> QueueResult<()> {
        self.ensure_available()?;
        self.lock().declared = true;
        Ok(())
    }

    async fn receive(&self, max: usize, block: Duration) -> QueueResult<Vec<Delivery>> {
        let deadline = Instant::now() + block;

        loop {
            self.ensure_available()?;

            let taken = self.take_ready(max.max(1));
            if !taken.is_empty() {
                return Ok(taken);
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.ensure_available()?;
        self.lock().in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.ensure_available()?;
        let requeued = {
            let mut state = self.lock();
            match state.in_flight.remove(&delivery.id) {
                Some(entry) => {
                    state.push(entry.message.next_attempt());
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn reclaim_stale(&self, min_idle: Duration) -> QueueResult<usize> {
        self.ensure_available()?;
        let moved = {
            let mut state = self.lock();
            let stale: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.delivered_at.elapsed() >= min_idle)
                .map(|(id, _)| id.clone())
                .collect();

            for id in &stale {
                if let Some(entry) = state.in_flight.remove(id) {
                    state.push(entry.message.next_attempt());
                }
            }
            stale.len()
        };
        for _ in 0..moved {
            self.notify.notify_one();
        }
        Ok(moved)
    }
}
