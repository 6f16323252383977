//! Consumer loop: receive, dispatch to a handler, settle.

use crate::{Delivery, QueueResult, TaskQueue};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What the consumer should do with a delivery once the handler is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Remove the message for good (success or terminal failure)
    Ack,
    /// Give it back to the queue for another attempt
    Requeue,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Max deliveries taken per receive
    pub batch_size: usize,
    /// How long one receive waits for new messages
    pub block: Duration,
    /// Handlers running at once
    pub concurrency: usize,
    pub reclaim_interval: Duration,
    /// Deliveries unacked for this long are presumed orphaned
    pub reclaim_min_idle: Duration,
    /// Pause after a failed receive
    pub error_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block: Duration::from_secs(5),
            concurrency: 4,
            reclaim_interval: Duration::from_secs(30),
            reclaim_min_idle: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    /// Received but handed back untouched because shutdown had started
    pub returned_on_shutdown: u64,
    pub reclaimed: u64,
    pub receive_errors: u64,
    /// Ack/nack calls that failed; those deliveries come back via reclaim
    pub settle_errors: u64,
}

enum Settled {
    Acked,
    Requeued,
    Returned,
    Failed,
}

pub struct QueueConsumer {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    shutdown_rx: watch::Receiver<bool>,
    stats: ConsumerStats,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            handler,
            options,
            shutdown_rx,
            stats: ConsumerStats::default(),
        }
    }

    /// Run until the shutdown channel flips to `true`.
    ///
    /// A receive that has started always runs to completion (it is bounded
    /// by `block`); backends may claim messages before the reply arrives.
    /// Handlers already running when shutdown arrives are allowed to finish
    /// and their outcome is settled. Deliveries received but not yet started
    /// are put back on the queue.
    pub async fn run(&mut self) -> QueueResult<ConsumerStats> {
        self.queue.declare().await?;

        info!(
            queue = %self.queue.name(),
            batch_size = self.options.batch_size,
            concurrency = self.options.concurrency,
            "Starting queue consumer loop"
        );

        let mut last_reclaim: Option<Instant> = None;

        loop {
            if *self.shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping consumer");
                break;
            }

            if last_reclaim.map_or(true, |at| at.elapsed() >= self.options.reclaim_interval) {
                self.reclaim().await;
                last_reclaim = Some(Instant::now());
            }

            match self
                .queue
                .receive(self.options.batch_size, self.options.block)
                .await
            {
                Ok(deliveries) if deliveries.is_empty() => {}
                Ok(deliveries) => self.process_batch(deliveries).await,
                Err(e) => {
                    self.stats.receive_errors += 1;
                    error!(error = %e, "Queue receive failed");
                    self.pause(self.options.error_backoff).await;
                }
            }
        }

        info!(stats = ?self.stats, "Queue consumer stopped");
        Ok(self.stats.clone())
    }

    async fn reclaim(&mut self) {
        match self.queue.reclaim_stale(self.options.reclaim_min_idle).await {
            Ok(0) => {}
            Ok(moved) => {
                self.stats.reclaimed += moved as u64;
                info!(moved, "Requeued orphaned deliveries");
            }
            Err(e) => warn!(error = %e, "Reclaim pass failed, will retry next interval"),
        }
    }

    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            Ok(()) = self.shutdown_rx.changed() => {}
        }
    }

    async fn process_batch(&mut self, deliveries: Vec<Delivery>) {
        self.stats.received += deliveries.len() as u64;

        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let settled: Vec<Settled> = stream::iter(deliveries)
            .map(|delivery| {
                let queue = queue.clone();
                let handler = handler.clone();
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    if *shutdown_rx.borrow() {
                        return match queue.nack(&delivery).await {
                            Ok(()) => Settled::Returned,
                            Err(e) => {
                                warn!(id = %delivery.id, error = %e, "Failed to return delivery on shutdown");
                                Settled::Failed
                            }
                        };
                    }

                    let outcome = handler.handle(&delivery).await;
                    settle(queue.as_ref(), &delivery, outcome).await
                }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        for result in settled {
            match result {
                Settled::Acked => self.stats.acked += 1,
                Settled::Requeued => self.stats.requeued += 1,
                Settled::Returned => self.stats.returned_on_shutdown += 1,
                Settled::Failed => self.stats.settle_errors += 1,
            }
        }
    }
}

async fn settle(queue: &dyn TaskQueue, delivery: &Delivery, outcome: HandlerOutcome) -> Settled {
    let result = match outcome {
        HandlerOutcome::Ack => queue.ack(delivery).await.map(|_| Settled::Acked),
        HandlerOutcome::Requeue => queue.nack(delivery).await.map(|_| Settled::Requeued),
    };

    match result {
        Ok(settled) => {
            debug!(id = %delivery.id, key = %delivery.message.key, ?outcome, "Delivery settled");
            settled
        }
        Err(e) => {
            // Left pending; the reclaim pass will redeliver it
            warn!(id = %delivery.id, ?outcome, error = %e, "Failed to settle delivery");
            Settled::Failed
        }
    }
}

/// Consume `queue` with `handler` until shutdown.
pub async fn subscribe(
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    shutdown_rx: watch::Receiver<bool>,
) -> QueueResult<ConsumerStats> {
    QueueConsumer::new(queue, handler, options, shutdown_rx)
        .run()
        .await
}
