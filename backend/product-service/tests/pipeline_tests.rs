//! End-to-end image pipeline tests on in-memory collaborators
//!
//! Products are created through `ProductService`, tasks flow through a
//! `MemoryQueue` and are handled by a real `ImageWorker` with the real
//! compressor. Storage, persistence and dead letters are in-memory fakes.

mod common;

use actix_web::ResponseError;
use common::{
    instant_retry, png_bytes, FakeObjectStore, InMemoryProductStore, MemoryDeadLetters, CDN_BASE,
};
use product_service::error::{error_codes, AppError};
use product_service::models::{
    AppendOutcome, CreateProductRequest, ImageTask, ProductResponse, TaskKey,
};
use product_service::services::{
    derivative_key, Enqueuer, ImageCompressor, ImageWorker, ProductService, Reconciler,
    WorkerConfig,
};
use s3_utils::StorageError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use task_queue::{
    subscribe, ConsumerOptions, HandlerOutcome, MemoryQueue, MessageHandler, Publisher,
    QueueMessage, TaskQueue,
};
use tokio::sync::watch;

struct Pipeline {
    store: Arc<InMemoryProductStore>,
    objects: Arc<FakeObjectStore>,
    dead_letters: Arc<MemoryDeadLetters>,
    queue: Arc<MemoryQueue>,
    service: ProductService,
    worker: Arc<ImageWorker>,
}

impl Pipeline {
    fn new() -> Self {
        Self::with_max_deliveries(3)
    }

    fn with_max_deliveries(max_deliveries: u32) -> Self {
        let store = Arc::new(InMemoryProductStore::new());
        let objects = Arc::new(FakeObjectStore::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let queue = Arc::new(MemoryQueue::new("image_processing_queue"));

        let service = ProductService::new(
            store.clone(),
            Enqueuer::new(queue.clone()).with_retry(instant_retry(0)),
        );
        let worker = Arc::new(ImageWorker::new(
            objects.clone(),
            Arc::new(ImageCompressor::with_defaults()),
            Reconciler::new(store.clone()),
            dead_letters.clone(),
            WorkerConfig {
                max_deliveries,
                fetch_retry: instant_retry(1),
                upload_retry: instant_retry(1),
            },
        ));

        Self {
            store,
            objects,
            dead_letters,
            queue,
            service,
            worker,
        }
    }

    /// Handle and settle deliveries until the queue is empty
    async fn drain(&self) -> Vec<HandlerOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..50 {
            let batch = self
                .queue
                .receive(10, Duration::from_millis(10))
                .await
                .unwrap();
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                let outcome = self.worker.handle(&delivery).await;
                match outcome {
                    HandlerOutcome::Ack => self.queue.ack(&delivery).await.unwrap(),
                    HandlerOutcome::Requeue => self.queue.nack(&delivery).await.unwrap(),
                }
                outcomes.push(outcome);
            }
        }
        assert_eq!(self.queue.ready_len(), 0, "queue did not drain");
        assert_eq!(self.queue.in_flight_len(), 0);
        outcomes
    }
}

fn request(images: &[&str]) -> CreateProductRequest {
    CreateProductRequest {
        user_id: 42,
        product_name: "Oak chair".to_string(),
        product_description: "Solid oak".to_string(),
        product_images: images.iter().map(|s| s.to_string()).collect(),
        product_price: 129.0,
    }
}

#[tokio::test]
async fn test_product_with_n_images_enqueues_n_unique_tasks() {
    for n in [0usize, 1, 5] {
        let pipeline = Pipeline::new();
        let urls: Vec<String> = (0..n).map(|i| format!("http://a/{}.jpg", i)).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();

        let product = pipeline.service.create_product(request(&refs)).await.unwrap();

        let published = pipeline.queue.published();
        assert_eq!(published.len(), n);

        let keys: HashSet<String> = published.iter().map(|m| m.key.clone()).collect();
        assert_eq!(keys.len(), n);

        for (message, url) in published.iter().zip(&urls) {
            let task: ImageTask = message.decode().unwrap();
            assert_eq!(task.product_id, product.id);
            assert_eq!(&task.source_url, url);
            assert!(task.key_is_consistent());
            assert_eq!(message.key, task.task_key.as_str());
            assert_eq!(message.attempt, 0);
        }
    }
}

#[tokio::test]
async fn test_two_image_product_ends_with_two_compressed_images() {
    let pipeline = Pipeline::new();
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(64, 48), "image/png");
    pipeline
        .objects
        .serve("http://a/2.jpg", png_bytes(32, 32), "image/png");

    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg", "http://a/2.jpg"]))
        .await
        .unwrap();
    assert_eq!(pipeline.queue.published().len(), 2);
    assert!(product.compressed_product_images.is_empty());

    let outcomes = pipeline.drain().await;
    assert_eq!(outcomes, vec![HandlerOutcome::Ack, HandlerOutcome::Ack]);

    let fetched = pipeline.service.get_product(product.id).await.unwrap();
    assert_eq!(fetched.compressed_product_images.len(), 2);

    let response = ProductResponse::from(fetched);
    let expected: Vec<String> = ["http://a/1.jpg", "http://a/2.jpg"]
        .iter()
        .map(|url| {
            let key = TaskKey::derive(product.id, url);
            format!("{}/{}", CDN_BASE, derivative_key(product.id, &key, "jpg"))
        })
        .collect();
    assert_eq!(response.compressed_product_images, expected);
    assert_eq!(pipeline.objects.object_count(), 2);
    assert!(pipeline.dead_letters.entries().is_empty());
}

#[tokio::test]
async fn test_reconcile_twice_keeps_a_single_entry() {
    let pipeline = Pipeline::new();
    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg"]))
        .await
        .unwrap();

    let reconciler = Reconciler::new(pipeline.store.clone());
    let key = TaskKey::derive(product.id, "http://a/1.jpg");

    let first = reconciler
        .reconcile(product.id, &key, "https://cdn.test/x.jpg")
        .await
        .unwrap();
    let second = reconciler
        .reconcile(product.id, &key, "https://cdn.test/x.jpg")
        .await
        .unwrap();

    assert_eq!(first, AppendOutcome::Added);
    assert_eq!(second, AppendOutcome::AlreadyPresent);

    let stored = pipeline.store.snapshot(product.id).unwrap();
    assert_eq!(stored.compressed_product_images.len(), 1);
    assert_eq!(
        stored.compressed_product_images.get(&key),
        Some("https://cdn.test/x.jpg")
    );
}

#[tokio::test]
async fn test_redelivery_after_crash_reaches_same_state() {
    let pipeline = Pipeline::new();
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(40, 40), "image/png");

    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg"]))
        .await
        .unwrap();

    // The worker finishes the task but dies before acking
    let mut batch = pipeline
        .queue
        .receive(1, Duration::from_millis(10))
        .await
        .unwrap();
    let delivery = batch.pop().unwrap();
    assert_eq!(pipeline.worker.handle(&delivery).await, HandlerOutcome::Ack);
    let after_first = pipeline.store.snapshot(product.id).unwrap();
    assert_eq!(pipeline.queue.in_flight_len(), 1);

    // Another worker reclaims the orphaned delivery
    let reclaimed = pipeline.queue.reclaim_stale(Duration::ZERO).await.unwrap();
    assert_eq!(reclaimed, 1);

    let redelivered = pipeline.queue.ready();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].attempt, 1);

    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);

    let after_second = pipeline.store.snapshot(product.id).unwrap();
    assert_eq!(
        after_second.compressed_product_images,
        after_first.compressed_product_images
    );
    assert_eq!(after_second.compressed_product_images.len(), 1);

    // Same deterministic key both times, so one object overwritten in place
    let puts = pipeline.objects.puts();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[0], puts[1]);
    assert_eq!(pipeline.objects.object_count(), 1);
}

#[tokio::test]
async fn test_missing_source_is_dead_lettered_exactly_once() {
    let pipeline = Pipeline::new();
    // Nothing served: the fake answers 404

    let product = pipeline
        .service
        .create_product(request(&["http://a/missing.jpg"]))
        .await
        .unwrap();

    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);

    // 404 is permanent, so the source is not fetched again
    assert_eq!(pipeline.objects.gets().len(), 1);

    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "downloading");
    assert_eq!(entries[0].product_id, Some(product.id));
    assert_eq!(
        entries[0].task_key,
        TaskKey::derive(product.id, "http://a/missing.jpg").as_str()
    );

    // A duplicate delivery of the same task does not add a second record
    let duplicate = pipeline.queue.published()[0].clone();
    pipeline.queue.publish(&duplicate).await.unwrap();
    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);

    assert_eq!(pipeline.dead_letters.entries().len(), 1);
    assert_eq!(pipeline.dead_letters.attempts(), 2);

    let stored = pipeline.store.snapshot(product.id).unwrap();
    assert!(stored.compressed_product_images.is_empty());
}

#[tokio::test]
async fn test_transient_source_failure_exhausts_and_dead_letters() {
    let pipeline = Pipeline::new();
    pipeline.objects.fail(
        "http://a/flaky.jpg",
        StorageError::from_status(503, "GET http://a/flaky.jpg"),
    );

    pipeline
        .service
        .create_product(request(&["http://a/flaky.jpg"]))
        .await
        .unwrap();

    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);

    // One initial attempt plus one in-process retry
    assert_eq!(pipeline.objects.gets().len(), 2);
    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "downloading");
}

#[tokio::test]
async fn test_upload_failure_is_requeued_then_succeeds() {
    let pipeline = Pipeline::new();
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(16, 16), "image/png");
    // Both in-process attempts of the first delivery fail
    pipeline.objects.fail_next_puts(2);

    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg"]))
        .await
        .unwrap();

    let outcomes = pipeline.drain().await;
    assert_eq!(outcomes, vec![HandlerOutcome::Requeue, HandlerOutcome::Ack]);

    let stored = pipeline.store.snapshot(product.id).unwrap();
    assert_eq!(stored.compressed_product_images.len(), 1);
    assert!(pipeline.dead_letters.entries().is_empty());
}

#[tokio::test]
async fn test_upload_failure_gives_up_after_max_deliveries() {
    let pipeline = Pipeline::with_max_deliveries(3);
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(16, 16), "image/png");
    pipeline.objects.fail_next_puts(u32::MAX);

    pipeline
        .service
        .create_product(request(&["http://a/1.jpg"]))
        .await
        .unwrap();

    let outcomes = pipeline.drain().await;
    assert_eq!(
        outcomes,
        vec![
            HandlerOutcome::Requeue,
            HandlerOutcome::Requeue,
            HandlerOutcome::Ack
        ]
    );

    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "uploading");
    assert_eq!(entries[0].attempt, 2);
    assert!(entries[0].reason.contains("gave up after 3 deliveries"));
}

#[tokio::test]
async fn test_undecodable_image_is_terminal() {
    let pipeline = Pipeline::new();
    pipeline.objects.serve(
        "http://a/broken.png",
        bytes::Bytes::from_static(b"definitely not a png"),
        "image/png",
    );

    pipeline
        .service
        .create_product(request(&["http://a/broken.png"]))
        .await
        .unwrap();

    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);
    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "compressing");
    assert!(pipeline.objects.puts().is_empty());
}

#[tokio::test]
async fn test_task_for_deleted_product_is_terminal() {
    let pipeline = Pipeline::new();
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(8, 8), "image/png");

    let task = ImageTask::new(999, "http://a/1.jpg");
    let message = QueueMessage::json(task.task_key.as_str(), &task).unwrap();
    pipeline.queue.publish(&message).await.unwrap();

    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);
    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "reconciling");
    assert_eq!(entries[0].product_id, Some(999));
}

#[tokio::test]
async fn test_unparseable_payload_is_dead_lettered() {
    let pipeline = Pipeline::new();
    pipeline
        .queue
        .publish(&QueueMessage::new("junk", "{not json"))
        .await
        .unwrap();

    assert_eq!(pipeline.drain().await, vec![HandlerOutcome::Ack]);
    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_key, "junk");
    assert_eq!(entries[0].stage, "received");
    assert_eq!(entries[0].product_id, None);
    assert_eq!(entries[0].payload, "{not json");
}

#[tokio::test]
async fn test_forged_task_key_is_rejected() {
    let pipeline = Pipeline::new();
    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg"]))
        .await
        .unwrap();
    pipeline.drain().await;

    let mut task = ImageTask::new(product.id, "http://a/1.jpg");
    task.source_url = "http://evil/other.jpg".to_string();
    let message = QueueMessage::json(task.task_key.as_str(), &task).unwrap();
    pipeline.queue.publish(&message).await.unwrap();

    pipeline.drain().await;
    assert!(pipeline
        .objects
        .gets()
        .iter()
        .all(|url| url != "http://evil/other.jpg"));
    assert!(pipeline
        .dead_letters
        .entries()
        .iter()
        .any(|e| e.stage == "received"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciliations_keep_both_urls() {
    let pipeline = Pipeline::new();
    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg", "http://a/2.jpg"]))
        .await
        .unwrap();

    let reconciler = Reconciler::new(pipeline.store.clone());
    let handles: Vec<_> = ["http://a/1.jpg", "http://a/2.jpg"]
        .into_iter()
        .map(|url| {
            let reconciler = reconciler.clone();
            let key = TaskKey::derive(product.id, url);
            let id = product.id;
            tokio::spawn(async move {
                reconciler
                    .reconcile(id, &key, &format!("https://cdn.test/{}", key))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), AppendOutcome::Added);
    }

    let stored = pipeline.store.snapshot(product.id).unwrap();
    assert_eq!(stored.compressed_product_images.len(), 2);
}

#[tokio::test]
async fn test_publish_failure_reports_partial_failure_and_keeps_row() {
    let pipeline = Pipeline::new();
    pipeline.queue.set_available(false);

    let err = pipeline
        .service
        .create_product(request(&["http://a/1.jpg", "http://a/2.jpg"]))
        .await
        .unwrap_err();

    let product_id = match &err {
        AppError::EnqueueFailed { product_id, .. } => *product_id,
        other => panic!("expected EnqueueFailed, got {:?}", other),
    };
    assert_eq!(err.code(), error_codes::IMAGE_ENQUEUE_FAILED);
    assert_eq!(err.status_code().as_u16(), 503);

    // Distinguishable from a validation failure
    let invalid = pipeline
        .service
        .create_product(request(&["ftp://a/1.jpg"]))
        .await
        .unwrap_err();
    assert_eq!(invalid.status_code().as_u16(), 400);
    assert_ne!(invalid.code(), err.code());

    let stored = pipeline.store.snapshot(product_id).unwrap();
    assert!(stored.compressed_product_images.is_empty());
    assert_eq!(pipeline.store.len(), 1);

    // Once the broker is back the caller finishes the job
    pipeline.queue.set_available(true);
    let enqueued = pipeline
        .service
        .reprocess_images(product_id, false)
        .await
        .unwrap();
    assert_eq!(enqueued, 2);
}

#[tokio::test]
async fn test_reprocess_only_queues_images_without_derivative() {
    let pipeline = Pipeline::new();
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(8, 8), "image/png");

    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg", "http://a/2.jpg"]))
        .await
        .unwrap();
    pipeline.drain().await;
    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "downloading");

    // Source 2 shows up, but broken
    pipeline.objects.serve(
        "http://a/2.jpg",
        bytes::Bytes::from_static(b"truncated upload"),
        "image/png",
    );
    let enqueued = pipeline
        .service
        .reprocess_images(product.id, false)
        .await
        .unwrap();
    assert_eq!(enqueued, 1);

    pipeline.drain().await;
    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "compressing");

    // Then fixed
    pipeline
        .objects
        .serve("http://a/2.jpg", png_bytes(8, 8), "image/png");
    let enqueued = pipeline
        .service
        .reprocess_images(product.id, false)
        .await
        .unwrap();
    assert_eq!(enqueued, 1);

    pipeline.drain().await;
    let stored = pipeline.store.snapshot(product.id).unwrap();
    assert_eq!(stored.compressed_product_images.len(), 2);
}

#[tokio::test]
async fn test_consumer_loop_processes_and_stops() {
    let pipeline = Pipeline::new();
    pipeline
        .objects
        .serve("http://a/1.jpg", png_bytes(20, 10), "image/png");
    pipeline
        .objects
        .serve("http://a/2.jpg", png_bytes(10, 20), "image/png");

    let product = pipeline
        .service
        .create_product(request(&["http://a/1.jpg", "http://a/2.jpg"]))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let options = ConsumerOptions {
        block: Duration::from_millis(20),
        ..ConsumerOptions::default()
    };
    let consumer = tokio::spawn(subscribe(
        pipeline.queue.clone(),
        pipeline.worker.clone(),
        options,
        shutdown_rx,
    ));

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = pipeline
                .store
                .snapshot(product.id)
                .map(|p| p.compressed_product_images.len() == 2)
                .unwrap_or(false);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("images were not compressed in time");

    shutdown_tx.send(true).unwrap();
    let stats = consumer.await.unwrap().unwrap();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.acked, 2);
    assert!(pipeline.queue.is_declared());
}
