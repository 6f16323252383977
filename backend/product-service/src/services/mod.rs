/// Service layer for products and the image pipeline
///
/// This module provides:
/// - Product service: create / get / list / reprocess
/// - Enqueuer: product images -> queued image tasks
/// - Image worker: download, compress, upload, reconcile
/// - Compressor and object store capabilities used by the worker
pub mod compression;
pub mod enqueuer;
pub mod products;
pub mod reconciler;
pub mod storage;
pub mod worker;

pub use compression::{
    Codec, CompressedImage, CompressionConfig, CompressionError, Compressor, ImageCompressor,
};
pub use enqueuer::Enqueuer;
pub use products::ProductService;
pub use reconciler::Reconciler;
pub use storage::{derivative_key, FetchedObject, ObjectStore, S3ObjectStore};
pub use worker::{FailureKind, ImageWorker, TaskFailure, TaskStage, WorkerConfig};
