//! Product service - request-path operations on products
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::ProductStore;
use crate::error::{AppError, Result};
use crate::models::{CompressedImages, CreateProductRequest, Product, ProductFilters};
use crate::services::enqueuer::Enqueuer;

pub struct ProductService {
    store: Arc<dyn ProductStore>,
    enqueuer: Enqueuer,
}

impl ProductService {
    pub fn new(store: Arc<dyn ProductStore>, enqueuer: Enqueuer) -> Self {
        Self { store, enqueuer }
    }

    /// Validate, insert, then queue one task per source image.
    ///
    /// The insert is not rolled back when queueing fails: the caller gets
    /// `EnqueueFailed` with the new product id and can use
    /// [`Self::reprocess_images`] to finish the job.
    pub async fn create_product(&self, request: CreateProductRequest) -> Result<Product> {
        let new_product = request.into_new_product()?;
        let product = self.store.create_product(&new_product).await?;

        info!(
            product_id = product.id,
            user_id = product.user_id,
            images = product.product_images.len(),
            "Product created"
        );

        if let Err(e) = self.enqueuer.enqueue_product(&product).await {
            warn!(product_id = product.id, error = %e, "Product saved without queued images");
            return Err(e);
        }

        Ok(product)
    }

    pub async fn get_product(&self, id: i64) -> Result<Product> {
        self.store
            .get_product_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Product {} not found", id)))
    }

    pub async fn list_products(&self, filters: &ProductFilters) -> Result<Vec<Product>> {
        self.store.list_products(filters).await
    }

    /// Queue tasks for images that have no derivative yet. With `reset`,
    /// the compressed set is cleared first and every image is queued again.
    ///
    /// Returns the number of tasks queued.
    pub async fn reprocess_images(&self, id: i64, reset: bool) -> Result<usize> {
        let mut product = self.get_product(id).await?;

        if reset && !product.compressed_product_images.is_empty() {
            let cleared = CompressedImages::new();
            self.store.update_compressed_images(id, &cleared).await?;
            product.compressed_product_images = cleared;
            info!(product_id = id, "Compressed images cleared for reprocessing");
        }

        let enqueued = self.enqueuer.enqueue_missing(&product).await?;
        info!(product_id = id, enqueued, reset, "Product images requeued");
        Ok(enqueued)
    }
}
