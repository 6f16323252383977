//! In-memory collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use product_service::db::{DeadLetter, DeadLetterSink, ProductStore};
use product_service::error::{AppError, Result};
use product_service::models::{
    AppendOutcome, CompressedImages, NewProduct, Product, ProductFilters, TaskKey,
};
use product_service::services::{FetchedObject, ObjectStore};
use resilience::RetryConfig;
use s3_utils::{StorageError, StorageResult};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

pub const CDN_BASE: &str = "https://cdn.test";

/// Retries without waiting
pub fn instant_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        jitter: false,
    }
}

pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .expect("encode test png");
    Bytes::from(buf)
}

// ========================================
// Product store
// ========================================

#[derive(Default)]
pub struct InMemoryProductStore {
    products: Mutex<HashMap<i64, Product>>,
    next_id: Mutex<i64>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, id: i64) -> Option<Product> {
        self.products.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.products.lock().unwrap().len()
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn create_product(&self, product: &NewProduct) -> Result<Product> {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        let now = Utc::now();
        let stored = Product {
            id,
            user_id: product.user_id,
            product_name: product.product_name.clone(),
            product_description: product.product_description.clone(),
            product_images: product.product_images.clone(),
            compressed_product_images: CompressedImages::new(),
            product_price: product.product_price,
            created_at: now,
            updated_at: now,
        };
        self.products.lock().unwrap().insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_product_by_id(&self, id: i64) -> Result<Option<Product>> {
        Ok(self.snapshot(id))
    }

    async fn list_products(&self, filters: &ProductFilters) -> Result<Vec<Product>> {
        let mut matching: Vec<Product> = self
            .products
            .lock()
            .unwrap()
            .values()
            .filter(|p| filters.matches(p))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(matching
            .into_iter()
            .skip(filters.offset as usize)
            .take(filters.limit as usize)
            .collect())
    }

    async fn append_compressed_image(
        &self,
        id: i64,
        task_key: &TaskKey,
        url: &str,
    ) -> Result<AppendOutcome> {
        let mut products = self.products.lock().unwrap();
        let product = products
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Product {} not found", id)))?;

        if product.compressed_product_images.insert(task_key, url) {
            product.updated_at = Utc::now();
            Ok(AppendOutcome::Added)
        } else {
            Ok(AppendOutcome::AlreadyPresent)
        }
    }

    async fn update_compressed_images(&self, id: i64, images: &CompressedImages) -> Result<()> {
        let mut products = self.products.lock().unwrap();
        let product = products
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Product {} not found", id)))?;
        product.compressed_product_images = images.clone();
        Ok(())
    }
}

// ========================================
// Object store
// ========================================

/// Serves registered sources and keeps every upload in memory
#[derive(Default)]
pub struct FakeObjectStore {
    sources: Mutex<HashMap<String, StorageResult<FetchedObject>>>,
    objects: Mutex<HashMap<String, Bytes>>,
    gets: Mutex<Vec<String>>,
    puts: Mutex<Vec<String>>,
    failing_puts: Mutex<u32>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, data: Bytes, content_type: &str) {
        self.sources.lock().unwrap().insert(
            url.to_string(),
            Ok(FetchedObject {
                data,
                content_type: Some(content_type.to_string()),
            }),
        );
    }

    pub fn fail(&self, url: &str, error: StorageError) {
        self.sources
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(error));
    }

    /// Fail the next `count` uploads with a transient error
    pub fn fail_next_puts(&self, count: u32) {
        *self.failing_puts.lock().unwrap() = count;
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn get(&self, url: &str) -> StorageResult<FetchedObject> {
        self.gets.lock().unwrap().push(url.to_string());
        self.sources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(StorageError::from_status(404, format!("GET {}", url))))
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<String> {
        self.puts.lock().unwrap().push(key.to_string());
        {
            let mut failing = self.failing_puts.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(StorageError::Transient(format!("PUT {} timed out", key)));
            }
        }
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(format!("{}/{}", CDN_BASE, key))
    }
}

// ========================================
// Dead letters
// ========================================

/// One record per task key holding the latest failure, like the upsert in Postgres
#[derive(Default)]
pub struct MemoryDeadLetters {
    entries: Mutex<Vec<DeadLetter>>,
    attempts: Mutex<u32>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().unwrap().clone()
    }

    /// Calls to `record`, including duplicates
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, entry: &DeadLetter) -> Result<bool> {
        *self.attempts.lock().unwrap() += 1;
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.iter_mut().find(|e| e.task_key == entry.task_key) {
            *existing = entry.clone();
            return Ok(false);
        }
        entries.push(entry.clone());
        Ok(true)
    }
}
