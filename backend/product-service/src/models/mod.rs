/// Data models for product-service
///
/// - Product: catalog record with source images and compressed derivatives
/// - TaskKey / ImageTask: one unit of image work per source image
/// - Request / response DTOs and list filters
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use validator::Validate;

use crate::error::{AppError, Result};

pub const MAX_PRODUCT_IMAGES: usize = 50;
pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

// ========================================
// Image task identity
// ========================================

/// Deterministic identity of one source image of one product.
///
/// Lowercase hex SHA-256 of `"{product_id}:{source_url}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn derive(product_id: i64, source_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(product_id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(source_url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue payload: `{"task_key", "product_id", "source_url"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTask {
    pub task_key: TaskKey,
    pub product_id: i64,
    pub source_url: String,
}

impl ImageTask {
    pub fn new(product_id: i64, source_url: impl Into<String>) -> Self {
        let source_url = source_url.into();
        Self {
            task_key: TaskKey::derive(product_id, &source_url),
            product_id,
            source_url,
        }
    }

    /// Whether `task_key` is the one derived from the other two fields
    pub fn key_is_consistent(&self) -> bool {
        self.task_key == TaskKey::derive(self.product_id, &self.source_url)
    }
}

// ========================================
// Compressed image set
// ========================================

/// Task key -> derivative URL. Stored as a JSONB object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressedImages(BTreeMap<String, String>);

impl CompressedImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.0.contains_key(key.as_str())
    }

    pub fn get(&self, key: &TaskKey) -> Option<&str> {
        self.0.get(key.as_str()).map(String::as_str)
    }

    /// Add an entry unless the key is already present. Returns whether it was added.
    pub fn insert(&mut self, key: &TaskKey, url: impl Into<String>) -> bool {
        if self.contains(key) {
            return false;
        }
        self.0.insert(key.as_str().to_string(), url.into());
        true
    }
}

/// Outcome of merging one derivative into a product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Added,
    AlreadyPresent,
}

// ========================================
// Product
// ========================================

/// Product database row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRow {
    pub id: i64,
    pub user_id: i64,
    pub product_name: String,
    pub product_description: String,
    pub product_images: Vec<String>,
    pub compressed_product_images: Json<CompressedImages>,
    pub product_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: i64,
    pub user_id: i64,
    pub product_name: String,
    pub product_description: String,
    /// Source image URLs in client order
    pub product_images: Vec<String>,
    pub compressed_product_images: CompressedImages,
    pub product_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            product_name: row.product_name,
            product_description: row.product_description,
            product_images: row.product_images,
            compressed_product_images: row.compressed_product_images.0,
            product_price: row.product_price,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl Product {
    /// One task per source image, in source order
    pub fn image_tasks(&self) -> Vec<ImageTask> {
        self.product_images
            .iter()
            .map(|url| ImageTask::new(self.id, url.as_str()))
            .collect()
    }

    /// Tasks whose derivative has not been recorded yet
    pub fn missing_image_tasks(&self) -> Vec<ImageTask> {
        self.image_tasks()
            .into_iter()
            .filter(|task| !self.compressed_product_images.contains(&task.task_key))
            .collect()
    }

    /// Derivative URLs ordered like `product_images`
    pub fn compressed_urls(&self) -> Vec<String> {
        self.image_tasks()
            .iter()
            .filter_map(|task| self.compressed_product_images.get(&task.task_key))
            .map(str::to_string)
            .collect()
    }
}

/// Product response DTO
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductResponse {
    pub id: i64,
    pub user_id: i64,
    pub product_name: String,
    pub product_description: String,
    pub product_images: Vec<String>,
    pub compressed_product_images: Vec<String>,
    pub product_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        let compressed_product_images = product.compressed_urls();
        Self {
            id: product.id,
            user_id: product.user_id,
            product_name: product.product_name,
            product_description: product.product_description,
            product_images: product.product_images,
            compressed_product_images,
            product_price: product.product_price,
            created_at: product.created_at,
            updated_at: product.updated_at,
        }
    }
}

// ========================================
// Create
// ========================================

/// Validated product ready to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub user_id: i64,
    pub product_name: String,
    pub product_description: String,
    pub product_images: Vec<String>,
    pub product_price: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(range(min = 1))]
    pub user_id: i64,

    #[validate(length(min = 1, max = 255))]
    pub product_name: String,

    #[serde(default)]
    #[validate(length(max = 10000))]
    pub product_description: String,

    #[serde(default)]
    #[validate(length(max = 50))]
    pub product_images: Vec<String>,

    #[validate(range(min = 0.0))]
    pub product_price: f64,
}

impl CreateProductRequest {
    /// Run every field check and produce the insertable form.
    pub fn into_new_product(self) -> Result<NewProduct> {
        let product_name = self.product_name.trim().to_string();
        let request = Self {
            product_name,
            ..self
        };
        request.validate()?;

        if !request.product_price.is_finite() {
            return Err(AppError::ValidationError(
                "product_price: must be a finite number".to_string(),
            ));
        }

        validate_image_urls(&request.product_images)?;

        Ok(NewProduct {
            user_id: request.user_id,
            product_name: request.product_name,
            product_description: request.product_description,
            product_images: request.product_images,
            product_price: request.product_price,
        })
    }
}

/// Every entry must be an absolute http(s) URL and appear once.
fn validate_image_urls(urls: &[String]) -> Result<()> {
    if urls.len() > MAX_PRODUCT_IMAGES {
        return Err(AppError::ValidationError(format!(
            "product_images: at most {} images allowed",
            MAX_PRODUCT_IMAGES
        )));
    }

    let mut seen = HashSet::with_capacity(urls.len());
    for (idx, raw) in urls.iter().enumerate() {
        let parsed = url::Url::parse(raw).map_err(|e| {
            AppError::ValidationError(format!("product_images[{}]: invalid URL: {}", idx, e))
        })?;

        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(AppError::ValidationError(format!(
                "product_images[{}]: must be an absolute http(s) URL",
                idx
            )));
        }

        // Same URL twice would yield the same task key
        if !seen.insert(raw.as_str()) {
            return Err(AppError::ValidationError(format!(
                "product_images[{}]: duplicate image URL {}",
                idx, raw
            )));
        }
    }

    Ok(())
}

// ========================================
// List
// ========================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProductFilters {
    pub user_id: Option<i64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    /// Case-insensitive substring of the product name
    pub name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ProductFilters {
    fn default() -> Self {
        Self {
            user_id: None,
            price_min: None,
            price_max: None,
            name: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl ProductFilters {
    /// Whether `product` passes every filter (limit/offset excluded)
    pub fn matches(&self, product: &Product) -> bool {
        self.user_id.map_or(true, |id| product.user_id == id)
            && self.price_min.map_or(true, |min| product.product_price >= min)
            && self.price_max.map_or(true, |max| product.product_price <= max)
            && self.name.as_ref().map_or(true, |needle| {
                product
                    .product_name
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
    }
}

/// Query string of `GET /products`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListProductsQuery {
    pub user_id: Option<i64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub name: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListProductsQuery {
    pub fn into_filters(self) -> Result<ProductFilters> {
        let limit = self.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit < 1 {
            return Err(AppError::BadRequest("limit must be at least 1".to_string()));
        }

        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::BadRequest("offset must not be negative".to_string()));
        }

        for price in [self.price_min, self.price_max].into_iter().flatten() {
            if !price.is_finite() || price < 0.0 {
                return Err(AppError::BadRequest(
                    "price filters must be non-negative numbers".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.price_min, self.price_max) {
            if min > max {
                return Err(AppError::BadRequest(
                    "price_min must not exceed price_max".to_string(),
                ));
            }
        }

        let name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        Ok(ProductFilters {
            user_id: self.user_id,
            price_min: self.price_min,
            price_max: self.price_max,
            name,
            limit: limit.min(MAX_LIST_LIMIT),
            offset,
        })
    }
}

// ========================================
// Reprocess
// ========================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReprocessQuery {
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessResponse {
    pub product_id: i64,
    pub enqueued: usize,
}
