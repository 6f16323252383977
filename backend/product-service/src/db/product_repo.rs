/// Product repository - database operations for products
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::{
    AppendOutcome, CompressedImages, NewProduct, Product, ProductFilters, ProductRow, TaskKey,
};

const PRODUCT_COLUMNS: &str = "id, user_id, product_name, product_description, product_images, \
     compressed_product_images, product_price, created_at, updated_at";

/// Persistence operations the rest of the service depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn create_product(&self, product: &NewProduct) -> Result<Product>;

    async fn get_product_by_id(&self, id: i64) -> Result<Option<Product>>;

    async fn list_products(&self, filters: &ProductFilters) -> Result<Vec<Product>>;

    /// Add `task_key -> url` to the compressed set unless the key is already
    /// there. Safe to call concurrently for the same product. Fails with
    /// `NotFound` if the product does not exist.
    async fn append_compressed_image(
        &self,
        id: i64,
        task_key: &TaskKey,
        url: &str,
    ) -> Result<AppendOutcome>;

    /// Replace the whole compressed set. Fails with `NotFound` if the
    /// product does not exist.
    async fn update_compressed_images(&self, id: i64, images: &CompressedImages) -> Result<()>;
}

#[derive(Clone)]
pub struct PgProductStore {
    pool: PgPool,
}

impl PgProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Escape LIKE wildcards so user input matches literally
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Product {} not found", id))
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn create_product(&self, product: &NewProduct) -> Result<Product> {
        let sql = format!(
            r#"
            INSERT INTO products (user_id, product_name, product_description, product_images, product_price)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            PRODUCT_COLUMNS
        );

        let row = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(product.user_id)
            .bind(&product.product_name)
            .bind(&product.product_description)
            .bind(&product.product_images)
            .bind(product.product_price)
            .fetch_one(&self.pool)
            .await?;

        debug!(product_id = row.id, images = row.product_images.len(), "Product inserted");
        Ok(row.into())
    }

    async fn get_product_by_id(&self, id: i64) -> Result<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE id = $1", PRODUCT_COLUMNS);

        let row = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Product::from))
    }

    async fn list_products(&self, filters: &ProductFilters) -> Result<Vec<Product>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM products WHERE TRUE",
            PRODUCT_COLUMNS
        ));

        if let Some(user_id) = filters.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(min) = filters.price_min {
            qb.push(" AND product_price >= ").push_bind(min);
        }
        if let Some(max) = filters.price_max {
            qb.push(" AND product_price <= ").push_bind(max);
        }
        if let Some(name) = &filters.name {
            qb.push(" AND product_name ILIKE ")
                .push_bind(format!("%{}%", escape_like(name)));
        }

        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filters.limit)
            .push(" OFFSET ")
            .push_bind(filters.offset);

        let rows = qb
            .build_query_as::<ProductRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn append_compressed_image(
        &self,
        id: i64,
        task_key: &TaskKey,
        url: &str,
    ) -> Result<AppendOutcome> {
        // The row lock serialises concurrent appends for one product, and
        // `present` is evaluated against the locked (latest) version.
        let present: Option<bool> = sqlx::query_scalar(
            r#"
            WITH target AS (
                SELECT id, compressed_product_images ? $2 AS present
                FROM products
                WHERE id = $1
                FOR UPDATE
            )
            UPDATE products p
            SET compressed_product_images = CASE
                    WHEN target.present THEN p.compressed_product_images
                    ELSE p.compressed_product_images || jsonb_build_object($2::text, $3::text)
                END,
                updated_at = CASE WHEN target.present THEN p.updated_at ELSE NOW() END
            FROM target
            WHERE p.id = target.id
            RETURNING target.present
            "#,
        )
        .bind(id)
        .bind(task_key.as_str())
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        match present {
            None => Err(not_found(id)),
            Some(true) => Ok(AppendOutcome::AlreadyPresent),
            Some(false) => Ok(AppendOutcome::Added),
        }
    }

    async fn update_compressed_images(&self, id: i64, images: &CompressedImages) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET compressed_product_images = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(images))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }
}
