/// Database access layer
///
/// - `product_repo`: products and their compressed-image sets
/// - `dead_letter_repo`: image tasks that failed for good
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod dead_letter_repo;
pub mod product_repo;

pub use dead_letter_repo::{DeadLetter, DeadLetterRecord, DeadLetterSink, PgDeadLetterStore};
pub use product_repo::{PgProductStore, ProductStore};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connect to Postgres and bring the schema up to date.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
