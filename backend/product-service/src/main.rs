/// Product Service - HTTP Server
///
/// Serves the catalog API and queues image tasks as products are created.
/// Compression happens in the separate `image-worker` binary.
use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use anyhow::Context;
use product_service::db::{self, PgProductStore};
use product_service::handlers;
use product_service::services::{Enqueuer, ProductService};
use product_service::Config;
use std::sync::Arc;
use task_queue::{RedisStreamQueue, TaskQueue};
use tracing::info;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "product_service=info,task_queue=info,actix_web=info".into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let bind_address = format!("{}:{}", config.app.host, config.app.port);

    let pool = db::init_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to initialize database")?;

    let queue = Arc::new(
        RedisStreamQueue::connect(&config.queue.redis_url, config.queue.stream_config())
            .await
            .context("Failed to connect to image queue")?,
    );
    queue
        .declare()
        .await
        .context("Failed to declare image queue")?;
    info!(stream = %config.queue.stream, "Image queue ready");

    let service = web::Data::new(ProductService::new(
        Arc::new(PgProductStore::new(pool)),
        Enqueuer::new(queue),
    ));

    info!(address = %bind_address, "Product service starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .wrap(actix_middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {}", bind_address))?
    .run()
    .await?;

    info!("Product service shutting down");
    Ok(())
}
