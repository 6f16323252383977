/// HTTP handlers for the catalog API
///
/// All routes live under `/api/v1`. Malformed JSON bodies, paths and query
/// strings are reported with the same error body as every other `AppError`.
use actix_web::{error::InternalError, web, HttpRequest, HttpResponse};

use crate::error::AppError;

pub mod products;

pub use products::{create_product, get_product, list_products, reprocess_images};

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

fn bad_request<E: std::fmt::Display>(err: E, _req: &HttpRequest) -> actix_web::Error {
    let app_error = AppError::BadRequest(err.to_string());
    let response = actix_web::ResponseError::error_response(&app_error);
    InternalError::from_response(err.to_string(), response).into()
}

/// Register routes and extractor error handlers
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|e, req| bad_request(e, req)))
        .app_data(web::PathConfig::default().error_handler(|e, req| bad_request(e, req)))
        .app_data(web::QueryConfig::default().error_handler(|e, req| bad_request(e, req)))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health))
                .service(
                    web::scope("/products")
                        .route("", web::post().to(create_product))
                        .route("", web::get().to(list_products))
                        .route("/{id}", web::get().to(get_product))
                        .route("/{id}/reprocess", web::post().to(reprocess_images)),
                ),
        );
}
