/// Product handlers - HTTP endpoints for the catalog
use actix_web::{web, HttpResponse};

use crate::error::Result;
use crate::models::{
    CreateProductRequest, ListProductsQuery, ProductResponse, ReprocessQuery, ReprocessResponse,
};
use crate::services::ProductService;

/// Create a product and queue its images for compression
pub async fn create_product(
    service: web::Data<ProductService>,
    req: web::Json<CreateProductRequest>,
) -> Result<HttpResponse> {
    let product = service.create_product(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(ProductResponse::from(product)))
}

/// Get a product. `compressed_product_images` fills in as the workers finish.
pub async fn get_product(
    service: web::Data<ProductService>,
    product_id: web::Path<i64>,
) -> Result<HttpResponse> {
    let product = service.get_product(product_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ProductResponse::from(product)))
}

/// List products matching the query filters
pub async fn list_products(
    service: web::Data<ProductService>,
    query: web::Query<ListProductsQuery>,
) -> Result<HttpResponse> {
    let filters = query.into_inner().into_filters()?;
    let products = service.list_products(&filters).await?;

    let responses: Vec<ProductResponse> = products.into_iter().map(Into::into).collect();
    Ok(HttpResponse::Ok().json(responses))
}

/// Queue image tasks again for a product
pub async fn reprocess_images(
    service: web::Data<ProductService>,
    product_id: web::Path<i64>,
    query: web::Query<ReprocessQuery>,
) -> Result<HttpResponse> {
    let product_id = product_id.into_inner();
    let enqueued = service.reprocess_images(product_id, query.reset).await?;

    Ok(HttpResponse::Accepted().json(ReprocessResponse {
        product_id,
        enqueued,
    }))
}
