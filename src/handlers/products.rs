use super::common::{default_page, default_per_page, ApiJson, PaginationParams};
use crate::{
    auth::AdminUser,
    entities::product,
    errors::ServiceError,
    services::catalog::{CreateProductInput, UpdateProductInput},
    ApiResponse, AppState, PaginatedResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ProductListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page", alias = "perPage", alias = "limit")]
    pub per_page: u64,
    #[serde(alias = "categoryId", alias = "category")]
    pub category_id: Option<Uuid>,
}

impl ProductListQuery {
    fn pagination(&self) -> PaginationParams {
        PaginationParams {
            page: self.page,
            per_page: self.per_page,
        }
    }
}

/// List live products, newest first
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<product::Model>>>, ServiceError> {
    let pagination = query.pagination();
    let page = pagination.page();
    let (products, total) = state
        .services
        .catalog
        .list_products(page, pagination.per_page(), query.category_id)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        products,
        total,
        page,
        pagination.per_page(),
    ))))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<product::Model>>, ServiceError> {
    let product = state.services.catalog.get_product(id).await?;
    Ok(Json(ApiResponse::success(product)))
}

pub async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    ApiJson(input): ApiJson<CreateProductInput>,
) -> Result<(StatusCode, Json<ApiResponse<product::Model>>), ServiceError> {
    let product = state.services.catalog.create_product(input).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(product))))
}

pub async fn update_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    ApiJson(input): ApiJson<UpdateProductInput>,
) -> Result<Json<ApiResponse<product::Model>>, ServiceError> {
    let product = state.services.catalog.update_product(id, input).await?;
    Ok(Json(ApiResponse::success(product)))
}

pub async fn delete_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ServiceError> {
    state.services.catalog.delete_product(id).await?;
    Ok(Json(ApiResponse::message("Product deleted")))
}
