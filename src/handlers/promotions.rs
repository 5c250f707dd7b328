use super::common::ApiJson;
use crate::{
    auth::AdminUser,
    errors::ServiceError,
    services::promotions::{CreatePromotionInput, PromotionView, UpdatePromotionInput},
    ApiResponse, AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct PromotionListQuery {
    #[serde(default)]
    pub active: bool,
}

pub async fn list_promotions(
    State(state): State<AppState>,
    Query(query): Query<PromotionListQuery>,
) -> Result<Json<ApiResponse<Vec<PromotionView>>>, ServiceError> {
    let promotions = state.services.promotions.list_promotions(query.active).await?;
    Ok(Json(ApiResponse::success(promotions)))
}

pub async fn get_promotion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PromotionView>>, ServiceError> {
    let promotion = state.services.promotions.get_promotion(id).await?;
    Ok(Json(ApiResponse::success(promotion)))
}

/// Create a promotion; member prices change immediately
pub async fn create_promotion(
    State(state): State<AppState>,
    _admin: AdminUser,
    ApiJson(input): ApiJson<CreatePromotionInput>,
) -> Result<(StatusCode, Json<ApiResponse<PromotionView>>), ServiceError> {
    let promotion = state.services.promotions.create_promotion(input).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(promotion))))
}

pub async fn update_promotion(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    ApiJson(input): ApiJson<UpdatePromotionInput>,
) -> Result<Json<ApiResponse<PromotionView>>, ServiceError> {
    let promotion = state.services.promotions.update_promotion(id, input).await?;
    Ok(Json(ApiResponse::success(promotion)))
}

pub async fn delete_promotion(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ServiceError> {
    state.services.promotions.delete_promotion(id).await?;
    Ok(Json(ApiResponse::message("Promotion deleted")))
}
