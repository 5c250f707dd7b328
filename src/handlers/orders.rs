use super::common::{ApiJson, PaginationParams};
use crate::{
    auth::{AdminUser, AuthUser},
    entities::order::{self, OrderStatus},
    errors::ServiceError,
    services::orders::{CreateOrderInput, OrderView},
    ApiResponse, AppState, PaginatedResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order: OrderView,
    pub payment_link: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

/// Place an order for the authenticated user
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    ApiJson(input): ApiJson<CreateOrderInput>,
) -> Result<(StatusCode, Json<ApiResponse<CreateOrderResponse>>), ServiceError> {
    let created = state
        .services
        .orders
        .create_order(&auth_user.user_id, input)
        .await?;

    info!(order_id = %created.order.order.id, user = %auth_user.user_id, "Order placed");
    let message = match created.payment_link {
        Some(_) => "Order created, awaiting payment",
        None => "Order created",
    };
    let response = CreateOrderResponse {
        order: created.order,
        payment_link: created.payment_link,
        message: message.to_string(),
    };
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// The caller's orders; admins see every order
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(params): Query<PaginationParams>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderView>>>, ServiceError> {
    let page = params.page();
    let (orders, total) = state
        .services
        .orders
        .list_orders(&auth_user, page, params.per_page())
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        orders,
        total,
        page,
        params.per_page(),
    ))))
}

pub async fn get_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order = state.services.orders.get_order(id, &auth_user).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Admin status change
pub async fn update_order_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    let order = state
        .services
        .orders
        .update_status(id, request.status)
        .await?;

    info!(order_id = %id, status = %order.status, admin = %admin.user_id, "Order status updated");
    Ok(Json(ApiResponse::success(order)))
}
