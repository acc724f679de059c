use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use crate::auth::Actor;
use crate::entities::order;
use crate::errors::ServiceError;
use crate::handlers::ApiJson;
use crate::services::orders::{CreateOrderRequest, OrderDetail, ScanRequest, ScanResult};
use crate::{ApiResponse, AppState};

pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/claim", post(claim_order))
        .route("/orders/:id/void", post(void_order))
        .route("/orders/:id/pick", post(record_pick))
        .route("/orders/:id/pack", post(record_pack))
}

/// Import an order with its lines
pub async fn create_order(
    State(state): State<AppState>,
    actor: Actor,
    ApiJson(payload): ApiJson<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderDetail>>), ServiceError> {
    let detail = state.services.orders.create_order(&actor, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(detail))))
}

/// Order with lines, serials and the status its lines support
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _actor: Actor,
) -> Result<Json<ApiResponse<OrderDetail>>, ServiceError> {
    let detail = state.services.orders.get_order(id).await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn claim_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    let order = state.services.orders.claim_order(id, &actor).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn void_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    let order = state.services.orders.void_order(id, &actor).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn record_pick(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    ApiJson(payload): ApiJson<ScanRequest>,
) -> Result<Json<ApiResponse<ScanResult>>, ServiceError> {
    let result = state.services.orders.record_pick(id, &actor, payload).await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn record_pack(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    ApiJson(payload): ApiJson<ScanRequest>,
) -> Result<Json<ApiResponse<ScanResult>>, ServiceError> {
    let result = state.services.orders.record_pack(id, &actor, payload).await?;
    Ok(Json(ApiResponse::success(result)))
}
