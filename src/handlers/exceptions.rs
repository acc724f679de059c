use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use crate::auth::Actor;
use crate::entities::order_exception;
use crate::errors::ServiceError;
use crate::handlers::{optional_body, ApiJson};
use crate::models::proposal::RawProposal;
use crate::services::exceptions::{AcknowledgeRequest, CreateExceptionRequest, ResolveRequest};
use crate::{ApiResponse, AppState};

pub fn exception_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/orders/:id/exceptions",
            get(list_order_exceptions).post(create_exception),
        )
        .route("/exceptions/:id", get(get_exception))
        .route("/exceptions/:id/proposal", post(submit_proposal))
        .route("/exceptions/:id/ack", post(acknowledge_exception))
        .route("/exceptions/:id/resolve", post(resolve_exception))
}

pub async fn list_order_exceptions(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    _actor: Actor,
) -> Result<Json<ApiResponse<Vec<order_exception::Model>>>, ServiceError> {
    let exceptions = state.services.exceptions.list_for_order(order_id).await?;
    Ok(Json(ApiResponse::success(exceptions)))
}

/// Report an exception; self-approved reports come back already acknowledged
pub async fn create_exception(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    actor: Actor,
    ApiJson(payload): ApiJson<CreateExceptionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<order_exception::Model>>), ServiceError> {
    let exception = state
        .services
        .exceptions
        .create(order_id, &actor, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(exception))))
}

pub async fn get_exception(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _actor: Actor,
) -> Result<Json<ApiResponse<order_exception::Model>>, ServiceError> {
    let exception = state.services.exceptions.get(id).await?;
    Ok(Json(ApiResponse::success(exception)))
}

pub async fn submit_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    ApiJson(payload): ApiJson<RawProposal>,
) -> Result<Json<ApiResponse<order_exception::Model>>, ServiceError> {
    let exception = state.services.exceptions.propose(id, &actor, payload).await?;
    Ok(Json(ApiResponse::success(exception)))
}

pub async fn acknowledge_exception(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    body: Bytes,
) -> Result<Json<ApiResponse<order_exception::Model>>, ServiceError> {
    let request: AcknowledgeRequest = optional_body(&body)?;
    let exception = state
        .services
        .exceptions
        .acknowledge(id, &actor, request)
        .await?;
    Ok(Json(ApiResponse::success(exception)))
}

pub async fn resolve_exception(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    ApiJson(payload): ApiJson<ResolveRequest>,
) -> Result<Json<ApiResponse<order_exception::Model>>, ServiceError> {
    let exception = state.services.exceptions.resolve(id, &actor, payload).await?;
    Ok(Json(ApiResponse::success(exception)))
}
