use axum::{body::Bytes, extract::State, response::Json, routing::post, Router};
use serde::Deserialize;

use crate::auth::{Actor, Capability};
use crate::errors::ServiceError;
use crate::handlers::optional_body;
use crate::services::reconciliation::{ReconcileOptions, ReconciliationReport};
use crate::{ApiResponse, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub limit: Option<u64>,
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/admin/reconcile", post(run_reconciliation))
}

/// Runs the status reconciliation job synchronously
pub async fn run_reconciliation(
    State(state): State<AppState>,
    actor: Actor,
    body: Bytes,
) -> Result<Json<ApiResponse<ReconciliationReport>>, ServiceError> {
    actor.require(Capability::Administer)?;
    let request: ReconcileRequest = optional_body(&body)?;

    let options = ReconcileOptions {
        dry_run: request.dry_run,
        batch_size: state.config.reconcile_batch_size,
        limit: request.limit,
    };
    let report = state.services.reconciliation.run(options).await?;
    Ok(Json(ApiResponse::success(report)))
}
