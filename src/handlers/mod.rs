pub mod admin;
pub mod exceptions;
pub mod health;
pub mod orders;

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::services::{
    exceptions::ExceptionService, order_changes::OrderChangeService, orders::OrderService,
    reconciliation::ReconciliationService,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub order_changes: Arc<OrderChangeService>,
    pub exceptions: Arc<ExceptionService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        config: &AppConfig,
    ) -> Self {
        Self {
            orders: Arc::new(OrderService::new(db_pool.clone(), event_sender.clone())),
            order_changes: Arc::new(OrderChangeService::new(
                db_pool.clone(),
                event_sender.clone(),
            )),
            exceptions: Arc::new(ExceptionService::new(
                db_pool.clone(),
                event_sender.clone(),
                config.proposal_limits(),
            )),
            reconciliation: Arc::new(ReconciliationService::new(db_pool, event_sender)),
        }
    }
}

/// JSON body whose rejections render as the standard error body.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ServiceError::ValidationError(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Parses a body that may be omitted; an empty body yields `T::default()`.
pub fn optional_body<T>(body: &Bytes) -> Result<T, ServiceError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::services::exceptions::AcknowledgeRequest;

    #[test]
    fn empty_optional_body_is_default() {
        let request: AcknowledgeRequest = optional_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(request.note.is_none());
    }

    #[test]
    fn malformed_optional_body_is_rejected() {
        let body = Bytes::from_static(b"{\"note\": 5}");
        assert_matches!(
            optional_body::<AcknowledgeRequest>(&body),
            Err(ServiceError::ValidationError(msg)) if msg.starts_with("invalid JSON")
        );
    }
}
