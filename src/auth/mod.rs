//! Actor identity and role capabilities.
//!
//! Tokens are verified upstream; the gateway forwards the caller as
//! `x-actor-id` / `x-actor-role` headers and this module turns them into an
//! [`Actor`].

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::entities::order;
use crate::errors::ServiceError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Role {
    Admin,
    Supervisor,
    Operator,
    Viewer,
}

/// Something an actor may be allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// Open exceptions against an order.
    Report,
    /// Attach or replace an order-change proposal.
    SubmitProposal,
    /// Acknowledge and resolve exceptions.
    Approve,
    /// Claim orders and record pick/pack scans.
    Scan,
    /// Import and void orders.
    ManageOrders,
    /// Operational tooling such as reconciliation.
    Administer,
}

impl Role {
    pub fn grants(self, capability: Capability) -> bool {
        match capability {
            Capability::Report | Capability::SubmitProposal | Capability::Scan => {
                matches!(self, Role::Admin | Role::Supervisor | Role::Operator)
            }
            Capability::Approve | Capability::ManageOrders => {
                matches!(self, Role::Admin | Role::Supervisor)
            }
            Capability::Administer => self == Role::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.role.grants(capability)
    }

    /// Fails with `Forbidden` when the role lacks `capability`.
    pub fn require(&self, capability: Capability) -> Result<(), ServiceError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "role {} may not {}",
                self.role, capability
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The actor is the operator who claimed the order.
    pub fn owns_order(&self, order: &order::Model) -> bool {
        order.claimed_by == Some(self.user_id)
    }

    /// Administrators approve their own reports on orders they are working.
    pub fn can_self_approve(&self, order: &order::Model) -> bool {
        self.is_admin() && self.owns_order(order)
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ServiceError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ServiceError::Unauthorized(format!("missing {} header", name)))
        };

        let user_id = Uuid::parse_str(header(ACTOR_ID_HEADER)?).map_err(|_| {
            ServiceError::Unauthorized(format!("malformed {} header", ACTOR_ID_HEADER))
        })?;
        let role = Role::from_str(header(ACTOR_ROLE_HEADER)?).map_err(|_| {
            ServiceError::Unauthorized(format!("unknown role in {} header", ACTOR_ROLE_HEADER))
        })?;

        Ok(Self { user_id, role })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Actor::from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;
    use chrono::Utc;

    use crate::models::order::OrderStatus;

    fn order_claimed_by(claimed_by: Option<Uuid>) -> order::Model {
        order::Model {
            id: Uuid::new_v4(),
            order_number: "SO-1".into(),
            status: OrderStatus::Picking,
            claimed_by,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn role_capabilities() {
        assert!(Role::Operator.grants(Capability::SubmitProposal));
        assert!(!Role::Operator.grants(Capability::Approve));
        assert!(Role::Supervisor.grants(Capability::Approve));
        assert!(!Role::Supervisor.grants(Capability::Administer));
        assert!(!Role::Viewer.grants(Capability::Report));
        assert!(Role::Admin.grants(Capability::Administer));
    }

    #[test]
    fn self_approval_requires_admin_and_ownership() {
        let id = Uuid::new_v4();
        let admin = Actor::new(id, Role::Admin);
        let supervisor = Actor::new(id, Role::Supervisor);

        assert!(admin.can_self_approve(&order_claimed_by(Some(id))));
        assert!(!admin.can_self_approve(&order_claimed_by(Some(Uuid::new_v4()))));
        assert!(!admin.can_self_approve(&order_claimed_by(None)));
        assert!(!supervisor.can_self_approve(&order_claimed_by(Some(id))));
    }

    #[test]
    fn require_reports_forbidden() {
        let viewer = Actor::new(Uuid::new_v4(), Role::Viewer);
        assert_matches!(viewer.require(Capability::Approve), Err(ServiceError::Forbidden(_)));
    }

    #[test]
    fn actor_from_headers() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_str(&id.to_string()).unwrap());
        headers.insert(ACTOR_ROLE_HEADER, HeaderValue::from_static("Supervisor"));
        assert_eq!(
            Actor::from_headers(&headers).unwrap(),
            Actor::new(id, Role::Supervisor)
        );

        headers.insert(ACTOR_ROLE_HEADER, HeaderValue::from_static("root"));
        assert_matches!(
            Actor::from_headers(&headers),
            Err(ServiceError::Unauthorized(_))
        );

        headers.remove(ACTOR_ID_HEADER);
        assert_matches!(
            Actor::from_headers(&headers),
            Err(ServiceError::Unauthorized(msg)) if msg.contains(ACTOR_ID_HEADER)
        );
    }
}
