//! Exception lifecycle: `open -> ack -> resolved`.
//!
//! Acknowledging an `order_change` exception runs the change applier in the
//! same transaction as the status flip, so either both happen or neither.
//! Transitions are conditional updates on the current status; when no row
//! matches, the caller learns the status the exception actually has.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::{Actor, Capability};
use crate::db::{self, DbPool};
use crate::entities::order;
use crate::entities::order_exception::{self, Entity as OrderExceptionEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::exception::{ExceptionStatus, ExceptionType, ResolutionAction};
use crate::models::proposal::{Proposal, ProposalLimits, RawProposal};
use crate::services::order_changes::{ApplyReport, OrderChangeService};

const SELF_APPROVAL_NOTE: &str = "approved by reporting administrator";

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateExceptionRequest {
    pub exception_type: ExceptionType,
    #[validate(length(min = 1, max = 2000, message = "reason must be 1-2000 characters"))]
    pub reason: String,
    #[serde(default)]
    pub proposal: Option<RawProposal>,
    /// Recorded as the acknowledgement note when the report is self-approved.
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default)]
    pub resolution_action: Option<ResolutionAction>,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct ExceptionService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    limits: ProposalLimits,
}

impl ExceptionService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        limits: ProposalLimits,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            limits,
        }
    }

    /// Opens an exception. An administrator reporting on an order they have
    /// claimed gets the acknowledgement in the same transaction.
    #[instrument(skip(self, request), fields(order_id = %order_id, actor_id = %actor.user_id, exception_type = %request.exception_type))]
    pub async fn create(
        &self,
        order_id: Uuid,
        actor: &Actor,
        request: CreateExceptionRequest,
    ) -> Result<order_exception::Model, ServiceError> {
        actor.require(Capability::Report)?;
        request.validate()?;

        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError("reason is required".into()));
        }

        let exception_type = request.exception_type;
        let proposal = match request.proposal {
            Some(raw) if exception_type.carries_proposal() => {
                actor.require(Capability::SubmitProposal)?;
                Some(Proposal::validate(raw, &self.limits)?)
            }
            Some(_) => {
                return Err(ServiceError::ValidationError(format!(
                    "{} exceptions do not carry a proposal",
                    exception_type
                )))
            }
            None => None,
        };
        let snapshot = proposal.as_ref().map(serde_json::to_value).transpose()?;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin exception transaction");
            ServiceError::DatabaseError(e)
        })?;

        let order = db::lock_order(&txn, order_id).await?;

        if exception_type == ExceptionType::OrderChange {
            let open = OrderExceptionEntity::find()
                .filter(order_exception::Column::OrderId.eq(order_id))
                .filter(order_exception::Column::ExceptionType.eq(ExceptionType::OrderChange))
                .filter(order_exception::Column::Status.eq(ExceptionStatus::Open))
                .one(&txn)
                .await?;
            if let Some(open) = open {
                counter!("fulfillment.exceptions.rejected", 1, "kind" => "open_order_change");
                return Err(ServiceError::Conflict(format!(
                    "order {} already has open order_change exception {}",
                    order.order_number, open.id
                )));
            }
        }

        let now = Utc::now();
        let exception = order_exception::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            exception_type: Set(exception_type),
            status: Set(ExceptionStatus::Open),
            reason: Set(reason.to_string()),
            snapshot: Set(snapshot),
            apply_report: Set(None),
            created_by: Set(actor.user_id),
            created_at: Set(now),
            ack_by: Set(None),
            ack_at: Set(None),
            ack_note: Set(None),
            resolved_by: Set(None),
            resolved_at: Set(None),
            resolution_action: Set(None),
            resolution_note: Set(None),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        // An order change without a proposal has nothing to approve yet.
        let self_approve = actor.can_self_approve(&order)
            && (!exception_type.carries_proposal() || proposal.is_some());

        let (exception, report) = if self_approve {
            let note = request.note.or_else(|| Some(SELF_APPROVAL_NOTE.to_string()));
            Self::transition_to_ack(&txn, &order, &exception, actor, note).await?
        } else {
            (exception, None)
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit exception creation");
            ServiceError::DatabaseError(e)
        })?;

        counter!("fulfillment.exceptions.created", 1, "type" => exception_type.to_string());
        info!(exception_id = %exception.id, self_approved = self_approve, "Exception created");

        self.publish(Event::ExceptionCreated {
            exception_id: exception.id,
            order_id,
            exception_type,
            actor_id: actor.user_id,
        })
        .await;
        if self_approve {
            self.publish_ack(&exception, actor, true, report.as_ref()).await;
        }

        Ok(exception)
    }

    /// Attaches or replaces the proposal of an open `order_change` exception.
    #[instrument(skip(self, raw), fields(exception_id = %exception_id, actor_id = %actor.user_id))]
    pub async fn propose(
        &self,
        exception_id: Uuid,
        actor: &Actor,
        raw: RawProposal,
    ) -> Result<order_exception::Model, ServiceError> {
        actor.require(Capability::SubmitProposal)?;
        let proposal = Proposal::validate(raw, &self.limits)?;

        let txn = self.db_pool.begin().await?;
        let exception = find_exception(&txn, exception_id).await?;
        if !exception.exception_type.carries_proposal() {
            return Err(ServiceError::ValidationError(format!(
                "{} exceptions do not carry a proposal",
                exception.exception_type
            )));
        }

        let changes = order_exception::ActiveModel {
            snapshot: Set(Some(serde_json::to_value(&proposal)?)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let result = OrderExceptionEntity::update_many()
            .set(changes)
            .filter(order_exception::Column::Id.eq(exception_id))
            .filter(order_exception::Column::Status.eq(ExceptionStatus::Open))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(
                transition_conflict(&txn, exception_id, ExceptionStatus::Open, "amend").await,
            );
        }

        let updated = find_exception(&txn, exception_id).await?;
        txn.commit().await?;

        info!(items = proposal.items().len(), "Proposal attached");
        self.publish(Event::ProposalSubmitted {
            exception_id,
            order_id: updated.order_id,
            actor_id: actor.user_id,
        })
        .await;

        Ok(updated)
    }

    /// `open -> ack`. For order changes the proposal is applied first; any
    /// failure leaves the exception open and the order untouched.
    #[instrument(skip(self, request), fields(exception_id = %exception_id, actor_id = %actor.user_id))]
    pub async fn acknowledge(
        &self,
        exception_id: Uuid,
        actor: &Actor,
        request: AcknowledgeRequest,
    ) -> Result<order_exception::Model, ServiceError> {
        actor.require(Capability::Approve)?;
        request.validate()?;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin acknowledgement transaction");
            ServiceError::DatabaseError(e)
        })?;

        let order_id = find_exception(&txn, exception_id).await?.order_id;
        let order = db::lock_order(&txn, order_id).await?;
        // Re-read under the order lock; a concurrent ack may have won.
        let exception = find_exception(&txn, exception_id).await?;
        if exception.status != ExceptionStatus::Open {
            return Err(ServiceError::Conflict(format!(
                "cannot acknowledge exception {}: status is {}, expected {}",
                exception_id,
                exception.status,
                ExceptionStatus::Open
            )));
        }

        let (exception, report) =
            match Self::transition_to_ack(&txn, &order, &exception, actor, request.note).await {
                Ok(acked) => acked,
                Err(e) => {
                    counter!("fulfillment.exceptions.ack_failed", 1, "kind" => e.kind());
                    warn!(error = %e, "Acknowledgement rolled back");
                    return Err(e);
                }
            };

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit acknowledgement");
            ServiceError::DatabaseError(e)
        })?;

        info!("Exception acknowledged");
        self.publish_ack(&exception, actor, false, report.as_ref()).await;
        Ok(exception)
    }

    /// `ack -> resolved`, never straight from `open`.
    #[instrument(skip(self, request), fields(exception_id = %exception_id, actor_id = %actor.user_id))]
    pub async fn resolve(
        &self,
        exception_id: Uuid,
        actor: &Actor,
        request: ResolveRequest,
    ) -> Result<order_exception::Model, ServiceError> {
        actor.require(Capability::Approve)?;
        request.validate()?;
        let action = request.resolution_action.ok_or_else(|| {
            ServiceError::ValidationError("resolutionAction is required".into())
        })?;

        let txn = self.db_pool.begin().await?;
        let now = Utc::now();
        let changes = order_exception::ActiveModel {
            status: Set(ExceptionStatus::Resolved),
            resolved_by: Set(Some(actor.user_id)),
            resolved_at: Set(Some(now)),
            resolution_action: Set(Some(action)),
            resolution_note: Set(request.note),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = OrderExceptionEntity::update_many()
            .set(changes)
            .filter(order_exception::Column::Id.eq(exception_id))
            .filter(order_exception::Column::Status.eq(ExceptionStatus::Ack))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(
                transition_conflict(&txn, exception_id, ExceptionStatus::Ack, "resolve").await,
            );
        }

        let resolved = find_exception(&txn, exception_id).await?;
        txn.commit().await?;

        counter!("fulfillment.exceptions.resolved", 1, "action" => action.to_string());
        info!(action = %action, "Exception resolved");
        self.publish(Event::ExceptionResolved {
            exception_id,
            order_id: resolved.order_id,
            actor_id: actor.user_id,
            action,
        })
        .await;

        Ok(resolved)
    }

    pub async fn get(&self, exception_id: Uuid) -> Result<order_exception::Model, ServiceError> {
        find_exception(&*self.db_pool, exception_id).await
    }

    /// Exceptions of one order, newest first.
    pub async fn list_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_exception::Model>, ServiceError> {
        let db = &*self.db_pool;
        order::Entity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        Ok(OrderExceptionEntity::find()
            .filter(order_exception::Column::OrderId.eq(order_id))
            .order_by_desc(order_exception::Column::CreatedAt)
            .order_by_desc(order_exception::Column::Id)
            .all(db)
            .await?)
    }

    /// Shared by manual and self-approval. The caller holds the order lock.
    async fn transition_to_ack<C>(
        conn: &C,
        order: &order::Model,
        exception: &order_exception::Model,
        actor: &Actor,
        note: Option<String>,
    ) -> Result<(order_exception::Model, Option<ApplyReport>), ServiceError>
    where
        C: ConnectionTrait,
    {
        let report = if exception.exception_type.carries_proposal() {
            let snapshot = exception.snapshot.clone().ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "exception {} has no proposal to apply",
                    exception.id
                ))
            })?;
            let proposal = Proposal::from_snapshot(snapshot)?;
            Some(
                OrderChangeService::apply_in_txn(conn, order.id, &proposal, actor.user_id)
                    .await?,
            )
        } else {
            None
        };

        let now = Utc::now();
        let changes = order_exception::ActiveModel {
            status: Set(ExceptionStatus::Ack),
            ack_by: Set(Some(actor.user_id)),
            ack_at: Set(Some(now)),
            ack_note: Set(note),
            apply_report: Set(report.as_ref().map(serde_json::to_value).transpose()?),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = OrderExceptionEntity::update_many()
            .set(changes)
            .filter(order_exception::Column::Id.eq(exception.id))
            .filter(order_exception::Column::Status.eq(ExceptionStatus::Open))
            .exec(conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(
                transition_conflict(conn, exception.id, ExceptionStatus::Open, "acknowledge")
                    .await,
            );
        }

        Ok((find_exception(conn, exception.id).await?, report))
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    async fn publish_ack(
        &self,
        exception: &order_exception::Model,
        actor: &Actor,
        self_approved: bool,
        report: Option<&ApplyReport>,
    ) {
        counter!(
            "fulfillment.exceptions.acknowledged",
            1,
            "self_approved" => self_approved.to_string()
        );
        if let Some(report) = report {
            counter!("fulfillment.order_change.applied", 1);
            self.publish(Event::OrderChangeApplied {
                order_id: report.order_id,
                exception_id: Some(exception.id),
                actor_id: actor.user_id,
                previous_status: report.previous_status,
                items: report.items.len(),
                at: report.applied_at,
            })
            .await;
        }
        self.publish(Event::ExceptionAcknowledged {
            exception_id: exception.id,
            order_id: exception.order_id,
            actor_id: actor.user_id,
            self_approved,
        })
        .await;
    }
}

async fn find_exception<C>(
    conn: &C,
    exception_id: Uuid,
) -> Result<order_exception::Model, ServiceError>
where
    C: ConnectionTrait,
{
    OrderExceptionEntity::find_by_id(exception_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Exception {} not found", exception_id)))
}

/// Error for a conditional transition that matched no row.
async fn transition_conflict<C>(
    conn: &C,
    exception_id: Uuid,
    expected: ExceptionStatus,
    action: &str,
) -> ServiceError
where
    C: ConnectionTrait,
{
    match find_exception(conn, exception_id).await {
        Ok(current) => ServiceError::Conflict(format!(
            "cannot {} exception {}: status is {}, expected {}",
            action, exception_id, current.status, expected
        )),
        Err(e) => e,
    }
}
