//! Status drift repair.
//!
//! Orders whose stored status is `picked`, `packing` or `completed` are
//! compared with the status derived from their lines. A stored status that
//! is ahead of the evidence is moved back; one that lags is only counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::entities::order::{self, Entity as OrderEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::order::OrderStatus;
use crate::services::order_status::derive_for_order;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Report corrections without writing them.
    pub dry_run: bool,
    pub batch_size: u64,
    /// Stop after this many candidates.
    pub limit: Option<u64>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 200,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCorrection {
    pub order_id: Uuid,
    pub order_number: String,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub dry_run: bool,
    pub scanned: u64,
    pub corrections: Vec<StatusCorrection>,
    /// Orders whose lines show more progress than their status. Left alone.
    pub ahead: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

enum Outcome {
    Consistent,
    Ahead,
    Corrected(StatusCorrection),
    /// Status changed to a non-candidate before the lock was taken.
    Skipped,
}

#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl ReconciliationService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self), fields(dry_run = options.dry_run, batch_size = options.batch_size))]
    pub async fn run(
        &self,
        options: ReconcileOptions,
    ) -> Result<ReconciliationReport, ServiceError> {
        if options.batch_size == 0 {
            return Err(ServiceError::ValidationError(
                "batch size must be at least 1".into(),
            ));
        }

        let start = Instant::now();
        let mut report = ReconciliationReport {
            dry_run: options.dry_run,
            scanned: 0,
            corrections: Vec::new(),
            ahead: 0,
            failed: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;
        'pages: loop {
            let page = self.next_page(cursor, options.batch_size).await?;
            let Some(last) = page.last() else { break };
            cursor = Some((last.created_at, last.id));
            let page_len = page.len() as u64;

            for candidate in page {
                if options.limit.is_some_and(|limit| report.scanned >= limit) {
                    break 'pages;
                }
                report.scanned += 1;

                match self.reconcile_order(candidate.id, options.dry_run).await {
                    Ok(Outcome::Corrected(correction)) => {
                        info!(
                            order_id = %correction.order_id,
                            from = %correction.from,
                            to = %correction.to,
                            applied = correction.applied,
                            "Status drift found"
                        );
                        report.corrections.push(correction);
                    }
                    Ok(Outcome::Ahead) => report.ahead += 1,
                    Ok(Outcome::Consistent | Outcome::Skipped) => {}
                    Err(e) => {
                        error!(order_id = %candidate.id, error = %e, "Failed to reconcile order");
                        report.failed += 1;
                    }
                }
            }

            if page_len < options.batch_size {
                break;
            }
        }

        report.finished_at = Utc::now();
        let applied = report.corrections.iter().filter(|c| c.applied).count() as u64;
        counter!("fulfillment.reconcile.scanned", report.scanned);
        counter!("fulfillment.reconcile.corrections", applied);
        histogram!("fulfillment.reconcile.duration", start.elapsed());
        info!(
            scanned = report.scanned,
            drifted = report.corrections.len(),
            applied,
            ahead = report.ahead,
            failed = report.failed,
            "Reconciliation finished"
        );

        Ok(report)
    }

    /// Candidates after `cursor`, in `(created_at, id)` order. Keyset paging
    /// keeps the scan stable while corrected orders leave the candidate set.
    async fn next_page(
        &self,
        cursor: Option<(DateTime<Utc>, Uuid)>,
        batch_size: u64,
    ) -> Result<Vec<order::Model>, ServiceError> {
        let mut query = OrderEntity::find()
            .filter(order::Column::Status.is_in(OrderStatus::ADVANCED))
            .order_by_asc(order::Column::CreatedAt)
            .order_by_asc(order::Column::Id)
            .limit(batch_size);

        if let Some((created_at, id)) = cursor {
            query = query.filter(
                Condition::any()
                    .add(order::Column::CreatedAt.gt(created_at))
                    .add(
                        Condition::all()
                            .add(order::Column::CreatedAt.eq(created_at))
                            .add(order::Column::Id.gt(id)),
                    ),
            );
        }

        Ok(query.all(&*self.db_pool).await?)
    }

    async fn reconcile_order(
        &self,
        order_id: Uuid,
        dry_run: bool,
    ) -> Result<Outcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = db::lock_order(&txn, order_id).await?;
        let stored = order.status;
        if !OrderStatus::ADVANCED.contains(&stored) {
            return Ok(Outcome::Skipped);
        }

        let derived = derive_for_order(&txn, order_id).await?;
        let outcome = match (derived.rank(), stored.rank()) {
            (Some(derived_rank), Some(stored_rank)) if derived_rank < stored_rank => {
                if !dry_run {
                    let mut active = order.clone().into_active_model();
                    active.status = Set(derived);
                    if stored == OrderStatus::Completed {
                        active.completed_at = Set(None);
                    }
                    active.updated_at = Set(Utc::now());
                    active.update(&txn).await?;
                    txn.commit().await?;

                    if let Some(sender) = &self.event_sender {
                        sender
                            .send_or_log(Event::StatusCorrected {
                                order_id,
                                from: stored,
                                to: derived,
                            })
                            .await;
                    }
                }
                Outcome::Corrected(StatusCorrection {
                    order_id,
                    order_number: order.order_number,
                    from: stored,
                    to: derived,
                    applied: !dry_run,
                })
            }
            (Some(derived_rank), Some(stored_rank)) if derived_rank > stored_rank => {
                warn!(
                    order_id = %order_id,
                    stored = %stored,
                    derived = %derived,
                    "Order status lags its lines"
                );
                Outcome::Ahead
            }
            _ => Outcome::Consistent,
        };

        Ok(outcome)
    }
}

/// Runs the job every `interval` until the task is aborted.
pub fn spawn_periodic(
    service: ReconciliationService,
    interval: Duration,
    batch_size: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Periodic reconciliation enabled");

        loop {
            ticker.tick().await;
            let options = ReconcileOptions {
                batch_size,
                ..ReconcileOptions::default()
            };
            if let Err(e) = service.run(options).await {
                error!(error = %e, "Periodic reconciliation failed");
            }
        }
    })
}
