//! Applies validated order-change proposals to an order's lines and serials.
//!
//! Everything happens inside one transaction that first takes the exclusive
//! lock on the order row. A failed item aborts the whole proposal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::order_item_instance::{self, Entity as InstanceEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::order::{InstanceStatus, OrderStatus};
use crate::models::proposal::{sn_key, ItemChange, Proposal, SerialChange, Tracking};

/// Where the removed serials of an SN reduction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemovalSource {
    Auto,
    Specified,
}

/// Before/after figures for one item change. Quantities are summed over all
/// rows sharing the barcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemChangeReport {
    pub barcode: String,
    pub product_name: String,
    pub sn_tracked: bool,
    pub quantity_change: i32,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub picked_before: i32,
    pub picked_after: i32,
    pub packed_before: i32,
    pub packed_after: i32,
    pub added_sns: Vec<String>,
    pub removed_sns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal_source: Option<RemovalSource>,
    pub rows_deleted: u32,
}

impl ItemChangeReport {
    fn new(change: &ItemChange, before: LineTotals) -> Self {
        Self {
            barcode: change.barcode.clone(),
            product_name: change.product_name.clone(),
            sn_tracked: change.is_sn_tracked(),
            quantity_change: change.quantity_change,
            quantity_before: before.quantity,
            quantity_after: before.quantity,
            picked_before: before.picked,
            picked_after: before.picked,
            packed_before: before.packed,
            packed_after: before.packed,
            added_sns: change.added_sns().to_vec(),
            removed_sns: Vec::new(),
            removal_source: None,
            rows_deleted: 0,
        }
    }

    fn record_after(&mut self, after: LineTotals) {
        self.quantity_after = after.quantity;
        self.picked_after = after.picked;
        self.packed_after = after.packed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub order_id: Uuid,
    pub previous_status: OrderStatus,
    pub new_status: OrderStatus,
    pub applied_by: Uuid,
    pub applied_at: DateTime<Utc>,
    pub items: Vec<ItemChangeReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct LineTotals {
    quantity: i32,
    picked: i32,
    packed: i32,
}

/// All rows of one barcode on one order, with their serial instances.
struct BarcodeLines {
    rows: Vec<order_item::Model>,
    instances: Vec<order_item_instance::Model>,
}

impl BarcodeLines {
    async fn load<C>(conn: &C, order_id: Uuid, barcode: &str) -> Result<Self, ServiceError>
    where
        C: ConnectionTrait,
    {
        let rows = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::Barcode.eq(barcode))
            .order_by_asc(order_item::Column::Id)
            .lock_exclusive()
            .all(conn)
            .await?;

        let instances = if rows.is_empty() {
            Vec::new()
        } else {
            InstanceEntity::find()
                .filter(order_item_instance::Column::OrderItemId.is_in(rows.iter().map(|r| r.id)))
                .order_by_asc(order_item_instance::Column::Id)
                .lock_exclusive()
                .all(conn)
                .await?
        };

        Ok(Self { rows, instances })
    }

    fn primary(&self) -> Option<&order_item::Model> {
        self.rows.first()
    }

    fn totals(&self) -> LineTotals {
        let quantity = self.rows.iter().map(|r| r.quantity).sum();
        if self.rows.iter().any(|r| r.sn_tracked) {
            LineTotals {
                quantity,
                picked: self.instances.iter().filter(|i| i.status.is_picked()).count() as i32,
                packed: self.instances.iter().filter(|i| i.status.is_packed()).count() as i32,
            }
        } else {
            LineTotals {
                quantity,
                picked: self.rows.iter().map(|r| r.picked_quantity).sum(),
                packed: self.rows.iter().map(|r| r.packed_quantity).sum(),
            }
        }
    }

    fn check_tracking_mode(&self, change: &ItemChange) -> Result<(), ServiceError> {
        match self.rows.iter().find(|r| r.sn_tracked != change.is_sn_tracked()) {
            Some(row) => Err(ServiceError::InvariantViolation(format!(
                "line {} for barcode {} is {}; tracking mode cannot change",
                row.id,
                change.barcode,
                if row.sn_tracked {
                    "SN-tracked"
                } else {
                    "quantity-tracked"
                }
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct OrderChangeService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderChangeService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Applies a proposal in its own transaction.
    #[instrument(skip(self, proposal), fields(order_id = %order_id, actor_id = %actor_id, items = proposal.items().len()))]
    pub async fn apply(
        &self,
        order_id: Uuid,
        proposal: &Proposal,
        actor_id: Uuid,
    ) -> Result<ApplyReport, ServiceError> {
        let start = Instant::now();
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin order change transaction");
            ServiceError::DatabaseError(e)
        })?;

        let report = match Self::apply_in_txn(&txn, order_id, proposal, actor_id).await {
            Ok(report) => report,
            Err(e) => {
                counter!("fulfillment.order_change.rejected", 1, "kind" => e.kind());
                warn!(error = %e, "Order change rejected");
                return Err(e);
            }
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit order change");
            ServiceError::DatabaseError(e)
        })?;

        counter!("fulfillment.order_change.applied", 1);
        histogram!("fulfillment.order_change.duration", start.elapsed());
        info!(items = report.items.len(), "Order change applied");

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::OrderChangeApplied {
                    order_id,
                    exception_id: None,
                    actor_id,
                    previous_status: report.previous_status,
                    items: report.items.len(),
                    at: report.applied_at,
                })
                .await;
        }

        Ok(report)
    }

    /// Applies a proposal inside a transaction owned by the caller. The order
    /// row is locked before anything is read.
    pub async fn apply_in_txn<C>(
        conn: &C,
        order_id: Uuid,
        proposal: &Proposal,
        actor_id: Uuid,
    ) -> Result<ApplyReport, ServiceError>
    where
        C: ConnectionTrait,
    {
        let order = db::lock_order(conn, order_id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "order {} is {}; changes cannot be applied",
                order.order_number, order.status
            )));
        }

        check_duplicate_serials(conn, order_id, proposal).await?;

        let mut items = Vec::with_capacity(proposal.items().len());
        for change in proposal.items() {
            items.push(apply_item(conn, order_id, change).await?);
        }

        let previous_status = order.status;
        let applied_at = Utc::now();
        let mut active = order.into_active_model();
        active.status = Set(OrderStatus::Picking);
        active.completed_at = Set(None);
        active.updated_at = Set(applied_at);
        active.update(conn).await?;

        Ok(ApplyReport {
            order_id,
            previous_status,
            new_status: OrderStatus::Picking,
            applied_by: actor_id,
            applied_at,
            items,
        })
    }
}

/// Rejects serials that already exist on the order or appear twice in the
/// proposal. Comparison ignores case.
async fn check_duplicate_serials<C>(
    conn: &C,
    order_id: Uuid,
    proposal: &Proposal,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let additions: Vec<&String> = proposal
        .items()
        .iter()
        .flat_map(|item| item.added_sns())
        .collect();
    if additions.is_empty() {
        return Ok(());
    }

    let existing: HashSet<String> = InstanceEntity::find()
        .inner_join(OrderItemEntity)
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?
        .iter()
        .map(|instance| sn_key(&instance.serial_number))
        .collect();

    let mut seen = HashSet::new();
    let duplicates: Vec<&str> = additions
        .into_iter()
        .filter(|sn| {
            let key = sn_key(sn);
            existing.contains(&key) || !seen.insert(key)
        })
        .map(String::as_str)
        .collect();

    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::Conflict(format!(
            "duplicate serial numbers for this order: {}",
            duplicates.join(", ")
        )))
    }
}

async fn apply_item<C>(
    conn: &C,
    order_id: Uuid,
    change: &ItemChange,
) -> Result<ItemChangeReport, ServiceError>
where
    C: ConnectionTrait,
{
    let lines = BarcodeLines::load(conn, order_id, &change.barcode).await?;
    lines.check_tracking_mode(change)?;

    let mut report = ItemChangeReport::new(change, lines.totals());
    match &change.tracking {
        Tracking::Serial(SerialChange::Add(sns)) => {
            add_serials(conn, order_id, change, &lines, sns).await?;
        }
        Tracking::Serial(SerialChange::Remove(requested)) => {
            let removal = remove_serials(conn, change, &lines, requested.as_deref()).await?;
            report.removed_sns = removal.serials;
            report.removal_source = Some(removal.source);
            report.rows_deleted = removal.rows_deleted;
        }
        Tracking::Quantity => {
            report.rows_deleted = adjust_quantity(conn, order_id, change, &lines).await?;
        }
    }

    let after = BarcodeLines::load(conn, order_id, &change.barcode).await?;
    report.record_after(after.totals());
    debug!(
        barcode = %change.barcode,
        quantity_before = report.quantity_before,
        quantity_after = report.quantity_after,
        "Item change applied"
    );
    Ok(report)
}

async fn insert_line<C>(
    conn: &C,
    order_id: Uuid,
    change: &ItemChange,
) -> Result<order_item::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let line = order_item::ActiveModel {
        order_id: Set(order_id),
        barcode: Set(change.barcode.clone()),
        product_name: Set(change.product_name.clone()),
        sn_tracked: Set(change.is_sn_tracked()),
        quantity: Set(change.quantity_change),
        picked_quantity: Set(0),
        packed_quantity: Set(0),
        ..Default::default()
    };
    Ok(line.insert(conn).await?)
}

async fn insert_instance<C>(
    conn: &C,
    order_item_id: i32,
    serial_number: &str,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    order_item_instance::ActiveModel {
        order_item_id: Set(order_item_id),
        serial_number: Set(serial_number.to_string()),
        status: Set(InstanceStatus::Pending),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    Ok(())
}

async fn add_serials<C>(
    conn: &C,
    order_id: Uuid,
    change: &ItemChange,
    lines: &BarcodeLines,
    sns: &[String],
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let item_id = match lines.primary() {
        Some(primary) => {
            let mut active = primary.clone().into_active_model();
            active.quantity = Set(line_total(primary.quantity, change)?);
            active.update(conn).await?;
            primary.id
        }
        None => insert_line(conn, order_id, change).await?.id,
    };

    for sn in sns {
        insert_instance(conn, item_id, sn).await?;
    }
    Ok(())
}

struct Removal {
    serials: Vec<String>,
    source: RemovalSource,
    rows_deleted: u32,
}

async fn remove_serials<C>(
    conn: &C,
    change: &ItemChange,
    lines: &BarcodeLines,
    requested: Option<&[String]>,
) -> Result<Removal, ServiceError>
where
    C: ConnectionTrait,
{
    if lines.rows.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "no line with barcode {} on this order",
            change.barcode
        )));
    }

    let totals = lines.totals();
    let target = line_total(totals.quantity, change)?;
    if target < 0 {
        return Err(ServiceError::Conflict(format!(
            "cannot remove {} units of {}: the order only has {}",
            change.quantity_change.unsigned_abs(),
            change.barcode,
            totals.quantity
        )));
    }
    let count = totals.quantity - target;
    if target < totals.picked {
        return Err(ServiceError::Conflict(format!(
            "target quantity {} for {} is below already picked/packed count {}",
            target, change.barcode, totals.picked
        )));
    }

    let (chosen, source) = match requested {
        Some(sns) => (select_specified(&lines.instances, sns)?, RemovalSource::Specified),
        None => (
            select_auto(&lines.instances, count as usize, &change.barcode)?,
            RemovalSource::Auto,
        ),
    };

    let removed_ids: HashSet<i32> = chosen.iter().map(|i| i.id).collect();
    InstanceEntity::delete_many()
        .filter(order_item_instance::Column::Id.is_in(removed_ids.iter().copied()))
        .exec(conn)
        .await?;

    let remaining: Vec<&order_item_instance::Model> = lines
        .instances
        .iter()
        .filter(|i| !removed_ids.contains(&i.id))
        .collect();
    let held: Vec<i32> = lines
        .rows
        .iter()
        .map(|row| remaining.iter().filter(|i| i.order_item_id == row.id).count() as i32)
        .collect();
    let progressed: Vec<i32> = lines
        .rows
        .iter()
        .map(|row| {
            remaining
                .iter()
                .filter(|i| i.order_item_id == row.id && i.status.is_picked())
                .count() as i32
        })
        .collect();

    let quantities = plan_reduction(&lines.rows, &held, &progressed, count).ok_or_else(|| {
        ServiceError::Conflict(format!(
            "cannot reduce {} by {} without dropping picked units",
            change.barcode, count
        ))
    })?;

    let mut rows_deleted = 0;
    for (row, quantity) in lines.rows.iter().zip(quantities) {
        let row_units: Vec<&&order_item_instance::Model> = remaining
            .iter()
            .filter(|i| i.order_item_id == row.id)
            .collect();
        if quantity == 0 && row_units.is_empty() {
            OrderItemEntity::delete_by_id(row.id).exec(conn).await?;
            rows_deleted += 1;
            continue;
        }

        let picked = row_units.iter().filter(|i| i.status.is_picked()).count() as i32;
        let packed = row_units.iter().filter(|i| i.status.is_packed()).count() as i32;
        if quantity != row.quantity
            || picked != row.picked_quantity
            || packed != row.packed_quantity
        {
            let mut active = row.clone().into_active_model();
            active.quantity = Set(quantity);
            active.picked_quantity = Set(picked);
            active.packed_quantity = Set(packed);
            active.update(conn).await?;
        }
    }

    Ok(Removal {
        serials: chosen.into_iter().map(|i| i.serial_number.clone()).collect(),
        source,
        rows_deleted,
    })
}

/// Resolves caller-named serials. Every one must exist on the line and still
/// be pending.
fn select_specified<'a>(
    instances: &'a [order_item_instance::Model],
    sns: &[String],
) -> Result<Vec<&'a order_item_instance::Model>, ServiceError> {
    let mut chosen = Vec::with_capacity(sns.len());
    let mut offending = Vec::new();
    for sn in sns {
        let key = sn_key(sn);
        match instances.iter().find(|i| sn_key(&i.serial_number) == key) {
            Some(instance) if instance.status == InstanceStatus::Pending => chosen.push(instance),
            _ => offending.push(sn.as_str()),
        }
    }

    if offending.is_empty() {
        Ok(chosen)
    } else {
        Err(ServiceError::Conflict(format!(
            "serial numbers missing or no longer pending: {}",
            offending.join(", ")
        )))
    }
}

/// Picks the oldest pending serials.
fn select_auto<'a>(
    instances: &'a [order_item_instance::Model],
    count: usize,
    barcode: &str,
) -> Result<Vec<&'a order_item_instance::Model>, ServiceError> {
    let pending: Vec<&order_item_instance::Model> = instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Pending)
        .take(count)
        .collect();
    if pending.len() < count {
        return Err(ServiceError::Conflict(format!(
            "insufficient pending SNs for {}: need {}, found {}",
            barcode,
            count,
            pending.len()
        )));
    }
    Ok(pending)
}

/// New per-row quantities after taking `reduction` units off, highest id
/// first. The first pass keeps every row at or above the serials it still
/// holds; the second only above its picked/packed serials. `None` when the
/// reduction cannot be placed.
fn plan_reduction(
    rows: &[order_item::Model],
    held: &[i32],
    progressed: &[i32],
    reduction: i32,
) -> Option<Vec<i32>> {
    let mut quantities: Vec<i32> = rows.iter().map(|r| r.quantity).collect();
    let mut left = reduction;

    for floors in [held, progressed] {
        for (quantity, floor) in quantities.iter_mut().zip(floors).rev() {
            if left == 0 {
                break;
            }
            let take = (*quantity - *floor).clamp(0, left);
            *quantity -= take;
            left -= take;
        }
    }

    (left == 0).then_some(quantities)
}

/// Line quantity after applying the change's delta.
fn line_total(quantity: i32, change: &ItemChange) -> Result<i32, ServiceError> {
    quantity.checked_add(change.quantity_change).ok_or_else(|| {
        ServiceError::ValidationError(format!(
            "quantity change {} for {} is out of range",
            change.quantity_change, change.barcode
        ))
    })
}

/// Rolls pick/pack progress back to fit a smaller quantity.
pub fn clamp_progress(quantity: i32, picked: i32, packed: i32) -> (i32, i32) {
    let packed = packed.min(quantity);
    let picked = picked.min(quantity);
    (picked, packed.min(picked))
}

/// Quantity-tracked change: collapse the barcode onto its primary row, then
/// set the new total. Returns the number of rows deleted.
async fn adjust_quantity<C>(
    conn: &C,
    order_id: Uuid,
    change: &ItemChange,
    lines: &BarcodeLines,
) -> Result<u32, ServiceError>
where
    C: ConnectionTrait,
{
    let Some(primary) = lines.primary() else {
        if change.quantity_change < 0 {
            return Err(ServiceError::NotFound(format!(
                "no line with barcode {} on this order",
                change.barcode
            )));
        }
        insert_line(conn, order_id, change).await?;
        return Ok(0);
    };

    let totals = lines.totals();
    let new_total = line_total(totals.quantity, change)?;
    if new_total < 0 {
        return Err(ServiceError::Conflict(format!(
            "cannot remove {} units of {}: the order only has {}",
            change.quantity_change.unsigned_abs(),
            change.barcode,
            totals.quantity
        )));
    }

    let mut rows_deleted = 0;
    let duplicates: Vec<i32> = lines.rows.iter().skip(1).map(|r| r.id).collect();
    if !duplicates.is_empty() {
        let result = OrderItemEntity::delete_many()
            .filter(order_item::Column::Id.is_in(duplicates))
            .exec(conn)
            .await?;
        rows_deleted += result.rows_affected as u32;
    }

    if new_total == 0 {
        OrderItemEntity::delete_by_id(primary.id).exec(conn).await?;
        return Ok(rows_deleted + 1);
    }

    let (picked, packed) = clamp_progress(new_total, totals.picked, totals.packed);
    let mut active = primary.clone().into_active_model();
    active.quantity = Set(new_total);
    active.picked_quantity = Set(picked);
    active.packed_quantity = Set(packed);
    active.update(conn).await?;

    Ok(rows_deleted)
}
