use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::auth::{Actor, Capability};
use crate::db::{self, DbPool};
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::order_item_instance::{self, Entity as InstanceEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender, ScanStage};
use crate::models::order::{InstanceStatus, OrderStatus};
use crate::models::proposal::{normalize_sn, normalize_sn_list, sn_key};
use crate::services::order_status::{derive_for_order, derive_status};

/// Request/Response types for the order service
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 64, message = "Order number must be 1-64 characters"))]
    pub order_number: String,
    #[validate(length(min = 1, message = "An order needs at least one line"))]
    pub items: Vec<CreateOrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderItem {
    #[validate(length(min = 1, message = "Barcode is required"))]
    pub barcode: String,
    #[validate(length(min = 1, message = "Product name is required"))]
    pub product_name: String,
    #[validate(range(min = 1, max = 100000, message = "Quantity must be between 1 and 100000"))]
    pub quantity: i32,
    /// Present for SN-tracked lines; one serial per unit.
    #[serde(default)]
    pub sn_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[validate(length(min = 1, message = "Barcode is required"))]
    pub barcode: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Units for quantity-tracked lines; defaults to 1.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDetail {
    #[serde(flatten)]
    pub line: order_item::Model,
    pub instances: Vec<order_item_instance::Model>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    pub order: order::Model,
    pub items: Vec<LineDetail>,
    /// Status the lines support, which may differ from the stored one.
    pub derived_status: OrderStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub line: order_item::Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// A normalized line of a create request.
#[derive(Debug)]
struct NewLine {
    barcode: String,
    product_name: String,
    quantity: i32,
    serials: Option<Vec<String>>,
}

/// Service for importing orders and recording pick/pack progress
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    /// Creates a new order service instance
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a new order with its lines and serials
    #[instrument(skip(self, request), fields(order_number = %request.order_number, actor_id = %actor.user_id))]
    pub async fn create_order(
        &self,
        actor: &Actor,
        request: CreateOrderRequest,
    ) -> Result<OrderDetail, ServiceError> {
        actor.require(Capability::ManageOrders)?;
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }

        let order_number = request.order_number.trim().to_string();
        if order_number.is_empty() {
            return Err(ServiceError::ValidationError("Order number is required".into()));
        }
        let lines = merge_lines(request.items)?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let existing = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number.as_str()))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Order number {} already exists",
                order_number
            )));
        }

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            status: Set(OrderStatus::Pending),
            claimed_by: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order in database");
            ServiceError::DatabaseError(e)
        })?;

        let line_count = lines.len();
        for line in lines {
            let item = order_item::ActiveModel {
                order_id: Set(order_id),
                barcode: Set(line.barcode),
                product_name: Set(line.product_name),
                sn_tracked: Set(line.serials.is_some()),
                quantity: Set(line.quantity),
                picked_quantity: Set(0),
                packed_quantity: Set(0),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            for serial_number in line.serials.unwrap_or_default() {
                order_item_instance::ActiveModel {
                    order_item_id: Set(item.id),
                    serial_number: Set(serial_number),
                    status: Set(InstanceStatus::Pending),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        let detail = load_detail(&txn, order_id).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        counter!("fulfillment.orders.created", 1);
        info!(order_id = %order_id, lines = line_count, "Order created successfully");
        self.publish(Event::OrderCreated {
            order_id,
            order_number,
            lines: line_count,
        })
        .await;

        Ok(detail)
    }

    /// Retrieves an order with its lines, serials and derived status
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetail, ServiceError> {
        load_detail(&*self.db_pool, order_id).await
    }

    /// Assigns the order to the calling operator
    #[instrument(skip(self), fields(order_id = %order_id, actor_id = %actor.user_id))]
    pub async fn claim_order(
        &self,
        order_id: Uuid,
        actor: &Actor,
    ) -> Result<order::Model, ServiceError> {
        actor.require(Capability::Scan)?;

        let txn = self.db_pool.begin().await?;
        let order = db::lock_order(&txn, order_id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is {} and cannot be claimed",
                order.order_number, order.status
            )));
        }
        match order.claimed_by {
            Some(owner) if owner == actor.user_id => {
                return Ok(order);
            }
            Some(owner) => {
                return Err(ServiceError::Conflict(format!(
                    "Order {} is already claimed by {}",
                    order.order_number, owner
                )));
            }
            None => {}
        }

        let mut active = order.into_active_model();
        active.claimed_by = Set(Some(actor.user_id));
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!("Order claimed");
        self.publish(Event::OrderClaimed {
            order_id,
            actor_id: actor.user_id,
        })
        .await;
        Ok(updated)
    }

    /// Voids an order. Completed orders stay completed; voiding twice is a no-op.
    #[instrument(skip(self), fields(order_id = %order_id, actor_id = %actor.user_id))]
    pub async fn void_order(
        &self,
        order_id: Uuid,
        actor: &Actor,
    ) -> Result<order::Model, ServiceError> {
        actor.require(Capability::ManageOrders)?;

        let txn = self.db_pool.begin().await?;
        let order = db::lock_order(&txn, order_id).await?;
        let previous_status = order.status;
        match previous_status {
            OrderStatus::Voided => return Ok(order),
            OrderStatus::Completed => {
                return Err(ServiceError::Conflict(format!(
                    "Order {} is completed and cannot be voided",
                    order.order_number
                )))
            }
            _ => {}
        }

        let mut active = order.into_active_model();
        active.status = Set(OrderStatus::Voided);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        counter!("fulfillment.orders.voided", 1);
        info!(previous_status = %previous_status, "Order voided");
        self.publish(Event::OrderVoided {
            order_id,
            actor_id: actor.user_id,
            previous_status,
        })
        .await;
        Ok(updated)
    }

    /// Records a pick scan
    #[instrument(skip(self, request), fields(order_id = %order_id, barcode = %request.barcode))]
    pub async fn record_pick(
        &self,
        order_id: Uuid,
        actor: &Actor,
        request: ScanRequest,
    ) -> Result<ScanResult, ServiceError> {
        self.record_scan(order_id, actor, request, ScanStage::Pick).await
    }

    /// Records a pack scan
    #[instrument(skip(self, request), fields(order_id = %order_id, barcode = %request.barcode))]
    pub async fn record_pack(
        &self,
        order_id: Uuid,
        actor: &Actor,
        request: ScanRequest,
    ) -> Result<ScanResult, ServiceError> {
        self.record_scan(order_id, actor, request, ScanStage::Pack).await
    }

    async fn record_scan(
        &self,
        order_id: Uuid,
        actor: &Actor,
        request: ScanRequest,
        stage: ScanStage,
    ) -> Result<ScanResult, ServiceError> {
        actor.require(Capability::Scan)?;
        request.validate()?;

        let txn = self.db_pool.begin().await?;
        let order = db::lock_order(&txn, order_id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is {}; scans are closed",
                order.order_number, order.status
            )));
        }

        let barcode = request.barcode.trim();
        let rows = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::Barcode.eq(barcode))
            .order_by_asc(order_item::Column::Id)
            .lock_exclusive()
            .all(&txn)
            .await?;
        if rows.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "No line with barcode {} on order {}",
                barcode, order.order_number
            )));
        }

        let (line, serial_number) = if rows.iter().any(|r| r.sn_tracked) {
            let serial = request
                .serial_number
                .as_deref()
                .and_then(normalize_sn)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Barcode {} is SN-tracked; a serial number is required",
                        barcode
                    ))
                })?;
            let line = scan_serial(&txn, &rows, &serial, stage).await?;
            (line, Some(serial))
        } else {
            let units = request.quantity.unwrap_or(1);
            (scan_quantity(&txn, rows, units, stage).await?, None)
        };

        let derived = derive_for_order(&txn, order_id).await?;
        let now = Utc::now();
        let mut active = order.into_active_model();
        active.status = Set(derived);
        if derived == OrderStatus::Completed {
            active.completed_at = Set(Some(now));
        }
        active.updated_at = Set(now);
        active.update(&txn).await?;
        txn.commit().await?;

        counter!("fulfillment.scans", 1, "stage" => stage.to_string());
        info!(stage = %stage, status = %derived, "Scan recorded");
        self.publish(Event::ItemScanned {
            order_id,
            actor_id: actor.user_id,
            stage,
            barcode: line.barcode.clone(),
            serial_number: serial_number.clone(),
            status: derived,
        })
        .await;

        Ok(ScanResult {
            order_id,
            status: derived,
            line,
            serial_number,
        })
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}

/// Merges request lines by barcode, normalizes serials and checks that every
/// serial is unique within the order.
fn merge_lines(items: Vec<CreateOrderItem>) -> Result<Vec<NewLine>, ServiceError> {
    let mut lines: Vec<NewLine> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut seen_serials = HashSet::new();

    for item in items {
        let barcode = item.barcode.trim().to_string();
        let product_name = item.product_name.trim().to_string();
        if barcode.is_empty() || product_name.is_empty() {
            return Err(ServiceError::ValidationError(
                "Barcode and product name are required".into(),
            ));
        }

        let serials = match item.sn_list {
            Some(list) => {
                let serials = normalize_sn_list(&list);
                if serials.len() != item.quantity as usize {
                    return Err(ServiceError::ValidationError(format!(
                        "Line {} has {} serial numbers for quantity {}",
                        barcode,
                        serials.len(),
                        item.quantity
                    )));
                }
                if let Some(dup) = serials.iter().find(|sn| !seen_serials.insert(sn_key(sn))) {
                    return Err(ServiceError::ValidationError(format!(
                        "Serial number {} appears more than once",
                        dup
                    )));
                }
                Some(serials)
            }
            None => None,
        };

        match index.get(&barcode) {
            Some(&at) => {
                let line = &mut lines[at];
                match (&mut line.serials, serials) {
                    (Some(existing), Some(more)) => existing.extend(more),
                    (None, None) => {}
                    _ => {
                        return Err(ServiceError::ValidationError(format!(
                            "Barcode {} mixes SN-tracked and quantity-tracked lines",
                            barcode
                        )))
                    }
                }
                line.quantity = line.quantity.checked_add(item.quantity).ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Line {} quantity is out of range",
                        line.barcode
                    ))
                })?;
            }
            None => {
                index.insert(barcode.clone(), lines.len());
                lines.push(NewLine {
                    barcode,
                    product_name,
                    quantity: item.quantity,
                    serials,
                });
            }
        }
    }

    Ok(lines)
}

async fn load_detail<C>(conn: &C, order_id: Uuid) -> Result<OrderDetail, ServiceError>
where
    C: ConnectionTrait,
{
    let order = OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?;
    let instances = InstanceEntity::find()
        .inner_join(OrderItemEntity)
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item_instance::Column::Id)
        .all(conn)
        .await?;

    let derived_status = derive_status(&items, &instances);
    let mut by_item: HashMap<i32, Vec<order_item_instance::Model>> = HashMap::new();
    for instance in instances {
        by_item.entry(instance.order_item_id).or_default().push(instance);
    }

    let items = items
        .into_iter()
        .map(|line| LineDetail {
            instances: by_item.remove(&line.id).unwrap_or_default(),
            line,
        })
        .collect();

    Ok(OrderDetail {
        order,
        items,
        derived_status,
    })
}

/// Advances one serial instance and refreshes its row's counters.
async fn scan_serial(
    txn: &DatabaseTransaction,
    rows: &[order_item::Model],
    serial: &str,
    stage: ScanStage,
) -> Result<order_item::Model, ServiceError> {
    let instances = InstanceEntity::find()
        .filter(order_item_instance::Column::OrderItemId.is_in(rows.iter().map(|r| r.id)))
        .order_by_asc(order_item_instance::Column::Id)
        .lock_exclusive()
        .all(txn)
        .await?;

    let key = sn_key(serial);
    let instance = instances
        .iter()
        .find(|i| sn_key(&i.serial_number) == key)
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Serial number {} is not on this line", serial))
        })?;

    let next = match (stage, instance.status) {
        (ScanStage::Pick, InstanceStatus::Pending) => InstanceStatus::Picked,
        (ScanStage::Pack, InstanceStatus::Picked) => InstanceStatus::Packed,
        (ScanStage::Pack, InstanceStatus::Pending) => {
            return Err(ServiceError::Conflict(format!(
                "Serial number {} has not been picked",
                serial
            )))
        }
        (_, current) => {
            return Err(ServiceError::Conflict(format!(
                "Serial number {} is already {}",
                serial, current
            )))
        }
    };

    let item_id = instance.order_item_id;
    let mut active = instance.clone().into_active_model();
    active.status = Set(next);
    active.update(txn).await?;

    let row = rows
        .iter()
        .find(|r| r.id == item_id)
        .ok_or_else(|| ServiceError::InternalError(format!("Line {} vanished", item_id)))?;
    let statuses: Vec<InstanceStatus> = instances
        .iter()
        .filter(|i| i.order_item_id == item_id)
        .map(|i| if i.id == instance.id { next } else { i.status })
        .collect();

    let mut active = row.clone().into_active_model();
    active.picked_quantity = Set(statuses.iter().filter(|s| s.is_picked()).count() as i32);
    active.packed_quantity = Set(statuses.iter().filter(|s| s.is_packed()).count() as i32);
    Ok(active.update(txn).await?)
}

/// Spreads `units` over the barcode's rows in id order. Fails without writing
/// when the rows lack room.
async fn scan_quantity(
    txn: &DatabaseTransaction,
    rows: Vec<order_item::Model>,
    units: i32,
    stage: ScanStage,
) -> Result<order_item::Model, ServiceError> {
    let room = |row: &order_item::Model| match stage {
        ScanStage::Pick => row.quantity - row.picked_quantity,
        ScanStage::Pack => row.picked_quantity - row.packed_quantity,
    };

    let available: i32 = rows.iter().map(|r| room(r).max(0)).sum();
    if available < units {
        return Err(ServiceError::Conflict(format!(
            "Cannot {} {} units of {}: only {} remaining",
            stage, units, rows[0].barcode, available
        )));
    }

    let mut left = units;
    let mut last = None;
    for row in rows {
        if left == 0 {
            break;
        }
        let take = room(&row).clamp(0, left);
        if take == 0 {
            continue;
        }
        left -= take;

        let mut active = row.clone().into_active_model();
        match stage {
            ScanStage::Pick => active.picked_quantity = Set(row.picked_quantity + take),
            ScanStage::Pack => active.packed_quantity = Set(row.packed_quantity + take),
        }
        last = Some(active.update(txn).await?);
    }

    last.ok_or_else(|| ServiceError::InternalError("Scan touched no rows".into()))
}
