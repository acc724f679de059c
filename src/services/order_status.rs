//! Canonical order status, computed from line items and serial instances.

use std::collections::HashMap;

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::entities::{order_item, order_item_instance};
use crate::errors::ServiceError;
use crate::models::order::OrderStatus;

/// Pick/pack progress of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineProgress {
    pub picked_complete: bool,
    pub packed_complete: bool,
    pub picking_started: bool,
    pub packing_started: bool,
}

impl LineProgress {
    /// SN lines are judged by their instances alone; the line quantity is
    /// not consulted.
    pub fn for_line(item: &order_item::Model, instances: &[&order_item_instance::Model]) -> Self {
        if item.sn_tracked {
            let picked = instances.iter().filter(|i| i.status.is_picked()).count();
            let packed = instances.iter().filter(|i| i.status.is_packed()).count();
            Self {
                picked_complete: picked == instances.len(),
                packed_complete: packed == instances.len(),
                picking_started: picked > 0,
                packing_started: packed > 0,
            }
        } else {
            let picked_complete = item.picked_quantity >= item.quantity;
            Self {
                picked_complete,
                packed_complete: picked_complete && item.packed_quantity >= item.quantity,
                picking_started: item.picked_quantity > 0 || item.packed_quantity > 0,
                packing_started: item.packed_quantity > 0,
            }
        }
    }
}

/// Derives the status an order should have given its lines.
///
/// The furthest stage with any evidence wins: a single packed unit makes the
/// order `packing` even while other lines are still being picked. Never
/// returns `Voided`. An order without lines is `Pending`.
pub fn derive_status(
    items: &[order_item::Model],
    instances: &[order_item_instance::Model],
) -> OrderStatus {
    if items.is_empty() {
        return OrderStatus::Pending;
    }

    let mut by_item: HashMap<i32, Vec<&order_item_instance::Model>> = HashMap::new();
    for instance in instances {
        by_item.entry(instance.order_item_id).or_default().push(instance);
    }

    let mut all_picked = true;
    let mut all_packed = true;
    let mut any_picking = false;
    let mut any_packing = false;

    for item in items {
        let line_instances = by_item.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
        let progress = LineProgress::for_line(item, line_instances);
        all_picked &= progress.picked_complete;
        all_packed &= progress.packed_complete;
        any_picking |= progress.picking_started;
        any_packing |= progress.packing_started;
    }

    if all_picked && all_packed {
        OrderStatus::Completed
    } else if any_packing {
        OrderStatus::Packing
    } else if all_picked {
        OrderStatus::Picked
    } else if any_picking {
        OrderStatus::Picking
    } else {
        OrderStatus::Pending
    }
}

/// Loads an order's lines and serials and derives its status.
pub async fn derive_for_order<C>(conn: &C, order_id: Uuid) -> Result<OrderStatus, ServiceError>
where
    C: ConnectionTrait,
{
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?;
    let instances = order_item_instance::Entity::find()
        .inner_join(order_item::Entity)
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?;
    Ok(derive_status(&items, &instances))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::entities::{order_item, order_item_instance};
    use crate::models::order::InstanceStatus;

    pub fn qty_line(id: i32, quantity: i32, picked: i32, packed: i32) -> order_item::Model {
        order_item::Model {
            id,
            order_id: Uuid::nil(),
            barcode: format!("BC-{id}"),
            product_name: format!("Product {id}"),
            sn_tracked: false,
            quantity,
            picked_quantity: picked,
            packed_quantity: packed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn sn_line(id: i32, quantity: i32) -> order_item::Model {
        order_item::Model {
            sn_tracked: true,
            ..qty_line(id, quantity, 0, 0)
        }
    }

    pub fn unit(id: i32, item_id: i32, status: InstanceStatus) -> order_item_instance::Model {
        order_item_instance::Model {
            id,
            order_item_id: item_id,
            serial_number: format!("SN{id:04}"),
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
