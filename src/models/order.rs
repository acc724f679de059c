use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Enum representing the possible statuses of an order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "picking")]
    Picking,
    #[sea_orm(string_value = "picked")]
    Picked,
    #[sea_orm(string_value = "packing")]
    Packing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "voided")]
    Voided,
}

impl OrderStatus {
    /// Statuses the reconciliation job inspects for drift.
    pub const ADVANCED: [OrderStatus; 3] =
        [OrderStatus::Picked, OrderStatus::Packing, OrderStatus::Completed];

    /// Position on the fulfillment path: pending < picking < picked < packing < completed.
    /// `Voided` sits outside the path and has no rank.
    pub fn rank(self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Picking => Some(1),
            OrderStatus::Picked => Some(2),
            OrderStatus::Packing => Some(3),
            OrderStatus::Completed => Some(4),
            OrderStatus::Voided => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Voided)
    }
}

/// Progress of one physical unit of an SN-tracked line.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "picked")]
    Picked,
    #[sea_orm(string_value = "packed")]
    Packed,
}

impl InstanceStatus {
    /// Picked and packed units both count as picked.
    pub fn is_picked(self) -> bool {
        matches!(self, InstanceStatus::Picked | InstanceStatus::Packed)
    }

    pub fn is_packed(self) -> bool {
        self == InstanceStatus::Packed
    }
}
