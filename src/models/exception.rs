use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Kind of deviation recorded against an order. Adding a kind is a
/// compile-checked change: every match over this enum is exhaustive.
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
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionType {
    #[sea_orm(string_value = "stockout")]
    Stockout,
    #[sea_orm(string_value = "damage")]
    Damage,
    #[sea_orm(string_value = "over_scan")]
    OverScan,
    #[sea_orm(string_value = "under_scan")]
    UnderScan,
    #[sea_orm(string_value = "sn_replace")]
    SnReplace,
    #[sea_orm(string_value = "order_change")]
    OrderChange,
    #[sea_orm(string_value = "other")]
    Other,
}

impl ExceptionType {
    /// Whether acknowledging this exception mutates the order's items.
    pub fn carries_proposal(self) -> bool {
        match self {
            ExceptionType::OrderChange => true,
            ExceptionType::Stockout
            | ExceptionType::Damage
            | ExceptionType::OverScan
            | ExceptionType::UnderScan
            | ExceptionType::SnReplace
            | ExceptionType::Other => false,
        }
    }
}

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
pub enum ExceptionStatus {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "ack")]
    Ack,
    #[sea_orm(string_value = "resolved")]
    Resolved,
}

/// How an acknowledged exception was finally closed out.
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
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionAction {
    #[sea_orm(string_value = "short_ship")]
    ShortShip,
    #[sea_orm(string_value = "restock")]
    Restock,
    #[sea_orm(string_value = "exchange")]
    Exchange,
    #[sea_orm(string_value = "void")]
    Void,
    #[sea_orm(string_value = "other")]
    Other,
}
