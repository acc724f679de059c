use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::exception::{ExceptionStatus, ExceptionType, ResolutionAction};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_exceptions")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub exception_type: ExceptionType,
    pub status: ExceptionStatus,
    pub reason: String,
    /// Serialized proposal for `order_change` exceptions.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub snapshot: Option<Json>,
    /// Apply report written when an order change is acknowledged.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub apply_report: Option<Json>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub ack_by: Option<Uuid>,
    pub ack_at: Option<DateTime<Utc>>,
    pub ack_note: Option<String>,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_action: Option<ResolutionAction>,
    pub resolution_note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id",
        on_delete = "Cascade"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
