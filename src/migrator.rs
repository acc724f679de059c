use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_orders_table::Migration),
            Box::new(m20240301_000002_create_order_items_table::Migration),
            Box::new(m20240301_000003_create_order_item_instances_table::Migration),
            Box::new(m20240301_000004_create_order_exceptions_table::Migration),
        ]
    }
}

mod m20240301_000001_create_orders_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::OrderNumber).string().not_null())
                        .col(
                            ColumnDef::new(Orders::Status)
                                .string_len(32)
                                .not_null()
                                .default("pending"),
                        )
                        .col(ColumnDef::new(Orders::ClaimedBy).uuid().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_order_number")
                        .table(Orders::Table)
                        .col(Orders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // Reconciliation scans advanced statuses in creation order.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status_created_at")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        OrderNumber,
        Status,
        ClaimedBy,
        CreatedAt,
        UpdatedAt,
        CompletedAt,
    }
}

mod m20240301_000002_create_order_items_table {

    use super::m20240301_000001_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Barcode).string().not_null())
                        .col(ColumnDef::new(OrderItems::ProductName).string().not_null())
                        .col(
                            ColumnDef::new(OrderItems::SnTracked)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::PickedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OrderItems::PackedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id_barcode")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .col(OrderItems::Barcode)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum OrderItems {
        Table,
        Id,
        OrderId,
        Barcode,
        ProductName,
        SnTracked,
        Quantity,
        PickedQuantity,
        PackedQuantity,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000003_create_order_item_instances_table {

    use super::m20240301_000002_create_order_items_table::OrderItems;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_order_item_instances_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItemInstances::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItemInstances::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(OrderItemInstances::OrderItemId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItemInstances::SerialNumber)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItemInstances::Status)
                                .string_len(16)
                                .not_null()
                                .default("pending"),
                        )
                        .col(
                            ColumnDef::new(OrderItemInstances::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItemInstances::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_item_instances_order_item_id")
                                .from(OrderItemInstances::Table, OrderItemInstances::OrderItemId)
                                .to(OrderItems::Table, OrderItems::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_item_instances_order_item_id")
                        .table(OrderItemInstances::Table)
                        .col(OrderItemInstances::OrderItemId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItemInstances::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OrderItemInstances {
        Table,
        Id,
        OrderItemId,
        SerialNumber,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000004_create_order_exceptions_table {

    use super::m20240301_000001_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_order_exceptions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderExceptions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderExceptions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderExceptions::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderExceptions::ExceptionType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderExceptions::Status)
                                .string_len(16)
                                .not_null()
                                .default("open"),
                        )
                        .col(ColumnDef::new(OrderExceptions::Reason).text().not_null())
                        .col(ColumnDef::new(OrderExceptions::Snapshot).json_binary().null())
                        .col(
                            ColumnDef::new(OrderExceptions::ApplyReport)
                                .json_binary()
                                .null(),
                        )
                        .col(ColumnDef::new(OrderExceptions::CreatedBy).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderExceptions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderExceptions::AckBy).uuid().null())
                        .col(
                            ColumnDef::new(OrderExceptions::AckAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(OrderExceptions::AckNote).text().null())
                        .col(ColumnDef::new(OrderExceptions::ResolvedBy).uuid().null())
                        .col(
                            ColumnDef::new(OrderExceptions::ResolvedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderExceptions::ResolutionAction)
                                .string_len(32)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderExceptions::ResolutionNote)
                                .text()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderExceptions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_exceptions_order_id")
                                .from(OrderExceptions::Table, OrderExceptions::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_exceptions_order_id_status")
                        .table(OrderExceptions::Table)
                        .col(OrderExceptions::OrderId)
                        .col(OrderExceptions::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderExceptions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OrderExceptions {
        Table,
        Id,
        OrderId,
        ExceptionType,
        Status,
        Reason,
        Snapshot,
        ApplyReport,
        CreatedBy,
        CreatedAt,
        AckBy,
        AckAt,
        AckNote,
        ResolvedBy,
        ResolvedAt,
        ResolutionAction,
        ResolutionNote,
        UpdatedAt,
    }
}
