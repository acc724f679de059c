#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use fulfillment_engine::{
    auth::{Actor, Role, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER},
    config::AppConfig,
    db::{self, DbPool},
    entities::{order, order_item, order_item_instance},
    events,
    models::order::{InstanceStatus, OrderStatus},
    models::proposal::{Proposal, ProposalLimits, RawProposal},
    services::orders::{CreateOrderItem, CreateOrderRequest, OrderDetail, ScanRequest},
    AppState,
};

/// Application state backed by a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub admin: Actor,
    _event_task: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("fulfillment_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps SQLite writers serialized.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_sender, event_rx) = events::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), cfg, Some(Arc::new(event_sender)));
        let router = fulfillment_engine::build_router(state.clone());

        Self {
            router,
            state,
            admin: Actor::new(Uuid::new_v4(), Role::Admin),
            _event_task: event_task,
            _dir: dir,
        }
    }

    pub fn db(&self) -> Arc<DbPool> {
        self.state.db.clone()
    }

    /// Send a request, optionally identifying the caller with actor headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        actor: Option<&Actor>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(actor) = actor {
            builder = builder
                .header(ACTOR_ID_HEADER, actor.user_id.to_string())
                .header(ACTOR_ROLE_HEADER, actor.role.to_string());
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Creates an order. Each line is `(barcode, quantity, serials)`.
    pub async fn seed_order(&self, lines: &[(&str, i32, Option<&[&str]>)]) -> OrderDetail {
        let items = lines
            .iter()
            .map(|(barcode, quantity, serials)| CreateOrderItem {
                barcode: barcode.to_string(),
                product_name: format!("Product {}", barcode),
                quantity: *quantity,
                sn_list: serials.map(|s| s.iter().map(|v| v.to_string()).collect()),
            })
            .collect();

        self.state
            .services
            .orders
            .create_order(
                &self.admin,
                CreateOrderRequest {
                    order_number: format!("SO-{}", Uuid::new_v4().simple()),
                    items,
                },
            )
            .await
            .expect("seed order")
    }

    pub async fn pick_serial(&self, order_id: Uuid, barcode: &str, serial: &str) {
        self.state
            .services
            .orders
            .record_pick(order_id, &self.admin, scan(barcode, Some(serial), None))
            .await
            .expect("pick serial");
    }

    pub async fn pack_serial(&self, order_id: Uuid, barcode: &str, serial: &str) {
        self.state
            .services
            .orders
            .record_pack(order_id, &self.admin, scan(barcode, Some(serial), None))
            .await
            .expect("pack serial");
    }

    pub async fn pick_units(&self, order_id: Uuid, barcode: &str, units: i32) {
        self.state
            .services
            .orders
            .record_pick(order_id, &self.admin, scan(barcode, None, Some(units)))
            .await
            .expect("pick units");
    }

    pub async fn pack_units(&self, order_id: Uuid, barcode: &str, units: i32) {
        self.state
            .services
            .orders
            .record_pack(order_id, &self.admin, scan(barcode, None, Some(units)))
            .await
            .expect("pack units");
    }

    pub async fn order(&self, order_id: Uuid) -> OrderDetail {
        self.state
            .services
            .orders
            .get_order(order_id)
            .await
            .expect("load order")
    }

    /// Writes a stored status directly, bypassing the services.
    pub async fn force_status(&self, order_id: Uuid, status: OrderStatus) {
        let model = order::Entity::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists");
        let mut active = model.into_active_model();
        active.status = Set(status);
        active.update(&*self.state.db).await.expect("force status");
    }

    /// Inserts another row for a barcode, bypassing the import merge.
    pub async fn insert_row(
        &self,
        order_id: Uuid,
        barcode: &str,
        sn_tracked: bool,
        (quantity, picked, packed): (i32, i32, i32),
    ) -> order_item::Model {
        order_item::ActiveModel {
            order_id: Set(order_id),
            barcode: Set(barcode.to_string()),
            product_name: Set(format!("Product {}", barcode)),
            sn_tracked: Set(sn_tracked),
            quantity: Set(quantity),
            picked_quantity: Set(picked),
            packed_quantity: Set(packed),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("insert row")
    }

    pub async fn insert_serial(
        &self,
        order_item_id: i32,
        serial: &str,
        status: InstanceStatus,
    ) -> order_item_instance::Model {
        order_item_instance::ActiveModel {
            order_item_id: Set(order_item_id),
            serial_number: Set(serial.to_string()),
            status: Set(status),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("insert serial")
    }

    pub async fn claim(&self, order_id: Uuid, actor: &Actor) {
        self.state
            .services
            .orders
            .claim_order(order_id, actor)
            .await
            .expect("claim order");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn scan(barcode: &str, serial: Option<&str>, quantity: Option<i32>) -> ScanRequest {
    ScanRequest {
        barcode: barcode.to_string(),
        serial_number: serial.map(str::to_string),
        quantity,
    }
}

pub fn actor(role: Role) -> Actor {
    Actor::new(Uuid::new_v4(), role)
}

pub fn raw_proposal(value: Value) -> RawProposal {
    serde_json::from_value(value).expect("raw proposal json")
}

pub fn proposal(value: Value) -> Proposal {
    Proposal::validate(raw_proposal(value), &ProposalLimits::default()).expect("valid proposal")
}

pub async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// Sum of quantity, picked and packed over the rows of one barcode.
pub fn line_totals(detail: &OrderDetail, barcode: &str) -> (i32, i32, i32) {
    detail
        .items
        .iter()
        .filter(|l| l.line.barcode == barcode)
        .fold((0, 0, 0), |(q, p, k), l| {
            (q + l.line.quantity, p + l.line.picked_quantity, k + l.line.packed_quantity)
        })
}

/// Serials remaining on one barcode, in id order.
pub fn serials(detail: &OrderDetail, barcode: &str) -> Vec<String> {
    detail
        .items
        .iter()
        .filter(|l| l.line.barcode == barcode)
        .flat_map(|l| l.instances.iter().map(|i| i.serial_number.clone()))
        .collect()
}
