mod common;

use assert_matches::assert_matches;
use serde_json::json;

use common::{actor, line_totals, raw_proposal, TestApp};
use fulfillment_engine::auth::Role;
use fulfillment_engine::errors::ServiceError;
use fulfillment_engine::models::exception::{ExceptionStatus, ExceptionType, ResolutionAction};
use fulfillment_engine::models::order::OrderStatus;
use fulfillment_engine::models::proposal::ProposalLimits;
use fulfillment_engine::services::exceptions::{
    AcknowledgeRequest, CreateExceptionRequest, ExceptionService, ResolveRequest,
};
use fulfillment_engine::services::order_changes::ApplyReport;

fn order_change(proposal: serde_json::Value) -> CreateExceptionRequest {
    CreateExceptionRequest {
        exception_type: ExceptionType::OrderChange,
        reason: "customer called".into(),
        proposal: Some(raw_proposal(proposal)),
        note: None,
    }
}

fn add_one(barcode: &str) -> serde_json::Value {
    json!({
        "note": "add one unit",
        "items": [{ "barcode": barcode, "productName": format!("Product {barcode}"), "quantityChange": 1 }]
    })
}

#[tokio::test]
async fn acknowledging_an_order_change_applies_it() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let operator = actor(Role::Operator);
    let supervisor = actor(Role::Supervisor);
    let exceptions = &app.state.services.exceptions;

    let exception = exceptions
        .create(order.order.id, &operator, order_change(add_one("A")))
        .await
        .expect("operator reports");
    assert_eq!(exception.status, ExceptionStatus::Open);
    assert!(exception.snapshot.is_some());
    assert_eq!(line_totals(&app.order(order.order.id).await, "A"), (2, 0, 0));

    let acked = exceptions
        .acknowledge(
            exception.id,
            &supervisor,
            AcknowledgeRequest {
                note: Some("ok".into()),
            },
        )
        .await
        .expect("supervisor acknowledges");
    assert_eq!(acked.status, ExceptionStatus::Ack);
    assert_eq!(acked.ack_by, Some(supervisor.user_id));
    assert_eq!(acked.ack_note.as_deref(), Some("ok"));

    let report: ApplyReport =
        serde_json::from_value(acked.apply_report.expect("apply report stored")).unwrap();
    assert_eq!(report.items[0].quantity_after, 3);
    assert_eq!(line_totals(&app.order(order.order.id).await, "A"), (3, 0, 0));

    let resolved = exceptions
        .resolve(
            exception.id,
            &supervisor,
            ResolveRequest {
                resolution_action: Some(ResolutionAction::Other),
                note: None,
            },
        )
        .await
        .expect("resolves after ack");
    assert_eq!(resolved.status, ExceptionStatus::Resolved);
    assert_eq!(resolved.resolution_action, Some(ResolutionAction::Other));
}

#[tokio::test]
async fn second_open_order_change_is_rejected() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let operator = actor(Role::Operator);
    let exceptions = &app.state.services.exceptions;

    exceptions
        .create(order.order.id, &operator, order_change(add_one("A")))
        .await
        .expect("first report");
    let second = exceptions
        .create(order.order.id, &operator, order_change(add_one("A")))
        .await;
    assert_matches!(second, Err(ServiceError::Conflict(_)));

    // Other kinds are not limited.
    exceptions
        .create(
            order.order.id,
            &operator,
            CreateExceptionRequest {
                exception_type: ExceptionType::Damage,
                reason: "box crushed".into(),
                proposal: None,
                note: None,
            },
        )
        .await
        .expect("damage report alongside open order change");
}

#[tokio::test]
async fn resolving_an_open_exception_conflicts() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 1, None)]).await;
    let exceptions = &app.state.services.exceptions;

    let exception = exceptions
        .create(
            order.order.id,
            &actor(Role::Operator),
            CreateExceptionRequest {
                exception_type: ExceptionType::Stockout,
                reason: "shelf empty".into(),
                proposal: None,
                note: None,
            },
        )
        .await
        .unwrap();

    let result = exceptions
        .resolve(
            exception.id,
            &actor(Role::Supervisor),
            ResolveRequest {
                resolution_action: Some(ResolutionAction::ShortShip),
                note: None,
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::Conflict(msg)) if msg.contains("open"));
    assert_eq!(
        exceptions.get(exception.id).await.unwrap().status,
        ExceptionStatus::Open
    );
}

#[tokio::test]
async fn resolve_requires_an_action() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 1, None)]).await;
    let exceptions = &app.state.services.exceptions;
    let exception = exceptions
        .create(
            order.order.id,
            &actor(Role::Operator),
            CreateExceptionRequest {
                exception_type: ExceptionType::Other,
                reason: "label smudged".into(),
                proposal: None,
                note: None,
            },
        )
        .await
        .unwrap();

    let result = exceptions
        .resolve(exception.id, &actor(Role::Supervisor), ResolveRequest::default())
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn failed_application_keeps_exception_open() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, Some(&["S1", "S2"][..]))]).await;
    let order_id = order.order.id;
    let exceptions = &app.state.services.exceptions;

    let exception = exceptions
        .create(
            order_id,
            &actor(Role::Operator),
            order_change(json!({
                "note": "drop one",
                "items": [{ "barcode": "A", "productName": "Product A", "quantityChange": -1, "isSn": true }]
            })),
        )
        .await
        .unwrap();

    // Both units get picked before anyone approves the change.
    app.pick_serial(order_id, "A", "S1").await;
    app.pick_serial(order_id, "A", "S2").await;

    let result = exceptions
        .acknowledge(exception.id, &actor(Role::Supervisor), AcknowledgeRequest::default())
        .await;
    assert_matches!(result, Err(ServiceError::Conflict(_)));

    let stored = exceptions.get(exception.id).await.unwrap();
    assert_eq!(stored.status, ExceptionStatus::Open);
    assert!(stored.ack_by.is_none());
    assert!(stored.apply_report.is_none());
    let detail = app.order(order_id).await;
    assert_eq!(detail.order.status, OrderStatus::Picked);
    assert_eq!(line_totals(&detail, "A"), (2, 2, 0));
}

#[tokio::test]
async fn double_acknowledgement_conflicts() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let exceptions = &app.state.services.exceptions;
    let exception = exceptions
        .create(order.order.id, &actor(Role::Operator), order_change(add_one("A")))
        .await
        .unwrap();

    let supervisor = actor(Role::Supervisor);
    exceptions
        .acknowledge(exception.id, &supervisor, AcknowledgeRequest::default())
        .await
        .expect("first ack");
    let again = exceptions
        .acknowledge(exception.id, &supervisor, AcknowledgeRequest::default())
        .await;
    assert_matches!(again, Err(ServiceError::Conflict(msg)) if msg.contains("ack"));

    // Applied exactly once.
    assert_eq!(line_totals(&app.order(order.order.id).await, "A"), (3, 0, 0));
}

#[tokio::test]
async fn admin_reporting_on_claimed_order_self_approves() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let admin = app.admin;
    app.claim(order.order.id, &admin).await;

    let exception = app
        .state
        .services
        .exceptions
        .create(order.order.id, &admin, order_change(add_one("A")))
        .await
        .expect("self-approved report");

    assert_eq!(exception.status, ExceptionStatus::Ack);
    assert_eq!(exception.ack_by, Some(admin.user_id));
    assert!(exception.ack_note.is_some());
    assert!(exception.apply_report.is_some());
    assert_eq!(line_totals(&app.order(order.order.id).await, "A"), (3, 0, 0));
}

#[tokio::test]
async fn admin_without_claim_goes_through_review() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;

    let exception = app
        .state
        .services
        .exceptions
        .create(order.order.id, &app.admin, order_change(add_one("A")))
        .await
        .unwrap();

    assert_eq!(exception.status, ExceptionStatus::Open);
    assert_eq!(line_totals(&app.order(order.order.id).await, "A"), (2, 0, 0));
}

#[tokio::test]
async fn roles_gate_each_transition() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let exceptions = &app.state.services.exceptions;

    let viewer_report = exceptions
        .create(order.order.id, &actor(Role::Viewer), order_change(add_one("A")))
        .await;
    assert_matches!(viewer_report, Err(ServiceError::Forbidden(_)));

    let exception = exceptions
        .create(order.order.id, &actor(Role::Operator), order_change(add_one("A")))
        .await
        .unwrap();
    let operator_ack = exceptions
        .acknowledge(exception.id, &actor(Role::Operator), AcknowledgeRequest::default())
        .await;
    assert_matches!(operator_ack, Err(ServiceError::Forbidden(_)));
}

#[tokio::test]
async fn proposal_can_be_replaced_while_open() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let exceptions = &app.state.services.exceptions;
    let operator = actor(Role::Operator);

    let exception = exceptions
        .create(
            order.order.id,
            &operator,
            CreateExceptionRequest {
                exception_type: ExceptionType::OrderChange,
                reason: "details to follow".into(),
                proposal: None,
                note: None,
            },
        )
        .await
        .unwrap();
    assert!(exception.snapshot.is_none());

    let updated = exceptions
        .propose(
            exception.id,
            &operator,
            raw_proposal(json!({
                "note": "two more",
                "items": [{ "barcode": "A", "productName": "Product A", "quantityChange": 2 }]
            })),
        )
        .await
        .expect("proposal attached");
    assert!(updated.snapshot.is_some());

    exceptions
        .acknowledge(exception.id, &actor(Role::Supervisor), AcknowledgeRequest::default())
        .await
        .unwrap();
    assert_eq!(line_totals(&app.order(order.order.id).await, "A"), (4, 0, 0));

    let late = exceptions
        .propose(exception.id, &operator, raw_proposal(add_one("A")))
        .await;
    assert_matches!(late, Err(ServiceError::Conflict(_)));
}

#[tokio::test]
async fn invalid_proposal_is_rejected_before_anything_is_stored() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let exceptions = &app.state.services.exceptions;

    let result = exceptions
        .create(
            order.order.id,
            &actor(Role::Operator),
            order_change(json!({ "note": "  ", "items": [] })),
        )
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert!(exceptions.list_for_order(order.order.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn acknowledgement_applies_every_item_under_configured_limits() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 1, None)]).await;
    let limits = ProposalLimits {
        max_note_chars: 5000,
        max_items: 300,
    };
    let exceptions = ExceptionService::new(app.db(), None, limits);

    let items: Vec<serde_json::Value> = (0..250)
        .map(|i| json!({ "barcode": format!("N{i}"), "productName": "New", "quantityChange": 1 }))
        .collect();
    let exception = exceptions
        .create(
            order.order.id,
            &actor(Role::Operator),
            order_change(json!({ "note": "n".repeat(3000), "items": items })),
        )
        .await
        .expect("large proposal accepted");

    exceptions
        .acknowledge(exception.id, &actor(Role::Supervisor), AcknowledgeRequest::default())
        .await
        .expect("acknowledged under the same limits");

    let detail = app.order(order.order.id).await;
    assert_eq!(detail.items.len(), 251);
    assert_eq!(line_totals(&detail, "N249"), (1, 0, 0));
}
