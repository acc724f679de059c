mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{actor, read_json, TestApp};
use fulfillment_engine::auth::Role;
use fulfillment_engine::middleware_helpers::REQUEST_ID_HEADER;

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));

    let body = read_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["checks"]["database"]["status"], "up");
}

#[tokio::test]
async fn requests_without_actor_headers_are_unauthorized() {
    let app = TestApp::new().await;
    let uri = format!("/api/v1/orders/{}", uuid::Uuid::new_v4());
    let response = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = read_json(response).await;
    assert_eq!(body["error"], "Unauthorized");
    assert!(body["requestId"].is_string());
}

#[tokio::test]
async fn order_can_be_created_and_read_back() {
    let app = TestApp::new().await;
    let supervisor = actor(Role::Supervisor);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "orderNumber": "SO-1001",
                "items": [
                    { "barcode": "A", "productName": "Widget", "quantity": 2 },
                    { "barcode": "B", "productName": "Scanner", "quantity": 1, "snList": ["SN:b-1"] }
                ]
            })),
            Some(&supervisor),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    assert_eq!(created["success"], true);
    let order_id = created["data"]["order"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["data"]["order"]["status"], "pending");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{order_id}"),
            None,
            Some(&actor(Role::Viewer)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let detail = read_json(response).await;
    let items = detail["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1]["instances"][0]["serialNumber"], "b-1");
    assert_eq!(detail["data"]["derivedStatus"], "pending");
}

#[tokio::test]
async fn duplicate_order_number_conflicts() {
    let app = TestApp::new().await;
    let supervisor = actor(Role::Supervisor);
    let body = json!({
        "orderNumber": "SO-7",
        "items": [{ "barcode": "A", "productName": "Widget", "quantity": 1 }]
    });

    let first = app
        .request(Method::POST, "/api/v1/orders", Some(body.clone()), Some(&supervisor))
        .await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let second = app
        .request(Method::POST, "/api/v1/orders", Some(body), Some(&supervisor))
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn pick_scan_advances_status() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 2, None)]).await;
    let operator = actor(Role::Operator);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/pick", order.order.id),
            Some(json!({ "barcode": "A", "quantity": 2 })),
            Some(&operator),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["data"]["status"], "picked");

    let over = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/pick", order.order.id),
            Some(json!({ "barcode": "A" })),
            Some(&operator),
        )
        .await;
    assert_eq!(over.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn exception_flow_over_http() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 1, None)]).await;
    let order_id = order.order.id;

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_id}/exceptions"),
            Some(json!({
                "exceptionType": "order_change",
                "reason": "customer wants two",
                "proposal": {
                    "note": "add one",
                    "items": [{ "barcode": "A", "productName": "Product A", "quantityChange": 1 }]
                }
            })),
            Some(&actor(Role::Operator)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    let exception_id = created["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["data"]["status"], "open");

    let supervisor = actor(Role::Supervisor);
    let premature = app
        .request(
            Method::POST,
            &format!("/api/v1/exceptions/{exception_id}/resolve"),
            Some(json!({ "resolutionAction": "other" })),
            Some(&supervisor),
        )
        .await;
    assert_eq!(premature.status(), StatusCode::CONFLICT);

    let acked = app
        .request(
            Method::POST,
            &format!("/api/v1/exceptions/{exception_id}/ack"),
            Some(json!({ "note": "fine" })),
            Some(&supervisor),
        )
        .await;
    assert_eq!(acked.status(), StatusCode::OK);
    assert_eq!(read_json(acked).await["data"]["status"], "ack");

    let listed = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{order_id}/exceptions"),
            None,
            Some(&supervisor),
        )
        .await;
    assert_eq!(read_json(listed).await["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn reconcile_endpoint_is_admin_only() {
    let app = TestApp::new().await;

    let forbidden = app
        .request(
            Method::POST,
            "/api/v1/admin/reconcile",
            Some(json!({ "dryRun": true })),
            Some(&actor(Role::Supervisor)),
        )
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let admin = app.admin;
    let ok = app
        .request(
            Method::POST,
            "/api/v1/admin/reconcile",
            Some(json!({ "dryRun": true })),
            Some(&admin),
        )
        .await;
    assert_eq!(ok.status(), StatusCode::OK);
    let body = read_json(ok).await;
    assert_eq!(body["data"]["dryRun"], true);
    assert_eq!(body["data"]["scanned"], 0);
}

#[tokio::test]
async fn incoming_request_id_is_echoed() {
    let app = TestApp::new().await;
    let request = axum::http::Request::builder()
        .uri("/health")
        .header(REQUEST_ID_HEADER, "trace-42")
        .body(axum::body::Body::empty())
        .unwrap();
    let router = fulfillment_engine::build_router(app.state.clone());
    let response = tower::ServiceExt::oneshot(router, request).await.unwrap();
    assert_eq!(
        response.headers().get(REQUEST_ID_HEADER).unwrap(),
        "trace-42"
    );
}

#[tokio::test]
async fn malformed_bodies_get_the_standard_error_body() {
    let app = TestApp::new().await;
    let order = app.seed_order(&[("A", 1, None)]).await;
    let supervisor = actor(Role::Supervisor);

    let exception = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/exceptions", order.order.id),
            Some(json!({ "exceptionType": "damage", "reason": "dented box" })),
            Some(&supervisor),
        )
        .await;
    let exception_id = read_json(exception).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let cases = [
        (
            format!("/api/v1/exceptions/{exception_id}/proposal"),
            json!({ "note": "n", "items": 7 }),
        ),
        (
            format!("/api/v1/exceptions/{exception_id}/resolve"),
            json!({ "resolutionAction": "teleport" }),
        ),
        (
            format!("/api/v1/exceptions/{exception_id}/ack"),
            json!({ "note": 5 }),
        ),
        ("/api/v1/admin/reconcile".to_string(), json!({ "dryRun": "yes" })),
    ];
    let admin = app.admin;
    for (uri, body) in cases {
        let response = app
            .request(Method::POST, &uri, Some(body), Some(&admin))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        let body = read_json(response).await;
        assert_eq!(body["error"], "Bad Request");
        assert!(body["message"].as_str().unwrap().starts_with("Validation error"));
        assert!(body["requestId"].is_string());
    }
}
