mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use rust_decimal_macros::dec;
use serde_json::json;
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use printworks_api::app_router;
use printworks_api::entities::order::OrderStatus;
use printworks_api::entities::preferences::AutoApproveMode;

use common::{sample_basket, test_config, TestApp};

fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

fn completed_event(order_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_test",
            "payment_intent": "pi_test",
            "metadata": { "order_id": order_id.to_string() },
            "customer_details": { "name": "Ada", "email": "ada@example.com" },
            "shipping_details": {
                "name": "Ada Lovelace",
                "address": {
                    "line1": "1 Harbour Row",
                    "city": "Wells-next-the-Sea",
                    "postal_code": "NR23 1AB",
                    "country": "GB"
                }
            }
        }}
    }))
    .unwrap()
}

fn signed_request(body: Vec<u8>) -> Request<Body> {
    let signature = sign("whsec-test", chrono::Utc::now().timestamp(), &body);
    Request::builder()
        .method("POST")
        .uri("/api/v1/payments/webhook")
        .header("content-type", "application/json")
        .header("X-Signature", signature)
        .body(Body::from(body))
        .unwrap()
}

async fn app() -> TestApp {
    TestApp::new(test_config(
        "http://quote.invalid/",
        "http://payment.invalid/",
        "http://fulfillment.invalid/",
    ))
    .await
}

#[tokio::test]
async fn completed_checkout_confirms_payment_and_awaits_manual_approval() {
    let app = app().await;
    let order_id = app
        .services
        .orders
        .create_order(&sample_basket())
        .await
        .unwrap();
    let router = app_router(app.state());

    let response = router
        .clone()
        .oneshot(signed_request(completed_event(order_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let order = app
        .services
        .orders
        .get_order(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingApproval);
    assert_eq!(order.customer_name.as_deref(), Some("Ada Lovelace"));

    // Redelivery is acknowledged without re-running approval decisioning.
    let replay = router
        .oneshot(signed_request(completed_event(order_id)))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);

    let order = app
        .services
        .orders
        .get_order(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingApproval);
    assert_eq!(app.queue.ready_len(), 0);
}

#[tokio::test]
async fn auto_approval_publishes_to_the_channel() {
    let app = app().await;
    app.services
        .preferences
        .upsert("Holkham Prints".into(), AutoApproveMode::AutoApproveAll, None)
        .await
        .unwrap();

    let order_id = app
        .services
        .orders
        .create_order(&sample_basket())
        .await
        .unwrap();
    let router = app_router(app.state());

    let response = router
        .oneshot(signed_request(completed_event(order_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let order = app
        .services
        .orders
        .get_order(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::InProgress);
    assert_eq!(app.queue.ready_len(), 1);
}

#[tokio::test]
async fn below_limit_policy_gates_on_the_order_total() {
    let app = app().await;
    app.services
        .preferences
        .upsert(
            "Holkham Prints".into(),
            AutoApproveMode::AutoApproveBelow,
            Some(dec!(40)),
        )
        .await
        .unwrap();

    // Total 45.25 is above the limit: manual approval.
    let order_id = app
        .services
        .orders
        .create_order(&sample_basket())
        .await
        .unwrap();
    let router = app_router(app.state());

    router
        .oneshot(signed_request(completed_event(order_id)))
        .await
        .unwrap();

    let order = app
        .services
        .orders
        .get_order(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingApproval);
    assert_eq!(app.queue.ready_len(), 0);
}

#[tokio::test]
async fn invalid_signature_is_rejected() {
    let app = app().await;
    let order_id = app
        .services
        .orders
        .create_order(&sample_basket())
        .await
        .unwrap();
    let router = app_router(app.state());

    let body = completed_event(order_id);
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/payments/webhook")
        .header("content-type", "application/json")
        .header(
            "X-Signature",
            sign("wrong-secret", chrono::Utc::now().timestamp(), &body),
        )
        .body(Body::from(body))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let order = app
        .services
        .orders
        .get_order(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::PaymentIncomplete);
}

#[tokio::test]
async fn unrelated_event_types_are_acknowledged_and_ignored() {
    let app = app().await;
    let router = app_router(app.state());

    let body = serde_json::to_vec(&json!({
        "type": "payment_intent.created",
        "data": { "object": { "id": "pi_x" } }
    }))
    .unwrap();

    let response = router.oneshot(signed_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
