mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use printworks_api::entities::order::OrderStatus;
use printworks_api::entities::preferences::AutoApproveMode;
use printworks_api::errors::ServiceError;
use printworks_api::message_queue::MessageQueue;
use printworks_api::models::{Address, CustomerDetails, OrderDetails};
use printworks_api::services::fulfillment::{idempotency_key, run_fulfillment_consumer};
use printworks_api::services::orders::{OrderFilter, OrderSort};

use common::{sample_basket, test_config, TestApp};

fn customer() -> CustomerDetails {
    CustomerDetails {
        name: "Ada Lovelace".into(),
        email: "ada@example.com".into(),
    }
}

fn address() -> Address {
    Address {
        line1: "1 Harbour Row".into(),
        line2: None,
        town_or_city: "Wells-next-the-Sea".into(),
        state_or_county: Some("Norfolk".into()),
        postal_or_zip_code: "NR23 1AB".into(),
        country_code: "GB".into(),
    }
}

fn assert_cost_invariant(order: &OrderDetails) {
    assert_eq!(order.items_cost + order.shipping_cost, order.total_cost);
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
async fn full_lifecycle_with_duplicate_webhook_delivery() {
    let app = app().await;
    let orders = &app.services.orders;

    let order_id = orders.create_order(&sample_basket()).await.unwrap();
    let created = orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(created.status, OrderStatus::PaymentIncomplete);
    assert_eq!(created.total_cost, dec!(45.25));
    assert_cost_invariant(&created);

    // First webhook delivery performs the transition.
    let transitioned = orders
        .confirm_payment(order_id, customer(), address(), "pi_1")
        .await
        .unwrap();
    assert!(transitioned);

    // Redelivery is a benign no-op.
    let transitioned = orders
        .confirm_payment(order_id, customer(), address(), "pi_1")
        .await
        .unwrap();
    assert!(!transitioned);

    let paid = orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(paid.status, OrderStatus::AwaitingApproval);
    assert_eq!(paid.customer_email.as_deref(), Some("ada@example.com"));
    assert_eq!(paid.payment_intent_id.as_deref(), Some("pi_1"));
    assert!(paid.payment_completed_at.is_some());
    assert_cost_invariant(&paid);

    // No preferences saved yet: approval decisioning fails closed.
    assert!(!orders.should_auto_approve(order_id).await.unwrap());

    app.services
        .preferences
        .upsert(
            "Holkham Prints".into(),
            AutoApproveMode::AutoApproveBelow,
            Some(dec!(100)),
        )
        .await
        .unwrap();
    assert!(orders.should_auto_approve(order_id).await.unwrap());

    orders.approve_order(order_id, true).await.unwrap();
    let approved = orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(approved.status, OrderStatus::InProgress);
    assert_cost_invariant(&approved);
    assert_eq!(app.queue.ready_len(), 1);

    // Approving twice is rejected; the snapshot was already published.
    assert_matches!(
        orders.approve_order(order_id, false).await,
        Err(ServiceError::InvalidStatus(_))
    );

    let message = app.queue.receive().await.unwrap().unwrap();
    assert_eq!(message.subject, "OrderApprovedEvent Message");
    app.queue.complete(message.id).await.unwrap();

    let response = json!({"outcome": "Created", "order": {"id": "ord_123"}});
    orders.record_fulfillment(order_id, &response).await.unwrap();
    let completed = orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    assert_eq!(completed.fulfillment_response, Some(response.clone()));
    assert_cost_invariant(&completed);

    // Redelivered fulfillment is benign; cancellation of a terminal order is not.
    orders.record_fulfillment(order_id, &response).await.unwrap();
    assert_matches!(
        orders.cancel_order(order_id).await,
        Err(ServiceError::InvalidStatus(_))
    );
}

#[tokio::test]
async fn cost_resync_overwrites_client_totals() {
    let app = app().await;
    let orders = &app.services.orders;

    let order_id = orders.create_order(&sample_basket()).await.unwrap();

    let mut repriced = sample_basket();
    repriced.order_id = Some(order_id);
    repriced.items[0].total = dec!(42.00);
    repriced.shipping_cost = dec!(6.00);
    orders.update_order_costs(&repriced).await.unwrap();

    let order = orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.items_cost, dec!(42.00));
    assert_eq!(order.shipping_cost, dec!(6.00));
    assert_eq!(order.total_cost, dec!(48.00));
    assert_eq!(order.items[0].total, dec!(42.00));
    assert_cost_invariant(&order);
}

#[tokio::test]
async fn cancellation_allowed_from_any_non_terminal_state() {
    let app = app().await;
    let orders = &app.services.orders;

    let unpaid = orders.create_order(&sample_basket()).await.unwrap();
    orders.cancel_order(unpaid).await.unwrap();
    assert_eq!(
        orders.get_order(unpaid).await.unwrap().unwrap().status,
        OrderStatus::Cancelled
    );

    let paid = orders.create_order(&sample_basket()).await.unwrap();
    orders
        .confirm_payment(paid, customer(), address(), "pi_2")
        .await
        .unwrap();
    orders.cancel_order(paid).await.unwrap();
    assert_eq!(
        orders.get_order(paid).await.unwrap().unwrap().status,
        OrderStatus::Cancelled
    );

    // Cancelled is terminal.
    assert_matches!(
        orders.cancel_order(paid).await,
        Err(ServiceError::InvalidStatus(_))
    );
}

#[tokio::test]
async fn listing_filters_and_empty_results() {
    let app = app().await;
    let orders = &app.services.orders;

    let abandoned = orders.create_order(&sample_basket()).await.unwrap();
    let paid = orders.create_order(&sample_basket()).await.unwrap();
    orders
        .confirm_payment(paid, customer(), address(), "pi_3")
        .await
        .unwrap();

    let all = orders.list_orders(&OrderFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let hidden_incomplete = orders
        .list_orders(&OrderFilter {
            exclude_payment_incomplete: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hidden_incomplete.len(), 1);
    assert_eq!(hidden_incomplete[0].id, paid);

    let by_status = orders
        .list_orders(&OrderFilter {
            status: Some(OrderStatus::PaymentIncomplete),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].id, abandoned);

    let by_email = orders
        .list_orders(&OrderFilter {
            email: Some("ada@".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_email.len(), 1);

    // No matches is a successful empty list, not an error.
    let none = orders
        .list_orders(&OrderFilter {
            email: Some("nobody@".into()),
            sort: OrderSort::CreatedAsc,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(none.is_empty());

    // Non-positive windows are coerced to the default lookback.
    let coerced = orders
        .list_orders(&OrderFilter {
            in_last_days: Some(-1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(coerced.len(), 2);
}

#[tokio::test]
async fn reconciliation_republishes_only_stuck_approvals() {
    let app = app().await;
    let orders = &app.services.orders;

    // Approved, but its snapshot never reaches the consumer.
    let stuck = orders.create_order(&sample_basket()).await.unwrap();
    orders
        .confirm_payment(stuck, customer(), address(), "pi_10")
        .await
        .unwrap();
    orders.approve_order(stuck, true).await.unwrap();

    // Approved and already fulfilled.
    let fulfilled = orders.create_order(&sample_basket()).await.unwrap();
    orders
        .confirm_payment(fulfilled, customer(), address(), "pi_11")
        .await
        .unwrap();
    orders.approve_order(fulfilled, true).await.unwrap();
    orders
        .record_fulfillment(fulfilled, &json!({"outcome": "Created"}))
        .await
        .unwrap();

    // Paid but not yet approved.
    let waiting = orders.create_order(&sample_basket()).await.unwrap();
    orders
        .confirm_payment(waiting, customer(), address(), "pi_12")
        .await
        .unwrap();

    // Drop the original publishes, as if they were lost after approval.
    while let Some(message) = app.queue.receive().await.unwrap() {
        app.queue.complete(message.id).await.unwrap();
    }
    assert_eq!(app.queue.ready_len(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let republished = orders
        .republish_stale_approvals(Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(republished, 1);

    let message = app.queue.receive().await.unwrap().unwrap();
    assert_eq!(message.subject, "OrderApprovedEvent Message");
    assert_eq!(message.payload["order_id"], json!(stuck));
    app.queue.complete(message.id).await.unwrap();

    // Once the stuck order records a response it drops out of the sweep.
    orders
        .record_fulfillment(stuck, &json!({"outcome": "Created"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        orders
            .republish_stale_approvals(Duration::ZERO)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn consumer_submits_approved_order_and_completes_it() {
    let fulfillment = MockServer::start().await;

    let app = TestApp::new(test_config(
        "http://quote.invalid/",
        "http://payment.invalid/",
        &format!("{}/", fulfillment.uri()),
    ))
    .await;
    let orders = app.services.orders.clone();

    let order_id = orders.create_order(&sample_basket()).await.unwrap();
    orders
        .confirm_payment(order_id, customer(), address(), "pi_9")
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("X-API-Key", "fulfillment-key"))
        .and(body_partial_json(json!({
            "merchantReference": format!("order-{order_id}"),
            "idempotencyKey": idempotency_key(order_id),
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outcome": "Created"})))
        .expect(1)
        .mount(&fulfillment)
        .await;

    orders.approve_order(order_id, false).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(run_fulfillment_consumer(
        app.queue.clone() as Arc<dyn MessageQueue>,
        orders.clone(),
        app.services.fulfillment.clone(),
        Duration::from_millis(20),
        shutdown_rx,
    ));

    // Wait for the consumer to drive the order to completion.
    let mut completed = false;
    for _ in 0..100 {
        let order = orders.get_order(order_id).await.unwrap().unwrap();
        if order.status == OrderStatus::Completed {
            completed = true;
            assert!(order.fulfillment_response.is_some());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed, "consumer never completed the order");

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), consumer).await;

    assert_eq!(app.queue.ready_len(), 0);
    assert!(app.queue.dead_letters().is_empty());
}
