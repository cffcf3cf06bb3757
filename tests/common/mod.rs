use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;

use printworks_api::config::{AppConfig, HttpClientConfig};
use printworks_api::db::{establish_connection_with_config, run_migrations, DbConfig, DbPool};
use printworks_api::events::event_channel;
use printworks_api::handlers::AppServices;
use printworks_api::message_queue::{InMemoryMessageQueue, MessageQueue};
use printworks_api::models::{Basket, BasketItem};
use printworks_api::AppState;

pub async fn test_db() -> Arc<DbPool> {
    // A single connection keeps every query on the same in-memory database.
    let config = DbConfig {
        url: "sqlite::memory:".into(),
        max_connections: 1,
        min_connections: 1,
        ..Default::default()
    };
    let db = establish_connection_with_config(&config)
        .await
        .expect("sqlite connection");
    run_migrations(&db).await.expect("migrations");
    Arc::new(db)
}

/// Config pointing the three outbound dependencies at the given base URIs
/// (wiremock servers in practice), with timings tightened for tests.
pub fn test_config(quote_uri: &str, payment_uri: &str, fulfillment_uri: &str) -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "test".into(),
        log_level: "debug".into(),
        log_json: false,
        auto_migrate: true,
        db_max_connections: 5,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_acquire_timeout_secs: 5,
        currency_code: "GBP".into(),
        destination_country_code: "GB".into(),
        quote_api_uri: quote_uri.into(),
        quote_api_key: "quote-key".into(),
        payment_api_uri: payment_uri.into(),
        payment_api_key: "payment-key".into(),
        payment_webhook_secret: Some("whsec-test".into()),
        payment_webhook_tolerance_secs: 300,
        checkout_success_url: "https://shop.test/success".into(),
        checkout_cancel_url: "https://shop.test/cancel".into(),
        checkout_allowed_countries: "GB".into(),
        fulfillment_api_uri: fulfillment_uri.into(),
        fulfillment_api_key: "fulfillment-key".into(),
        fulfillment_callback_base_uri: "https://orders.test".into(),
        queue_publish_delay_secs: 0,
        queue_visibility_timeout_secs: 5,
        queue_max_deliveries: 3,
        consumer_poll_interval_secs: 1,
        reconciliation_enabled: false,
        reconciliation_interval_secs: 300,
        reconciliation_stale_after_secs: 900,
        event_channel_capacity: 64,
        http: HttpClientConfig {
            timeout_secs: 5,
            retry_max_attempts: 2,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 5,
            breaker_failure_threshold: 50,
            breaker_cooldown_secs: 1,
            breaker_success_threshold: 1,
        },
    }
}

pub struct TestApp {
    pub db: Arc<DbPool>,
    pub queue: Arc<InMemoryMessageQueue>,
    pub services: AppServices,
    pub config: Arc<AppConfig>,
}

impl TestApp {
    pub async fn new(config: AppConfig) -> Self {
        let db = test_db().await;
        let queue = Arc::new(InMemoryMessageQueue::new(
            Duration::from_secs(config.queue_visibility_timeout_secs),
            config.queue_max_deliveries,
        ));
        let (events, mut event_rx) = event_channel(config.event_channel_capacity);
        // Tests don't assert on the event loop; drain it so sends never block.
        tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

        let services = AppServices::new(
            db.clone(),
            queue.clone() as Arc<dyn MessageQueue>,
            events.clone(),
            &config,
        )
        .expect("services");

        let config = Arc::new(config);
        Self {
            db,
            queue,
            services,
            config,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        let queue: Arc<dyn MessageQueue> = self.queue.clone();
        let (events, mut rx) = event_channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Arc::new(AppState {
            db: self.db.clone(),
            config: self.config.clone(),
            services: self.services.clone(),
            events,
            queue,
        })
    }
}

pub fn sample_basket() -> Basket {
    Basket {
        order_id: None,
        items: vec![BasketItem {
            sku: "GLOBAL-CAN-16x20".into(),
            name: "Dusk over Holkham".into(),
            image_url: "https://images.test/holkham.jpg".into(),
            quantity: 1,
            attributes: HashMap::from([("wrap".to_string(), "Black".to_string())]),
            markup_percentage: dec!(100),
            total: dec!(40.00),
        }],
        shipping_method: "Standard".into(),
        shipping_cost: dec!(5.25),
    }
}
