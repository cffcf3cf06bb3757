pub mod callbacks;
pub mod checkout;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod preferences;

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::message_queue::MessageQueue;
use crate::services::approval::PreferencesService;
use crate::services::fulfillment::FulfillmentClient;
use crate::services::orders::OrderService;
use crate::services::payments::PaymentService;
use crate::services::pricing::PricingService;

/// Service container wired once at startup and shared by all handlers.
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub pricing: PricingService,
    pub payments: PaymentService,
    pub preferences: PreferencesService,
    pub fulfillment: FulfillmentClient,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        queue: Arc<dyn MessageQueue>,
        events: EventSender,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            orders: OrderService::new(
                db.clone(),
                queue,
                events,
                config.currency_code.clone(),
                Duration::from_secs(config.queue_publish_delay_secs),
            ),
            pricing: PricingService::new(config)?,
            payments: PaymentService::new(config)?,
            preferences: PreferencesService::new(db),
            fulfillment: FulfillmentClient::new(config)?,
        })
    }
}
