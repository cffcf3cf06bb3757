/*!
 * Hand-off to the print-fulfillment provider.
 *
 * The mapper derives everything deterministic from the order snapshot, so a
 * redelivered message produces a byte-identical submission and the provider's
 * idempotency key dedupes it.
 */

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::http_client::{ApiAuth, ApiClient};
use crate::message_queue::{Message, MessageQueue};
use crate::models::{Address, OrderApprovedEvent};
use crate::services::orders::OrderService;

const DEFAULT_PRINT_AREA: &str = "default";
const FILL_PRINT_AREA: &str = "fillPrintArea";

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentOrderRequest {
    pub merchant_reference: String,
    pub idempotency_key: String,
    pub callback_url: String,
    pub shipping_method: String,
    pub recipient: Recipient,
    pub items: Vec<FulfillmentItem>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub name: String,
    pub email: String,
    pub address: RecipientAddress,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientAddress {
    pub line1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub town_or_city: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_or_county: Option<String>,
    pub postal_or_zip_code: String,
    pub country_code: String,
}

impl From<&Address> for RecipientAddress {
    fn from(address: &Address) -> Self {
        Self {
            line1: address.line1.clone(),
            line2: address.line2.clone(),
            town_or_city: address.town_or_city.clone(),
            state_or_county: address.state_or_county.clone(),
            postal_or_zip_code: address.postal_or_zip_code.clone(),
            country_code: address.country_code.clone(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentItem {
    pub sku: String,
    pub copies: i32,
    pub sizing: String,
    pub attributes: HashMap<String, String>,
    pub recipient_cost: RecipientCost,
    pub assets: Vec<FulfillmentAsset>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientCost {
    /// Decimal amount as a string, e.g. "40.00"
    pub amount: String,
    pub currency: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentAsset {
    pub print_area: String,
    pub url: String,
}

/// Deterministic provider-side dedup key derived from the order id, stable
/// across redeliveries.
pub fn idempotency_key(order_id: Uuid) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, order_id.as_bytes()).to_string()
}

/// Maps an approved-order snapshot to the provider's order request.
pub fn to_fulfillment_order(
    event: &OrderApprovedEvent,
    callback_base_uri: &str,
) -> FulfillmentOrderRequest {
    let mut metadata = HashMap::new();
    metadata.insert(
        "paymentIntentId".to_string(),
        event.payment_intent_id.clone(),
    );

    FulfillmentOrderRequest {
        merchant_reference: format!("order-{}", event.order_id),
        idempotency_key: idempotency_key(event.order_id),
        callback_url: format!(
            "{}/callbacks/{}",
            callback_base_uri.trim_end_matches('/'),
            event.order_id
        ),
        shipping_method: event.shipping_method.clone(),
        recipient: Recipient {
            name: event.customer_name.clone(),
            email: event.customer_email.clone(),
            address: RecipientAddress::from(&event.shipping_address),
        },
        items: event
            .items
            .iter()
            .map(|item| FulfillmentItem {
                sku: item.sku.clone(),
                copies: item.quantity,
                sizing: FILL_PRINT_AREA.to_string(),
                attributes: item.attributes.clone(),
                recipient_cost: RecipientCost {
                    amount: item.total.to_string(),
                    currency: event.currency.clone(),
                },
                assets: vec![FulfillmentAsset {
                    print_area: DEFAULT_PRINT_AREA.to_string(),
                    url: item.image_url.clone(),
                }],
            })
            .collect(),
        metadata,
    }
}

/// Thin provider client over the shared retry/breaker boundary.
#[derive(Clone)]
pub struct FulfillmentClient {
    client: ApiClient,
    callback_base_uri: String,
}

impl FulfillmentClient {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = ApiClient::new(
            "fulfillment-api",
            config.fulfillment_api_uri.clone(),
            ApiAuth::ApiKey(config.fulfillment_api_key.clone()),
            &config.http,
        )?;
        Ok(Self {
            client,
            callback_base_uri: config.fulfillment_callback_base_uri.clone(),
        })
    }

    /// Submits an approved order to the provider and returns the raw
    /// acceptance payload for storage on the order.
    #[instrument(skip(self, event), fields(order_id = %event.order_id))]
    pub async fn submit_order(
        &self,
        event: &OrderApprovedEvent,
    ) -> Result<serde_json::Value, ServiceError> {
        let request = to_fulfillment_order(event, &self.callback_base_uri);
        let response: serde_json::Value = self.client.post_json("orders", &request).await?;

        if let Some(outcome) = response.get("outcome").and_then(|v| v.as_str()) {
            debug!(order_id = %event.order_id, outcome, "fulfillment submission outcome");
        }
        Ok(response)
    }
}

/// Long-lived consumer: drains the message channel and drives approved
/// orders into the provider, completing them on acceptance.
pub async fn run_fulfillment_consumer(
    queue: Arc<dyn MessageQueue>,
    orders: OrderService,
    client: FulfillmentClient,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Fulfillment consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = queue.receive().await;
        match received {
            Ok(Some(message)) => {
                handle_message(&queue, &orders, &client, message).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                error!(error = %err, "failed to receive from message channel");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    info!("Fulfillment consumer stopped");
}

async fn handle_message(
    queue: &Arc<dyn MessageQueue>,
    orders: &OrderService,
    client: &FulfillmentClient,
    message: Message,
) {
    let message_id = message.id;

    // Unrecognized traffic is drained, not redelivered.
    if !message.is_json() || message.message_type() != Some(OrderApprovedEvent::TYPE_NAME) {
        warn!(
            %message_id,
            subject = %message.subject,
            "draining unrecognized message"
        );
        settle(queue, message_id, true).await;
        return;
    }

    let event: OrderApprovedEvent = match serde_json::from_value(message.payload.clone()) {
        Ok(event) => event,
        Err(err) => {
            warn!(%message_id, error = %err, "undeliverable payload; abandoning");
            settle(queue, message_id, false).await;
            return;
        }
    };

    let order_id = event.order_id;
    match client.submit_order(&event).await {
        Ok(response) => match orders.record_fulfillment(order_id, &response).await {
            Ok(()) => {
                info!(%order_id, "order submitted to fulfillment");
                settle(queue, message_id, true).await;
            }
            Err(err) => {
                error!(%order_id, error = %err, "failed to record fulfillment; abandoning");
                settle(queue, message_id, false).await;
            }
        },
        Err(err) => {
            warn!(%order_id, error = %err, "fulfillment submission failed; abandoning");
            settle(queue, message_id, false).await;
        }
    }
}

async fn settle(queue: &Arc<dyn MessageQueue>, message_id: Uuid, completed: bool) {
    let result = if completed {
        queue.complete(message_id).await
    } else {
        queue.abandon(message_id).await
    };
    if let Err(err) = result {
        error!(%message_id, error = %err, "failed to settle message");
    }
}

/// Periodic sweep re-emitting approved events for orders stuck in
/// `InProgress` with no provider response.
pub async fn run_reconciliation_sweep(
    orders: OrderService,
    interval: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(?interval, ?stale_after, "Reconciliation sweep started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh deployment does
    // not re-publish orders that are merely in flight.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match orders.republish_stale_approvals(stale_after).await {
                    Ok(0) => debug!("reconciliation sweep found no stuck orders"),
                    Ok(count) => warn!(count, "reconciliation sweep re-published stuck orders"),
                    Err(err) => error!(error = %err, "reconciliation sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Reconciliation sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::OrderItemDetails;
    use rust_decimal_macros::dec;

    fn approved_event(order_id: Uuid) -> OrderApprovedEvent {
        OrderApprovedEvent {
            order_id,
            customer_name: "Ada Lovelace".into(),
            customer_email: "ada@example.com".into(),
            items: vec![OrderItemDetails {
                id: Uuid::new_v4(),
                sku: "GLOBAL-CAN-16x20".into(),
                name: "Dusk over Holkham".into(),
                image_url: "https://images.test/holkham.jpg".into(),
                quantity: 2,
                attributes: HashMap::from([("wrap".to_string(), "Black".to_string())]),
                total: dec!(80.00),
            }],
            items_cost: dec!(80.00),
            shipping_cost: dec!(5.25),
            total_cost: dec!(85.25),
            currency: "GBP".into(),
            shipping_method: "Standard".into(),
            shipping_address: Address {
                line1: "1 Harbour Row".into(),
                line2: None,
                town_or_city: "Wells-next-the-Sea".into(),
                state_or_county: Some("Norfolk".into()),
                postal_or_zip_code: "NR23 1AB".into(),
                country_code: "GB".into(),
            },
            payment_intent_id: "pi_123".into(),
            approved_at: Utc::now(),
        }
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let order_id = Uuid::new_v4();
        assert_eq!(idempotency_key(order_id), idempotency_key(order_id));
        assert_ne!(idempotency_key(order_id), idempotency_key(Uuid::new_v4()));
    }

    #[test]
    fn redelivered_snapshots_map_identically() {
        let event = approved_event(Uuid::new_v4());
        let first = to_fulfillment_order(&event, "https://orders.test");
        let second = to_fulfillment_order(&event, "https://orders.test");
        assert_eq!(first, second);
    }

    #[test]
    fn mapping_carries_provider_fields() {
        let order_id = Uuid::new_v4();
        let event = approved_event(order_id);
        let request = to_fulfillment_order(&event, "https://orders.test/");

        assert_eq!(request.merchant_reference, format!("order-{order_id}"));
        assert_eq!(
            request.callback_url,
            format!("https://orders.test/callbacks/{order_id}")
        );
        assert_eq!(request.items.len(), 1);

        let item = &request.items[0];
        assert_eq!(item.copies, 2);
        assert_eq!(item.sizing, "fillPrintArea");
        assert_eq!(item.recipient_cost.amount, "80.00");
        assert_eq!(item.assets[0].print_area, "default");
        assert_eq!(item.assets[0].url, "https://images.test/holkham.jpg");
        assert_eq!(request.metadata["paymentIntentId"], "pi_123");
    }

    #[test]
    fn request_serializes_camel_case() {
        let event = approved_event(Uuid::new_v4());
        let json = serde_json::to_value(to_fulfillment_order(&event, "https://orders.test")).unwrap();

        assert!(json.get("merchantReference").is_some());
        assert!(json.get("idempotencyKey").is_some());
        assert!(json["recipient"]["address"].get("townOrCity").is_some());
        assert!(json["items"][0].get("recipientCost").is_some());
        assert!(json["items"][0]["assets"][0].get("printArea").is_some());
    }
}
