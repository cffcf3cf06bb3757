/*!
 * Hosted-checkout payment gateway: session creation plus webhook signature
 * verification and event parsing.
 */

use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::http_client::{ApiAuth, ApiClient};
use crate::models::{Address, Basket, CustomerDetails};

type HmacSha256 = Hmac<Sha256>;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// Signature scheme: `X-Signature: t=<unix-ts>,v1=<hex hmac-sha256>` where the
/// MAC is computed over `"{ts}.{raw body}"`.
pub const SIGNATURE_HEADER: &str = "X-Signature";

#[derive(Debug, Serialize)]
struct CheckoutSessionRequest {
    mode: &'static str,
    success_url: String,
    cancel_url: String,
    payment_method_types: Vec<&'static str>,
    shipping_address_collection: ShippingAddressCollection,
    line_items: Vec<LineItem>,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ShippingAddressCollection {
    allowed_countries: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LineItem {
    quantity: i64,
    price_data: PriceData,
}

#[derive(Debug, Serialize)]
struct PriceData {
    currency: String,
    /// Minor currency units (pence, cents)
    unit_amount: i64,
    product_data: ProductData,
}

#[derive(Debug, Serialize)]
struct ProductData {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

/// Hosted checkout session handed back to the storefront.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Inbound webhook envelope.
#[derive(Debug, Deserialize)]
pub struct CheckoutWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: SessionObject,
}

#[derive(Debug, Deserialize)]
pub struct SessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub customer_details: Option<WebhookCustomer>,
    #[serde(default)]
    pub shipping_details: Option<WebhookShipping>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookCustomer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookShipping {
    #[serde(default)]
    pub name: Option<String>,
    pub address: WebhookAddress,
}

#[derive(Debug, Deserialize)]
pub struct WebhookAddress {
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    pub postal_code: String,
    pub country: String,
}

impl SessionObject {
    pub fn order_id(&self) -> Result<Uuid, ServiceError> {
        let raw = self.metadata.get("order_id").ok_or_else(|| {
            ServiceError::InvalidInput("checkout session metadata missing order_id".to_string())
        })?;
        Uuid::parse_str(raw)
            .map_err(|_| ServiceError::InvalidInput(format!("invalid order_id metadata: {raw}")))
    }

    pub fn customer(&self) -> Result<CustomerDetails, ServiceError> {
        let details = self.customer_details.as_ref().ok_or_else(|| {
            ServiceError::InvalidInput("checkout session has no customer details".to_string())
        })?;
        // Prefer the name the customer gave at the shipping step.
        let name = self
            .shipping_details
            .as_ref()
            .and_then(|s| s.name.clone())
            .or_else(|| details.name.clone())
            .ok_or_else(|| {
                ServiceError::InvalidInput("checkout session has no customer name".to_string())
            })?;
        let email = details.email.clone().ok_or_else(|| {
            ServiceError::InvalidInput("checkout session has no customer email".to_string())
        })?;
        Ok(CustomerDetails { name, email })
    }

    pub fn shipping_address(&self) -> Result<Address, ServiceError> {
        let shipping = self.shipping_details.as_ref().ok_or_else(|| {
            ServiceError::InvalidInput("checkout session has no shipping details".to_string())
        })?;
        Ok(Address {
            line1: shipping.address.line1.clone(),
            line2: shipping.address.line2.clone(),
            town_or_city: shipping.address.city.clone(),
            state_or_county: shipping.address.state.clone(),
            postal_or_zip_code: shipping.address.postal_code.clone(),
            country_code: shipping.address.country.clone(),
        })
    }

    pub fn payment_intent_id(&self) -> Result<&str, ServiceError> {
        self.payment_intent.as_deref().ok_or_else(|| {
            ServiceError::InvalidInput("checkout session has no payment intent".to_string())
        })
    }
}

#[derive(Clone)]
pub struct PaymentService {
    client: ApiClient,
    currency_code: String,
    success_url: String,
    cancel_url: String,
    allowed_countries: Vec<String>,
    webhook_secret: Option<String>,
    webhook_tolerance_secs: u64,
}

impl PaymentService {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = ApiClient::new(
            "payment-api",
            config.payment_api_uri.clone(),
            ApiAuth::Bearer(config.payment_api_key.clone()),
            &config.http,
        )?;

        Ok(Self {
            client,
            currency_code: config.currency_code.to_ascii_lowercase(),
            success_url: config.checkout_success_url.clone(),
            cancel_url: config.checkout_cancel_url.clone(),
            allowed_countries: config.allowed_countries(),
            webhook_secret: config.payment_webhook_secret.clone(),
            webhook_tolerance_secs: config.payment_webhook_tolerance_secs,
        })
    }

    /// Creates a hosted checkout session for the priced basket. The order id
    /// travels in session metadata and comes back on the completion webhook.
    #[instrument(skip(self, basket), fields(order_id = %order_id))]
    pub async fn create_checkout_session(
        &self,
        order_id: Uuid,
        basket: &Basket,
    ) -> Result<CheckoutSession, ServiceError> {
        // Each line is charged at its total; a marked-up line total does not
        // always divide evenly back into a per-unit minor amount.
        let mut line_items: Vec<LineItem> = basket
            .items
            .iter()
            .map(|item| {
                let name = if item.quantity > 1 {
                    format!("{} (x{})", item.name, item.quantity)
                } else {
                    item.name.clone()
                };
                Ok(LineItem {
                    quantity: 1,
                    price_data: PriceData {
                        currency: self.currency_code.clone(),
                        unit_amount: to_minor_units(item.total)?,
                        product_data: ProductData {
                            name,
                            description: Some(describe_attributes(&item.attributes)),
                            images: vec![item.image_url.clone()],
                        },
                    },
                })
            })
            .collect::<Result<_, ServiceError>>()?;

        if basket.shipping_cost > Decimal::ZERO {
            line_items.push(LineItem {
                quantity: 1,
                price_data: PriceData {
                    currency: self.currency_code.clone(),
                    unit_amount: to_minor_units(basket.shipping_cost)?,
                    product_data: ProductData {
                        name: format!("Shipping ({})", basket.shipping_method),
                        description: None,
                        images: Vec::new(),
                    },
                },
            });
        }

        let mut metadata = HashMap::new();
        metadata.insert("order_id".to_string(), order_id.to_string());

        let request = CheckoutSessionRequest {
            mode: "payment",
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
            payment_method_types: vec!["card"],
            shipping_address_collection: ShippingAddressCollection {
                allowed_countries: self.allowed_countries.clone(),
            },
            line_items,
            metadata,
        };

        self.client.post_json("checkout/sessions", &request).await
    }

    /// Verifies the webhook signature header against the raw body.
    pub fn verify_signature(&self, header: &str, body: &[u8]) -> Result<(), ServiceError> {
        self.verify_signature_at(header, body, chrono::Utc::now().timestamp())
    }

    fn verify_signature_at(&self, header: &str, body: &[u8], now: i64) -> Result<(), ServiceError> {
        let secret = self.webhook_secret.as_ref().ok_or_else(|| {
            ServiceError::Unauthorized("webhook secret is not configured".to_string())
        })?;

        let (timestamp, signature) = parse_signature_header(header)?;

        if (now - timestamp).unsigned_abs() > self.webhook_tolerance_secs {
            return Err(ServiceError::Unauthorized(
                "webhook timestamp outside tolerance".to_string(),
            ));
        }

        let expected = hex::decode(signature)
            .map_err(|_| ServiceError::Unauthorized("malformed webhook signature".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("hmac init: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);

        // Constant-time comparison.
        mac.verify_slice(&expected)
            .map_err(|_| ServiceError::Unauthorized("webhook signature mismatch".to_string()))
    }

    pub fn parse_event(&self, body: &[u8]) -> Result<CheckoutWebhookEvent, ServiceError> {
        let event = serde_json::from_slice(body)?;
        Ok(event)
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, &str), ServiceError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(v1)) => Ok((t, v1)),
        _ => Err(ServiceError::Unauthorized(
            "malformed signature header".to_string(),
        )),
    }
}

/// Converts a major-unit amount to integer minor units, rejecting amounts
/// that do not land on a whole minor unit.
fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    let minor = (amount * Decimal::from(100)).round_dp(4);
    if minor.fract() != Decimal::ZERO {
        return Err(ServiceError::InvalidInput(format!(
            "amount {amount} is not representable in minor units"
        )));
    }
    minor
        .to_i64()
        .ok_or_else(|| ServiceError::InvalidInput(format!("amount {amount} out of range")))
}

fn describe_attributes(attributes: &HashMap<String, String>) -> String {
    if attributes.is_empty() {
        return "Fine art print".to_string();
    }
    let mut pairs: Vec<String> = attributes.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    pairs.sort();
    pairs.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn service(secret: Option<&str>) -> PaymentService {
        PaymentService {
            client: ApiClient::new(
                "payment-api",
                "https://pay.test/v1/",
                ApiAuth::Bearer("sk".into()),
                &crate::config::HttpClientConfig::default(),
            )
            .unwrap(),
            currency_code: "gbp".into(),
            success_url: "https://shop.test/success".into(),
            cancel_url: "https://shop.test/cancel".into(),
            allowed_countries: vec!["GB".into()],
            webhook_secret: secret.map(str::to_string),
            webhook_tolerance_secs: 300,
        }
    }

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let svc = service(Some("whsec"));
        let body = br#"{"type":"checkout.session.completed"}"#;
        let header = sign("whsec", 1_700_000_000, body);

        assert!(svc
            .verify_signature_at(&header, body, 1_700_000_010)
            .is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let svc = service(Some("whsec"));
        let header = sign("whsec", 1_700_000_000, b"original");

        let result = svc.verify_signature_at(&header, b"tampered", 1_700_000_010);
        assert!(matches!(result, Err(ServiceError::Unauthorized(_))));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let svc = service(Some("whsec"));
        let body = b"{}";
        let header = sign("whsec", 1_700_000_000, body);

        let result = svc.verify_signature_at(&header, body, 1_700_000_000 + 301);
        assert!(matches!(result, Err(ServiceError::Unauthorized(_))));
    }

    #[test]
    fn missing_secret_fails_closed() {
        let svc = service(None);
        let result = svc.verify_signature_at("t=1,v1=00", b"{}", 1);
        assert!(matches!(result, Err(ServiceError::Unauthorized(_))));
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(parse_signature_header("v1=abc").is_err());
        assert!(parse_signature_header("t=notanumber,v1=abc").is_err());
        assert!(parse_signature_header("").is_err());
        assert!(parse_signature_header("t=12,v1=ff").is_ok());
    }

    #[test]
    fn session_accessors_map_provider_fields() {
        let body = serde_json::json!({
            "type": CHECKOUT_COMPLETED,
            "data": { "object": {
                "id": "cs_123",
                "payment_intent": "pi_456",
                "metadata": { "order_id": "7f8ad1de-0e51-4b42-9fbd-8b0a8dc75ea1" },
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
        });

        let event: CheckoutWebhookEvent =
            serde_json::from_slice(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(event.event_type, CHECKOUT_COMPLETED);

        let session = event.data.object;
        assert_eq!(
            session.order_id().unwrap().to_string(),
            "7f8ad1de-0e51-4b42-9fbd-8b0a8dc75ea1"
        );
        // The shipping name wins over the billing name.
        assert_eq!(session.customer().unwrap().name, "Ada Lovelace");
        assert_eq!(session.payment_intent_id().unwrap(), "pi_456");
        assert_eq!(session.shipping_address().unwrap().country_code, "GB");
    }

    #[test]
    fn minor_unit_conversion() {
        assert_eq!(to_minor_units(dec!(40.00)).unwrap(), 4000);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
        assert!(to_minor_units(dec!(0.001)).is_err());
    }
}
