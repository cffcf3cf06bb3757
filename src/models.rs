use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::order::OrderStatus;

/// A shopping basket: priced intent, not yet committed to an order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct Basket {
    /// Set once the basket has been committed via order creation, so that a
    /// re-quote can be written back to the persisted order.
    pub order_id: Option<Uuid>,

    #[validate(length(min = 1, message = "Basket must contain at least one item"))]
    pub items: Vec<BasketItem>,

    #[validate(length(min = 1, message = "Shipping method is required"))]
    pub shipping_method: String,

    pub shipping_cost: Decimal,
}

impl Basket {
    pub fn items_cost(&self) -> Decimal {
        self.items.iter().map(|item| item.total).sum()
    }

    pub fn total_cost(&self) -> Decimal {
        self.items_cost() + self.shipping_cost
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct BasketItem {
    #[validate(length(min = 1, message = "SKU is required"))]
    pub sku: String,

    /// Image title shown on the checkout line item
    pub name: String,

    /// Source image the print is produced from
    pub image_url: String,

    #[validate(range(min = 1, message = "Quantity must be positive"))]
    pub quantity: i32,

    /// Selected product options (size, wrap, ...) as a flat map
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Merchant markup percentage configured for the product
    #[serde(default)]
    pub markup_percentage: Decimal,

    /// Line total (snapshot price; the quote is the source of truth)
    pub total: Decimal,
}

/// Delivery address in the fulfillment provider's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Address {
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub town_or_city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_or_county: Option<String>,
    pub postal_or_zip_code: String,
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CustomerDetails {
    pub name: String,
    pub email: String,
}

/// Read model for a persisted order, returned by lookups and listings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetails {
    pub id: Uuid,
    pub status: OrderStatus,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub items: Vec<OrderItemDetails>,
    pub items_cost: Decimal,
    pub shipping_cost: Decimal,
    pub total_cost: Decimal,
    pub currency: String,
    pub shipping_method: String,
    pub shipping_address: Option<Address>,
    pub payment_intent_id: Option<String>,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub fulfillment_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemDetails {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub image_url: String,
    pub quantity: i32,
    pub attributes: HashMap<String, String>,
    pub total: Decimal,
}

/// Snapshot published to the message channel when an order is approved.
/// Produced once per approval action; consumed at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderApprovedEvent {
    pub order_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub items: Vec<OrderItemDetails>,
    pub items_cost: Decimal,
    pub shipping_cost: Decimal,
    pub total_cost: Decimal,
    pub currency: String,
    pub shipping_method: String,
    pub shipping_address: Address,
    pub payment_intent_id: String,
    pub approved_at: DateTime<Utc>,
}

impl OrderApprovedEvent {
    /// Tag used as the message subject and `MessageType` property.
    pub const TYPE_NAME: &'static str = "OrderApprovedEvent";
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(total: Decimal) -> BasketItem {
        BasketItem {
            sku: "GLOBAL-CAN-16x20".into(),
            name: "Dusk over Holkham".into(),
            image_url: "https://images.test/holkham.jpg".into(),
            quantity: 1,
            attributes: HashMap::new(),
            markup_percentage: dec!(100),
            total,
        }
    }

    #[test]
    fn basket_costs_sum_items_and_shipping() {
        let basket = Basket {
            order_id: None,
            items: vec![item(dec!(40.00)), item(dec!(12.50))],
            shipping_method: "Standard".into(),
            shipping_cost: dec!(5.25),
        };

        assert_eq!(basket.items_cost(), dec!(52.50));
        assert_eq!(basket.total_cost(), dec!(57.75));
    }

    #[test]
    fn address_omits_empty_optional_lines() {
        let address = Address {
            line1: "1 Harbour Row".into(),
            line2: None,
            town_or_city: "Wells-next-the-Sea".into(),
            state_or_county: Some("Norfolk".into()),
            postal_or_zip_code: "NR23 1AB".into(),
            country_code: "GB".into(),
        };

        let json = serde_json::to_value(&address).unwrap();
        assert!(json.get("line2").is_none());
        assert_eq!(json["state_or_county"], "Norfolk");
    }
}
