/*!
 * Price verification against the external quote API.
 *
 * Client-side basket prices are treated as untrusted snapshots; the quoted
 * production cost plus the configured markup is the price of record.
 */

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{instrument, warn};

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::http_client::{ApiAuth, ApiClient};
use crate::models::{Basket, BasketItem};

const DEFAULT_PRINT_AREA: &str = "default";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteRequest {
    shipping_method: String,
    destination_country_code: String,
    currency_code: String,
    items: Vec<QuoteRequestItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteRequestItem {
    sku: String,
    copies: u32,
    attributes: HashMap<String, String>,
    assets: Vec<QuoteAsset>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteAsset {
    print_area: String,
}

/// Quote API verdict. Anything we do not recognize is treated as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum QuoteOutcome {
    Created,
    CreatedWithIssues,
    #[serde(other)]
    Unrecognized,
}

impl QuoteOutcome {
    fn is_usable(self) -> bool {
        matches!(self, QuoteOutcome::Created | QuoteOutcome::CreatedWithIssues)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    outcome: QuoteOutcome,
    quotes: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Quote {
    cost_summary: CostSummary,
    items: Vec<QuotedItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CostSummary {
    shipping: Money,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotedItem {
    sku: String,
    #[serde(default)]
    copies: Option<u32>,
    unit_cost: Money,
    #[serde(default)]
    tax_unit_cost: Option<Money>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Money {
    amount: Decimal,
}

/// Quote-backed pricing engine.
#[derive(Clone)]
pub struct PricingService {
    client: ApiClient,
    currency_code: String,
    destination_country_code: String,
}

impl PricingService {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = ApiClient::new(
            "quote-api",
            config.quote_api_uri.clone(),
            ApiAuth::ApiKey(config.quote_api_key.clone()),
            &config.http,
        )?;

        Ok(Self {
            client,
            currency_code: config.currency_code.clone(),
            destination_country_code: config.destination_country_code.clone(),
        })
    }

    /// Re-prices every line of the basket from a fresh quote and overwrites
    /// the shipping cost from the quote's cost summary. On any failure the
    /// caller's basket is left untouched.
    ///
    /// `privileged` callers pay production cost with no markup applied.
    #[instrument(skip(self, basket), fields(items = basket.items.len()))]
    pub async fn quote_basket(
        &self,
        basket: &Basket,
        privileged: bool,
    ) -> Result<Basket, ServiceError> {
        let request = QuoteRequest {
            shipping_method: basket.shipping_method.clone(),
            destination_country_code: self.destination_country_code.clone(),
            currency_code: self.currency_code.clone(),
            items: basket
                .items
                .iter()
                .map(|item| QuoteRequestItem {
                    sku: item.sku.clone(),
                    copies: 1,
                    attributes: item.attributes.clone(),
                    assets: vec![QuoteAsset {
                        print_area: DEFAULT_PRINT_AREA.to_string(),
                    }],
                })
                .collect(),
        };

        let response: QuoteResponse = self.client.post_json("quotes", &request).await?;

        if !response.outcome.is_usable() {
            return Err(ServiceError::ExternalApiError(
                "quote-api: quote was not created".to_string(),
            ));
        }

        let quote = response.quotes.first().ok_or_else(|| {
            ServiceError::ExternalApiError("quote-api: response contained no quotes".to_string())
        })?;

        let mut priced = basket.clone();
        for item in &mut priced.items {
            let quoted = quote
                .items
                .iter()
                .find(|q| q.sku == item.sku)
                .ok_or_else(|| {
                    ServiceError::ExternalApiError(format!(
                        "quote-api: no quote line for sku {}",
                        item.sku
                    ))
                })?;

            let new_total = priced_line_total(item, quoted, privileged);
            if new_total != item.total {
                warn!(
                    sku = %item.sku,
                    submitted = %item.total,
                    quoted = %new_total,
                    "basket price differs from quoted price; overwriting"
                );
            }
            item.total = new_total;
        }

        priced.shipping_cost = quote.cost_summary.shipping.amount;

        Ok(priced)
    }
}

/// `(unit + tax_unit) * (1 + markup/100) * quantity`, with markup forced to
/// zero for privileged callers.
fn priced_line_total(item: &BasketItem, quoted: &QuotedItem, privileged: bool) -> Decimal {
    let unit = quoted.unit_cost.amount
        + quoted
            .tax_unit_cost
            .as_ref()
            .map(|m| m.amount)
            .unwrap_or_default();

    let markup = if privileged {
        Decimal::ZERO
    } else {
        item.markup_percentage
    };
    let multiplier = Decimal::ONE + markup / Decimal::from(100);

    // Quote lines carry copies=1; quantity is applied here.
    let copies = Decimal::from(quoted.copies.unwrap_or(1).max(1));
    (unit * multiplier * copies * Decimal::from(item.quantity)).round_dp(2)
}
