use axum::{extract::State, routing::post, Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::Basket;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub basket: Basket,
    /// Privileged callers pay production cost with no markup
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub checkout_url: String,
    pub total_cost: Decimal,
    pub currency: String,
}

/// Quote the basket, persist it as an order, open a hosted checkout session,
/// and re-sync the persisted costs to the verified quote.
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Invalid basket"),
        (status = 502, description = "Quote or payment provider unavailable")
    ),
    tag = "checkout"
)]
#[instrument(skip(state, request), fields(items = request.basket.items.len()))]
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ServiceError> {
    let services = &state.services;

    // Client prices are a snapshot; the quote is the price of record.
    let priced = services
        .pricing
        .quote_basket(&request.basket, request.privileged)
        .await?;

    let order_id = services.orders.create_order(&priced).await?;

    let session = services
        .payments
        .create_checkout_session(order_id, &priced)
        .await?;

    // Guard against any drift between quoting and session creation.
    let mut committed = priced;
    committed.order_id = Some(order_id);
    services.orders.update_order_costs(&committed).await?;

    info!(%order_id, session_id = %session.id, "checkout session created");

    Ok(Json(CheckoutResponse {
        order_id,
        checkout_url: session.url,
        total_cost: committed.total_cost(),
        currency: state.config.currency_code.clone(),
    }))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/checkout", post(create_checkout))
}
