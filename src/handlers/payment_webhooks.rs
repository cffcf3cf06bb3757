use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::services::payments::{CHECKOUT_COMPLETED, SIGNATURE_HEADER};
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

/// Signature-verified payment provider events.
///
/// Delivery is at-least-once; replays of a completed-checkout event are
/// benign no-ops because `confirm_payment` only transitions once.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body(content = String, description = "Raw provider event; verified against the signature header"),
    responses(
        (status = 200, description = "Event processed or ignored", body = WebhookAck),
        (status = 401, description = "Signature verification failed"),
        (status = 400, description = "Malformed event payload")
    ),
    tag = "payments"
)]
#[instrument(skip(state, headers, body))]
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let services = &state.services;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("missing signature header".to_string()))?;

    services.payments.verify_signature(signature, &body)?;

    let event = services.payments.parse_event(&body)?;
    if event.event_type != CHECKOUT_COMPLETED {
        info!(event_type = %event.event_type, "ignoring event type");
        return Ok(Json(WebhookAck { received: true }));
    }

    let session = event.data.object;
    let order_id = session.order_id()?;
    let customer = session.customer()?;
    let address = session.shipping_address()?;
    let payment_intent_id = session.payment_intent_id()?.to_string();

    let transitioned = services
        .orders
        .confirm_payment(order_id, customer, address, &payment_intent_id)
        .await?;

    if !transitioned {
        warn!(%order_id, "duplicate completed-checkout delivery");
        return Ok(Json(WebhookAck { received: true }));
    }

    // Approval decisioning runs only on the delivery that performed the
    // transition. A failure here leaves the order awaiting manual approval;
    // the payment itself is already recorded, so the provider must not retry.
    match services.orders.should_auto_approve(order_id).await {
        Ok(true) => {
            if let Err(err) = services.orders.approve_order(order_id, true).await {
                error!(%order_id, error = %err, "auto-approval failed; order left awaiting approval");
            }
        }
        Ok(false) => {
            info!(%order_id, "order awaiting manual approval");
        }
        Err(err) => {
            error!(%order_id, error = %err, "approval decision failed; order left awaiting approval");
        }
    }

    Ok(Json(WebhookAck { received: true }))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/payments/webhook", post(handle_webhook))
}
