use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackAck {
    pub received: bool,
}

/// Fulfillment provider status callback. The raw payload is stored on the
/// order for later inspection; it never drives a status transition.
#[utoipa::path(
    post,
    path = "/callbacks/{order_id}",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Callback stored", body = CallbackAck),
        (status = 404, description = "Order not found")
    ),
    tag = "callbacks"
)]
#[instrument(skip(state, payload), fields(order_id = %order_id))]
pub async fn handle_callback(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<CallbackAck>, ServiceError> {
    state
        .services
        .orders
        .record_provider_callback(order_id, &payload)
        .await?;

    info!(%order_id, "fulfillment callback stored");
    Ok(Json(CallbackAck { received: true }))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/callbacks/:order_id", post(handle_callback))
}
