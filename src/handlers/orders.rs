use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::entities::order::OrderStatus;
use crate::errors::ServiceError;
use crate::models::OrderDetails;
use crate::services::orders::{OrderFilter, OrderSort};
use crate::AppState;

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListOrdersQuery {
    /// Filter by lifecycle status
    pub status: Option<String>,
    /// Substring match on customer email
    pub email: Option<String>,
    /// Creation-date window in days (default 365)
    pub in_last_days: Option<i64>,
    /// `created_asc` or `created_desc` (default)
    pub sort: Option<String>,
    /// Hide abandoned checkouts
    pub exclude_payment_incomplete: Option<bool>,
}

impl ListOrdersQuery {
    fn into_filter(self) -> Result<OrderFilter, ServiceError> {
        let status = self
            .status
            .as_deref()
            .map(|s| {
                s.parse::<OrderStatus>()
                    .map_err(ServiceError::InvalidInput)
            })
            .transpose()?;

        let sort = match self.sort.as_deref() {
            None => OrderSort::default(),
            Some("created_asc") => OrderSort::CreatedAsc,
            Some("created_desc") => OrderSort::CreatedDesc,
            Some(other) => {
                return Err(ServiceError::InvalidInput(format!(
                    "unknown sort order: {other}"
                )));
            }
        };

        Ok(OrderFilter {
            status,
            email: self.email,
            in_last_days: self.in_last_days,
            sort,
            exclude_payment_incomplete: self.exclude_payment_incomplete.unwrap_or(false),
        })
    }
}

/// List orders matching the filter. An empty list is a successful response.
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Matching orders", body = [OrderDetails]),
        (status = 400, description = "Invalid filter")
    ),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<OrderDetails>>, ServiceError> {
    let filter = query.into_filter()?;
    let orders = state.services.orders.list_orders(&filter).await?;
    Ok(Json(orders))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order found", body = OrderDetails),
        (status = 404, description = "Order not found")
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetails>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
    Ok(Json(order))
}

/// Manually approve a paid order for production.
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/approve",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order approved", body = OrderDetails),
        (status = 400, description = "Order is not awaiting approval"),
        (status = 404, description = "Order not found")
    ),
    tag = "orders"
)]
pub async fn approve_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetails>, ServiceError> {
    state.services.orders.approve_order(id, false).await?;
    let order = state
        .services
        .orders
        .get_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
    Ok(Json(order))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order cancelled", body = OrderDetails),
        (status = 400, description = "Order is already terminal"),
        (status = 404, description = "Order not found")
    ),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetails>, ServiceError> {
    state.services.orders.cancel_order(id).await?;
    let order = state
        .services
        .orders
        .get_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
    Ok(Json(order))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/approve", post(approve_order))
        .route("/orders/:id/cancel", post(cancel_order))
}
