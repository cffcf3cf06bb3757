/*!
 * printworks-api: order fulfillment pipeline for a photo-sales storefront.
 *
 * Baskets are re-priced against the quote API, captured through a hosted
 * checkout, approved per the configured policy, and handed to the print
 * provider through an at-least-once message channel.
 */

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod http_client;
pub mod message_queue;
pub mod migrator;
pub mod models;
pub mod openapi;
pub mod retry;
pub mod services;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::handlers::AppServices;
use crate::message_queue::MessageQueue;

/// Shared application state injected into every handler.
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub services: AppServices,
    pub events: EventSender,
    pub queue: Arc<dyn MessageQueue>,
}

/// Builds the full application router.
pub fn app_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(handlers::checkout::routes())
        .merge(handlers::orders::routes())
        .merge(handlers::payment_webhooks::routes())
        .merge(handlers::preferences::routes());

    Router::new()
        .nest("/api/v1", api)
        .merge(handlers::callbacks::routes())
        .merge(handlers::health::routes())
        .merge(openapi::swagger())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
