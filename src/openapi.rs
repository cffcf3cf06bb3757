use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::entities::order::OrderStatus;
use crate::entities::preferences::AutoApproveMode;
use crate::errors::ErrorResponse;
use crate::handlers;
use crate::models::{Address, Basket, BasketItem, CustomerDetails, OrderDetails, OrderItemDetails};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::checkout::create_checkout,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::orders::approve_order,
        handlers::orders::cancel_order,
        handlers::payment_webhooks::handle_webhook,
        handlers::callbacks::handle_callback,
        handlers::preferences::get_preferences,
        handlers::preferences::put_preferences,
        handlers::health::health,
    ),
    components(schemas(
        Basket,
        BasketItem,
        Address,
        CustomerDetails,
        OrderStatus,
        OrderDetails,
        OrderItemDetails,
        AutoApproveMode,
        ErrorResponse,
        handlers::checkout::CheckoutRequest,
        handlers::checkout::CheckoutResponse,
        handlers::payment_webhooks::WebhookAck,
        handlers::callbacks::CallbackAck,
        handlers::preferences::PreferencesBody,
        handlers::health::HealthResponse,
    )),
    tags(
        (name = "checkout", description = "Basket pricing and hosted checkout"),
        (name = "orders", description = "Order lifecycle"),
        (name = "payments", description = "Payment provider webhooks"),
        (name = "callbacks", description = "Fulfillment provider callbacks"),
        (name = "preferences", description = "Approval policy settings"),
        (name = "health", description = "Service health")
    ),
    info(
        title = "printworks-api",
        description = "Order fulfillment pipeline for a photo-sales storefront"
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at `/docs`.
pub fn swagger() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
