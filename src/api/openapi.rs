//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use super::types::{
    CallbackData, CreateDepositBody, CreateOrderBody, DepositData, HealthResponse,
    ImportStockBody, ImportStockData, OrderData, PaymentCallbackBody, PaymentData,
    StockCountsData,
};

/// Shared-secret header for admin endpoints
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "admin_token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-Admin-Token",
                    "Admin token configured under `api.admin_token`",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Code Vault API",
        version = "0.1.0",
        description = "Digital code storefront: stock reservation, payment reconciliation and wallet deposits.",
        license(name = "MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::api::handlers::health_check,
        crate::api::handlers::create_order,
        crate::api::handlers::get_order,
        crate::api::handlers::cancel_order,
        crate::api::handlers::refund_order,
        crate::api::handlers::create_deposit,
        crate::api::handlers::get_deposit,
        crate::api::handlers::import_stock,
        crate::api::handlers::get_stock,
        crate::api::handlers::payment_callback,
    ),
    components(
        schemas(
            HealthResponse,
            CreateOrderBody,
            CreateDepositBody,
            ImportStockBody,
            PaymentCallbackBody,
            OrderData,
            DepositData,
            PaymentData,
            StockCountsData,
            ImportStockData,
            CallbackData,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Orders", description = "Checkout and order status"),
        (name = "Deposits", description = "Wallet top-ups"),
        (name = "Stock", description = "Stock availability"),
        (name = "Admin", description = "Operator endpoints (X-Admin-Token)"),
        (name = "Callbacks", description = "Payment provider notifications"),
        (name = "System", description = "Health checks")
    )
)]
pub struct ApiDoc;
