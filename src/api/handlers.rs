//! HTTP handlers
//!
//! Thin adapters over [`ShopEngine`](crate::engine::ShopEngine): extract,
//! call, wrap. Admin routes check `X-Admin-Token`.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use constant_time_eq::constant_time_eq;

use super::state::AppState;
use super::types::{
    ApiError, ApiResponse, ApiResult, CallbackData, CreateDepositBody, CreateOrderBody,
    DepositData, HealthResponse, ImportStockBody, ImportStockData, OrderData,
    PaymentCallbackBody, StockCountsData, error_codes, ok, parse_amount,
};
use crate::core_types::ProductId;
use crate::engine::{CreateDepositRequest, CreateOrderRequest};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::unauthorized());
    };
    match headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        Some(given) if constant_time_eq(given.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            tracing::warn!("Rejected admin request: bad or missing token");
            Err(ApiError::unauthorized())
        }
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Create an order and reserve its stock
///
/// POST /api/v1/orders
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderBody,
    responses(
        (status = 200, description = "Order created (balance orders return already settled)", body = OrderData),
        (status = 400, description = "Invalid quantity or payment method"),
        (status = 404, description = "Product or user not found"),
        (status = 422, description = "Insufficient stock or balance"),
        (status = 503, description = "Payment gateway unavailable")
    ),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateOrderBody>,
) -> ApiResult<OrderData> {
    let order = state
        .engine
        .create_order(CreateOrderRequest {
            product_id: body.product_id,
            quantity: body.quantity,
            payment_method: body.payment_method,
            user_id: body.user_id,
            start_poller: true,
        })
        .await?;
    ok(OrderData::from(&order))
}

/// GET /api/v1/orders/{order_ref}
#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_ref}",
    params(("order_ref" = String, Path, description = "Order reference (ORD-{ULID})")),
    responses(
        (status = 200, description = "Order status", body = OrderData),
        (status = 400, description = "Malformed reference"),
        (status = 404, description = "Order not found")
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_ref): Path<String>,
) -> ApiResult<OrderData> {
    let order = state.engine.get_order_status(&order_ref).await?;
    ok(OrderData::from(&order))
}

/// Admin: release a pending order's reservation
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_ref}/cancel",
    params(("order_ref" = String, Path, description = "Order reference")),
    responses(
        (status = 200, description = "Order cancelled, stock released", body = OrderData),
        (status = 401, description = "Admin token missing or invalid"),
        (status = 409, description = "Order is not pending")
    ),
    security(("admin_token" = [])),
    tag = "Admin"
)]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_ref): Path<String>,
) -> ApiResult<OrderData> {
    require_admin(&state, &headers)?;
    let order = state.engine.cancel_reservation(&order_ref).await?;
    ok(OrderData::from(&order))
}

/// Admin: refund a successful order to the buyer's balance
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_ref}/refund",
    params(("order_ref" = String, Path, description = "Order reference")),
    responses(
        (status = 200, description = "Order refunded", body = OrderData),
        (status = 401, description = "Admin token missing or invalid"),
        (status = 409, description = "Order is not in SUCCESS")
    ),
    security(("admin_token" = [])),
    tag = "Admin"
)]
pub async fn refund_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_ref): Path<String>,
) -> ApiResult<OrderData> {
    require_admin(&state, &headers)?;
    let order = state.engine.refund_order(&order_ref).await?;
    ok(OrderData::from(&order))
}

// ============================================================================
// Deposits
// ============================================================================

/// POST /api/v1/deposits
#[utoipa::path(
    post,
    path = "/api/v1/deposits",
    request_body = CreateDepositBody,
    responses(
        (status = 200, description = "Deposit created", body = DepositData),
        (status = 400, description = "Amount out of range or bad channel"),
        (status = 404, description = "User not found"),
        (status = 503, description = "Payment gateway unavailable")
    ),
    tag = "Deposits"
)]
pub async fn create_deposit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDepositBody>,
) -> ApiResult<DepositData> {
    let amount = parse_amount(&body.amount)?;
    let deposit = state
        .engine
        .create_deposit(CreateDepositRequest {
            user_id: body.user_id,
            amount,
            channel: body.channel,
            start_poller: true,
        })
        .await?;
    ok(DepositData::from(&deposit))
}

/// GET /api/v1/deposits/{deposit_ref}
#[utoipa::path(
    get,
    path = "/api/v1/deposits/{deposit_ref}",
    params(("deposit_ref" = String, Path, description = "Deposit reference (DEP-{ULID})")),
    responses(
        (status = 200, description = "Deposit status", body = DepositData),
        (status = 404, description = "Deposit not found")
    ),
    tag = "Deposits"
)]
pub async fn get_deposit(
    State(state): State<Arc<AppState>>,
    Path(deposit_ref): Path<String>,
) -> ApiResult<DepositData> {
    let deposit = state.engine.get_deposit_status(&deposit_ref).await?;
    ok(DepositData::from(&deposit))
}

// ============================================================================
// Stock
// ============================================================================

/// Admin: import codes for a product
#[utoipa::path(
    post,
    path = "/api/v1/products/{id}/stock",
    params(("id" = i64, Path, description = "Product id")),
    request_body = ImportStockBody,
    responses(
        (status = 200, description = "Codes imported", body = ImportStockData),
        (status = 401, description = "Admin token missing or invalid"),
        (status = 404, description = "Product not found")
    ),
    security(("admin_token" = [])),
    tag = "Admin"
)]
pub async fn import_stock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(product_id): Path<ProductId>,
    Json(body): Json<ImportStockBody>,
) -> ApiResult<ImportStockData> {
    require_admin(&state, &headers)?;
    let inserted = state.engine.import_stock(product_id, &body.codes).await?;
    ok(ImportStockData {
        product_id,
        submitted: body.codes.len(),
        inserted,
    })
}

/// GET /api/v1/products/{id}/stock
#[utoipa::path(
    get,
    path = "/api/v1/products/{id}/stock",
    params(("id" = i64, Path, description = "Product id")),
    responses(
        (status = 200, description = "Unit counts by status", body = StockCountsData),
        (status = 404, description = "Product not found")
    ),
    tag = "Stock"
)]
pub async fn get_stock(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<ProductId>,
) -> ApiResult<StockCountsData> {
    let counts = state.engine.stock_counts(product_id).await?;
    ok(StockCountsData::new(product_id, counts))
}

// ============================================================================
// Callbacks / System
// ============================================================================

/// Provider payment notification.
///
/// The body is not trusted: it only names a record, which is then
/// reconciled against the gateway.
#[utoipa::path(
    post,
    path = "/api/v1/callbacks/payment",
    request_body = PaymentCallbackBody,
    responses(
        (status = 200, description = "Record reconciled", body = CallbackData),
        (status = 400, description = "Malformed reference"),
        (status = 404, description = "Record not found"),
        (status = 503, description = "Gateway check failed; retry later")
    ),
    tag = "Callbacks"
)]
pub async fn payment_callback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PaymentCallbackBody>,
) -> ApiResult<CallbackData> {
    let outcome = state
        .engine
        .handle_payment_callback(&body.reference)
        .await?;
    ok(CallbackData {
        reference: body.reference,
        outcome: outcome.as_str().to_string(),
    })
}

/// Health check
///
/// - Healthy: 200 OK + {code: 0, data: {timestamp_ms}}
/// - Unhealthy: 503 + {code: 5001, msg: "unavailable"}
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Service unavailable")
    ),
    tag = "System"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    if let Some(db) = &state.db
        && let Err(e) = db.health_check().await
    {
        tracing::error!(error = %e, "Health check: database unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse {
                code: error_codes::SERVICE_UNAVAILABLE,
                msg: "unavailable".to_string(),
                data: None,
            }),
        );
    }

    (
        StatusCode::OK,
        Json(ApiResponse::success(HealthResponse {
            timestamp_ms: Utc::now().timestamp_millis(),
        })),
    )
}
