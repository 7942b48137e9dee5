//! API request/response types and error codes
//!
//! - `ApiResponse<T>`: unified response wrapper
//! - `ApiError`: engine errors mapped onto HTTP status + numeric code
//! - Request and response DTOs. Money travels as decimal strings, timestamps
//!   as epoch milliseconds.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;

use crate::core_types::{Money, ProductId, UserId};
use crate::error::EngineError;
use crate::models::{Deposit, Order, OrderStatus, PaymentInstructions, StockCounts};

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    #[schema(example = 0)]
    pub code: i32,
    #[schema(example = "ok")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Standard API error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INSUFFICIENT_BALANCE: i32 = 1002;
    pub const INSUFFICIENT_STOCK: i32 = 1003;
    pub const INVALID_STATE: i32 = 1004;
    pub const PRODUCT_UNAVAILABLE: i32 = 1005;

    // Auth errors (2xxx)
    pub const AUTH_FAILED: i32 = 2002;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn unauthorized() -> Self {
        EngineError::Unauthorized.into()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match &e {
            EngineError::InsufficientBalance => error_codes::INSUFFICIENT_BALANCE,
            EngineError::InsufficientStock { .. } => error_codes::INSUFFICIENT_STOCK,
            EngineError::InvalidStateTransition(_) => error_codes::INVALID_STATE,
            EngineError::ProductInactive(_) => error_codes::PRODUCT_UNAVAILABLE,
            EngineError::Unauthorized => error_codes::AUTH_FAILED,
            EngineError::ProductNotFound(_)
            | EngineError::UserNotFound(_)
            | EngineError::OrderNotFound(_)
            | EngineError::DepositNotFound(_) => error_codes::NOT_FOUND,
            EngineError::Gateway(_) => error_codes::SERVICE_UNAVAILABLE,
            EngineError::Store(_) => error_codes::INTERNAL_ERROR,
            _ => error_codes::INVALID_PARAMETER,
        };
        let msg = match &e {
            EngineError::Store(inner) => {
                tracing::error!(error = %inner, "Store failure behind API request");
                "internal error".to_string()
            }
            other => format!("{}: {}", other.code(), other),
        };
        Self { status, code, msg }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.code, self.msg))).into_response()
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateOrderBody {
    #[schema(example = 1)]
    pub product_id: ProductId,
    #[schema(example = 3)]
    pub quantity: i32,
    /// `BALANCE` or a gateway channel code
    #[schema(example = "QRIS")]
    pub payment_method: String,
    /// Omit for guest checkout
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateDepositBody {
    pub user_id: UserId,
    /// Decimal string
    #[schema(example = "50000")]
    pub amount: String,
    #[schema(example = "QRIS")]
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ImportStockBody {
    /// One code per entry; blanks and duplicates are skipped
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PaymentCallbackBody {
    /// Order or deposit reference the provider is reporting on
    #[schema(example = "ORD-01HV5Q3W6Z4K8N2M9P7R1T0XYZ")]
    pub reference: String,
}

/// Parse a decimal amount: plain digits with an optional fraction, positive
pub fn parse_amount(raw: &str) -> Result<Money, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('.') || raw.ends_with('.') {
        return Err(ApiError::bad_request(format!("invalid amount: {:?}", raw)));
    }
    let amount = Money::from_str(raw)
        .map_err(|e| ApiError::bad_request(format!("invalid amount {:?}: {}", raw, e)))?;
    if amount <= Money::ZERO {
        return Err(ApiError::bad_request("amount must be positive"));
    }
    Ok(amount)
}

// ============================================================================
// Responses
// ============================================================================

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentData {
    pub amount_charged: Option<String>,
    pub amount_received: Option<String>,
    pub qr_payload: Option<String>,
    pub checkout_url: Option<String>,
}

impl From<&PaymentInstructions> for PaymentData {
    fn from(p: &PaymentInstructions) -> Self {
        Self {
            amount_charged: p.amount_charged.map(|a| a.to_string()),
            amount_received: p.amount_received.map(|a| a.to_string()),
            qr_payload: p.qr_payload.clone(),
            checkout_url: p.checkout_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderData {
    #[schema(example = "ORD-01HV5Q3W6Z4K8N2M9P7R1T0XYZ")]
    pub order_ref: String,
    #[schema(example = "PENDING")]
    pub status: String,
    pub user_id: Option<UserId>,
    pub product_id: ProductId,
    pub quantity: i32,
    #[schema(example = "15000")]
    pub price: String,
    #[schema(example = "45000")]
    pub total_amount: String,
    pub payment_method: String,
    pub expired_at: i64,
    pub paid_at: Option<i64>,
    /// Delivered codes; present once the order is paid
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
    pub payment: PaymentData,
    pub created_at: i64,
}

impl From<&Order> for OrderData {
    fn from(o: &Order) -> Self {
        let codes = if o.status == OrderStatus::Success {
            o.assigned_codes.clone()
        } else {
            Vec::new()
        };
        Self {
            order_ref: o.order_ref.clone(),
            status: o.status.to_string(),
            user_id: o.user_id,
            product_id: o.product_id,
            quantity: o.quantity,
            price: o.price.to_string(),
            total_amount: o.total_amount.to_string(),
            payment_method: o.payment_method.to_string(),
            expired_at: millis(o.expired_at),
            paid_at: o.paid_at.map(millis),
            codes,
            payment: PaymentData::from(&o.payment),
            created_at: millis(o.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DepositData {
    #[schema(example = "DEP-01HV5Q3W6Z4K8N2M9P7R1T0XYZ")]
    pub deposit_ref: String,
    pub status: String,
    pub user_id: UserId,
    #[schema(example = "50000")]
    pub amount: String,
    pub channel: String,
    pub expired_at: i64,
    pub paid_at: Option<i64>,
    pub payment: PaymentData,
    pub created_at: i64,
}

impl From<&Deposit> for DepositData {
    fn from(d: &Deposit) -> Self {
        Self {
            deposit_ref: d.deposit_ref.clone(),
            status: d.status.to_string(),
            user_id: d.user_id,
            amount: d.amount.to_string(),
            channel: d.channel.clone(),
            expired_at: millis(d.expired_at),
            paid_at: d.paid_at.map(millis),
            payment: PaymentData::from(&d.payment),
            created_at: millis(d.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StockCountsData {
    pub product_id: ProductId,
    pub ready: i64,
    pub reserved: i64,
    pub sold: i64,
    pub total: i64,
}

impl StockCountsData {
    pub fn new(product_id: ProductId, counts: StockCounts) -> Self {
        Self {
            product_id,
            ready: counts.ready,
            reserved: counts.reserved,
            sold: counts.sold,
            total: counts.total(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ImportStockData {
    pub product_id: ProductId,
    pub submitted: usize,
    pub inserted: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CallbackData {
    pub reference: String,
    /// What the reconcile step did, e.g. `PAID` or `STILL_PENDING`
    #[schema(example = "PAID")]
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = 1703494800000_i64)]
    pub timestamp_ms: i64,
}
