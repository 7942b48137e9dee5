//! Engine Error Types
//!
//! Losing a compare-and-swap race is not an error; it is reported through
//! [`TransitionOutcome`](crate::state_machine::TransitionOutcome).

use thiserror::Error;

use crate::core_types::ProductId;
use crate::payment::GatewayError;

/// Resource store failures. Any of these aborts the surrounding transaction.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("Unique constraint violated: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e
            && db.is_unique_violation()
        {
            return StoreError::Conflict(db.message().to_string());
        }
        StoreError::Database(e.to_string())
    }
}

/// Engine error taxonomy
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // === Validation Errors ===
    #[error("Quantity must be between 1 and {max}, got {got}")]
    InvalidQuantity { got: i32, max: i32 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Balance payment requires a registered user")]
    GuestBalancePayment,

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid payment method: {0:?}")]
    InvalidPaymentMethod(String),

    #[error("Admin token missing or invalid")]
    Unauthorized,

    // === Resource Errors ===
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Product {0} is not for sale")]
    ProductInactive(ProductId),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Deposit not found: {0}")]
    DepositNotFound(String),

    // === Business Errors ===
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i32,
        available: i64,
    },

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // === System Errors ===
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidQuantity { .. } => "INVALID_QUANTITY",
            EngineError::InvalidAmount(_) => "INVALID_AMOUNT",
            EngineError::GuestBalancePayment => "GUEST_BALANCE_PAYMENT",
            EngineError::InvalidReference(_) => "INVALID_REFERENCE",
            EngineError::InvalidPaymentMethod(_) => "INVALID_PAYMENT_METHOD",
            EngineError::Unauthorized => "UNAUTHORIZED",
            EngineError::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            EngineError::ProductInactive(_) => "PRODUCT_INACTIVE",
            EngineError::UserNotFound(_) => "USER_NOT_FOUND",
            EngineError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            EngineError::DepositNotFound(_) => "DEPOSIT_NOT_FOUND",
            EngineError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            EngineError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            EngineError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            EngineError::Gateway(_) => "GATEWAY_UNAVAILABLE",
            EngineError::Store(_) => "STORE_ERROR",
        }
    }

    /// HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidQuantity { .. }
            | EngineError::InvalidAmount(_)
            | EngineError::GuestBalancePayment
            | EngineError::InvalidReference(_)
            | EngineError::InvalidPaymentMethod(_) => 400,
            EngineError::Unauthorized => 401,
            EngineError::ProductNotFound(_)
            | EngineError::UserNotFound(_)
            | EngineError::OrderNotFound(_)
            | EngineError::DepositNotFound(_) => 404,
            EngineError::InvalidStateTransition(_) => 409,
            EngineError::ProductInactive(_)
            | EngineError::InsufficientStock { .. }
            | EngineError::InsufficientBalance => 422,
            EngineError::Store(_) => 500,
            EngineError::Gateway(_) => 503,
        }
    }

    /// Worth retrying on the next tick without any state change
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Gateway(_) | EngineError::Store(_) | EngineError::InsufficientBalance
        )
    }
}
