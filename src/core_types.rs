//! Core types used throughout the system
//!
//! Surrogate ids are `i64` so they map 1:1 onto PostgreSQL `BIGSERIAL`
//! columns without conversion. External-facing references are ULID based.

use std::fmt;
use std::str::FromStr;

/// User ID - primary key of `users_tb`.
pub type UserId = i64;

/// Product ID - primary key of `products_tb`.
pub type ProductId = i64;

/// Stock unit ID - primary key of `stock_units_tb`.
///
/// Allocation always walks units in ascending id order so concurrent
/// reservations lock rows in the same order.
pub type StockUnitId = i64;

/// Order ID - surrogate key of `orders_tb`
pub type OrderId = i64;

/// Deposit ID - surrogate key of `deposits_tb`
pub type DepositId = i64;

/// Fixed-point money. Never `f64`.
pub type Money = rust_decimal::Decimal;

/// Record reference - the human/gateway facing id of an order or deposit.
///
/// Format: `{prefix}-{ULID}`, e.g. `ORD-01HV5Q3W6Z4K8N2M9P7R1T0XYZ`.
/// The reference doubles as the idempotency key sent to the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef(String);

impl RecordRef {
    pub const ORDER_PREFIX: &'static str = "ORD";
    pub const DEPOSIT_PREFIX: &'static str = "DEP";

    /// Generate a new order reference
    pub fn new_order() -> Self {
        Self(format!("{}-{}", Self::ORDER_PREFIX, ulid::Ulid::new()))
    }

    /// Generate a new deposit reference
    pub fn new_deposit() -> Self {
        Self(format!("{}-{}", Self::DEPOSIT_PREFIX, ulid::Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_order(&self) -> bool {
        self.0.starts_with(Self::ORDER_PREFIX)
    }

    pub fn is_deposit(&self) -> bool {
        self.0.starts_with(Self::DEPOSIT_PREFIX)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when parsing a malformed reference
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid record reference: {0}")]
pub struct InvalidRef(pub String);

impl FromStr for RecordRef {
    type Err = InvalidRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s.split_once('-').ok_or_else(|| InvalidRef(s.to_string()))?;
        if prefix != Self::ORDER_PREFIX && prefix != Self::DEPOSIT_PREFIX {
            return Err(InvalidRef(s.to_string()));
        }
        ulid::Ulid::from_string(id).map_err(|_| InvalidRef(s.to_string()))?;
        Ok(Self(s.to_string()))
    }
}
