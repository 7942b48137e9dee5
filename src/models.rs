//! Persisted entities and their status enums
//!
//! Status enums follow the SMALLINT id convention: non-negative ids are the
//! happy path, negative ids are failure terminals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{DepositId, Money, OrderId, ProductId, StockUnitId, UserId};

// ============================================================================
// Status enums
// ============================================================================

/// Order lifecycle
///
/// ```text
/// PENDING ──paid──▶ SUCCESS ──refund──▶ REFUND
///    │
///    ├──declined──▶ FAILED
///    └──deadline──▶ EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum OrderStatus {
    Pending = 0,
    Success = 10,
    Refund = 20,
    Failed = -10,
    Expired = -20,
}

impl OrderStatus {
    /// Terminal for reconciliation: the gateway can no longer change it.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::Pending),
            10 => Some(OrderStatus::Success),
            20 => Some(OrderStatus::Refund),
            -10 => Some(OrderStatus::Failed),
            -20 => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Success => "SUCCESS",
            OrderStatus::Refund => "REFUND",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deposit (wallet top-up) lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum DepositStatus {
    Pending = 0,
    Success = 10,
    Failed = -10,
    Expired = -20,
}

impl DepositStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DepositStatus::Pending)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(DepositStatus::Pending),
            10 => Some(DepositStatus::Success),
            -10 => Some(DepositStatus::Failed),
            -20 => Some(DepositStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "PENDING",
            DepositStatus::Success => "SUCCESS",
            DepositStatus::Failed => "FAILED",
            DepositStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stock unit lifecycle: READY ⇄ RESERVED → SOLD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum StockStatus {
    Ready = 0,
    Reserved = 1,
    Sold = 2,
}

impl StockStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(StockStatus::Ready),
            1 => Some(StockStatus::Reserved),
            2 => Some(StockStatus::Sold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Ready => "READY",
            StockStatus::Reserved => "RESERVED",
            StockStatus::Sold => "SOLD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum Role {
    Member = 1,
    Admin = 2,
}

impl Role {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Role::Member),
            2 => Some(Role::Admin),
            _ => None,
        }
    }
}

/// How an order is paid.
///
/// Stored as text: `BALANCE` or the gateway channel code (e.g. `QRIS`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    /// Debit the buyer's wallet balance; no gateway involved
    Balance,
    /// Pay through the external gateway using this channel code
    Gateway(String),
}

impl PaymentMethod {
    pub const BALANCE: &'static str = "BALANCE";

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(Self::BALANCE) {
            PaymentMethod::Balance
        } else {
            PaymentMethod::Gateway(trimmed.to_uppercase())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Balance => Self::BALANCE,
            PaymentMethod::Gateway(channel) => channel,
        }
    }

    /// Gateway channel code, `None` for balance payments
    pub fn channel(&self) -> Option<&str> {
        match self {
            PaymentMethod::Balance => None,
            PaymentMethod::Gateway(channel) => Some(channel),
        }
    }

    pub fn is_balance(&self) -> bool {
        matches!(self, PaymentMethod::Balance)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub balance: Money,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StockUnit {
    pub id: StockUnitId,
    pub product_id: ProductId,
    /// Opaque secret handed to the buyer. Never logged.
    pub code: String,
    pub status: StockStatus,
    pub sold_to: Option<UserId>,
}

/// Payment instructions returned by the gateway when a charge is created.
///
/// Persisted verbatim for display by front-ends; the engine never interprets
/// these fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstructions {
    /// What the payer is asked to pay (fees included)
    pub amount_charged: Option<Money>,
    /// What the merchant receives after fees
    pub amount_received: Option<Money>,
    pub qr_payload: Option<String>,
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub order_ref: String,
    /// `None` for guest checkout
    pub user_id: Option<UserId>,
    pub product_id: ProductId,
    pub quantity: i32,
    pub price: Money,
    pub total_amount: Money,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub expired_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_notified: bool,
    /// Codes delivered to the buyer, ascending unit id. Empty until SUCCESS.
    pub assigned_codes: Vec<String>,
    pub payment: PaymentInstructions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Still pending but past its deadline
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && self.expired_at <= now
    }
}

/// Insert payload for a pending order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_ref: String,
    pub user_id: Option<UserId>,
    pub product_id: ProductId,
    pub quantity: i32,
    pub price: Money,
    pub total_amount: Money,
    pub payment_method: PaymentMethod,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deposit {
    pub id: DepositId,
    pub deposit_ref: String,
    pub user_id: UserId,
    /// Credited to the wallet on success, exactly once
    pub amount: Money,
    pub channel: String,
    pub status: DepositStatus,
    pub expired_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_notified: bool,
    pub payment: PaymentInstructions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == DepositStatus::Pending && self.expired_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub deposit_ref: String,
    pub user_id: UserId,
    pub amount: Money,
    pub channel: String,
    pub expired_at: DateTime<Utc>,
}

/// Per-product unit counts. `total()` is invariant under Reserve/Release/Promote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StockCounts {
    pub ready: i64,
    pub reserved: i64,
    pub sold: i64,
}

impl StockCounts {
    pub fn total(&self) -> i64 {
        self.ready + self.reserved + self.sold
    }
}
