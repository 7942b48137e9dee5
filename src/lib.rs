//! Code Vault - digital code storefront engine
//!
//! Sells single-use digital codes. Stock is reserved at checkout, payment is
//! reconciled against an external gateway, and buyers are notified exactly
//! once per terminal outcome.
//!
//! # Modules
//!
//! - [`core_types`] - Id aliases, `Money`, record references
//! - [`models`] - Orders, deposits, stock units and their status enums
//! - [`store`] - Resource store seam (PostgreSQL and in-memory backends)
//! - [`reservation`] - Reserve / release / promote stock units
//! - [`state_machine`] - Compare-and-swap status transitions
//! - [`payment`] - Payment gateway client
//! - [`reconcile`] - Pollers, periodic sweep and expiry
//! - [`notify`] - Notification channels and dispatcher
//! - [`engine`] - `ShopEngine` facade
//! - [`api`] - HTTP API and OpenAPI docs

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub mod payment;
pub mod reservation;
pub mod state_machine;
pub mod store;

pub mod engine;
pub mod notify;
pub mod reconcile;

pub mod api;

// Convenient re-exports at crate root
pub use core_types::{DepositId, Money, OrderId, ProductId, RecordRef, StockUnitId, UserId};
pub use engine::{CreateDepositRequest, CreateOrderRequest, ShopEngine};
pub use error::{EngineError, StoreError};
pub use models::{
    Deposit, DepositStatus, Order, OrderStatus, PaymentMethod, StockCounts, StockStatus,
};
pub use reconcile::{ReconcileOutcome, Reconciler, SweepReport, Sweeper};
pub use state_machine::TransitionOutcome;
pub use store::{MemoryStore, PgStore, ResourceStore, StoreTx};
