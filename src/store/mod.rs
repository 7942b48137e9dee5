//! Resource Store
//!
//! Two seams:
//! - [`ResourceStore`]: pooled, auto-committed reads and single-statement writes
//! - [`StoreTx`]: one open transaction. Nothing written through it is visible
//!   to anyone else until [`StoreTx::commit`]; dropping it rolls back.
//!
//! Every multi-step mutation (reservation, state transitions) goes through a
//! `StoreTx`, so the business logic in [`crate::reservation`] and
//! [`crate::state_machine`] is written once for every backend.
//!
//! # Backends
//! - [`PgStore`]: PostgreSQL. Row locks (`FOR UPDATE SKIP LOCKED`) and
//!   conditional `UPDATE … WHERE status = $expected` provide per-record
//!   serialization across processes.
//! - [`MemoryStore`]: one async mutex around the whole state; a transaction
//!   holds it from `begin` to commit/drop. For tests and local development.

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core_types::{DepositId, Money, OrderId, ProductId, StockUnitId, UserId};
use crate::error::StoreError;
use crate::models::{
    Deposit, DepositStatus, NewDeposit, NewOrder, Order, OrderStatus, PaymentInstructions,
    Product, Role, StockCounts, StockStatus, StockUnit, User,
};

/// One open store transaction
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, StoreError>;

    async fn insert_deposit(&mut self, deposit: &NewDeposit) -> Result<Deposit, StoreError>;

    /// Compare-and-swap the order status.
    ///
    /// Locks the row, re-reads its status and writes `to` only if it still
    /// equals `from`. Returns the updated row, or `None` if the status had
    /// already moved (or the order does not exist).
    async fn transition_order(
        &mut self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Order>, StoreError>;

    /// Compare-and-swap the deposit status. Same contract as [`Self::transition_order`].
    async fn transition_deposit(
        &mut self,
        id: DepositId,
        from: DepositStatus,
        to: DepositStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Deposit>, StoreError>;

    /// Lock up to `limit` READY units of a product, ascending id, skipping
    /// rows already locked by concurrent transactions.
    async fn lock_ready_units(
        &mut self,
        product_id: ProductId,
        limit: i64,
    ) -> Result<Vec<StockUnit>, StoreError>;

    /// Set status / buyer on the given units. Returns rows affected.
    async fn set_unit_status(
        &mut self,
        unit_ids: &[StockUnitId],
        status: StockStatus,
        sold_to: Option<UserId>,
    ) -> Result<u64, StoreError>;

    async fn insert_reservations(
        &mut self,
        order_id: OrderId,
        unit_ids: &[StockUnitId],
    ) -> Result<(), StoreError>;

    /// Units referenced by the order's reservation queue entries, ascending id
    async fn reserved_units(&mut self, order_id: OrderId) -> Result<Vec<StockUnit>, StoreError>;

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64, StoreError>;

    async fn set_assigned_codes(
        &mut self,
        order_id: OrderId,
        codes: &[String],
    ) -> Result<(), StoreError>;

    /// Re-arm notification, e.g. after a refund
    async fn reset_order_notified(&mut self, order_id: OrderId) -> Result<(), StoreError>;

    /// `balance = balance + amount`, evaluated by the store. `false` if no such user.
    async fn credit_balance(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError>;

    /// `balance = balance - amount WHERE balance >= amount`, evaluated by the
    /// store. `false` if the user is missing or the balance is insufficient.
    async fn debit_balance(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store entry point
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    // === Users / Products / Stock ===

    async fn create_user(&self, role: Role, balance: Money) -> Result<User, StoreError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn create_product(&self, name: &str, price: Money) -> Result<Product, StoreError>;

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Insert READY units. Codes already present for the product are skipped.
    /// Returns the number of units actually inserted.
    async fn import_stock(&self, product_id: ProductId, codes: &[String])
    -> Result<u64, StoreError>;

    async fn stock_counts(&self, product_id: ProductId) -> Result<StockCounts, StoreError>;

    async fn stock_units(&self, product_id: ProductId) -> Result<Vec<StockUnit>, StoreError>;

    // === Orders ===

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn get_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>, StoreError>;

    /// Pending orders, earliest deadline first
    async fn pending_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError>;

    /// Pending orders with `expired_at <= now`
    async fn overdue_orders(&self, now: DateTime<Utc>, limit: i64)
    -> Result<Vec<Order>, StoreError>;

    /// Terminal orders whose notification has not been acknowledged
    async fn unnotified_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError>;

    /// `is_notified: false → true`, only while the order is still in the
    /// status the delivered notification described. Returns whether this call
    /// flipped it.
    async fn mark_order_notified(
        &self,
        id: OrderId,
        announced: OrderStatus,
    ) -> Result<bool, StoreError>;

    async fn set_order_payment(
        &self,
        id: OrderId,
        payment: &PaymentInstructions,
    ) -> Result<(), StoreError>;

    // === Deposits ===

    async fn get_deposit(&self, id: DepositId) -> Result<Option<Deposit>, StoreError>;

    async fn get_deposit_by_ref(&self, deposit_ref: &str) -> Result<Option<Deposit>, StoreError>;

    async fn pending_deposits(&self, limit: i64) -> Result<Vec<Deposit>, StoreError>;

    async fn overdue_deposits(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Deposit>, StoreError>;

    async fn unnotified_deposits(&self, limit: i64) -> Result<Vec<Deposit>, StoreError>;

    async fn mark_deposit_notified(
        &self,
        id: DepositId,
        announced: DepositStatus,
    ) -> Result<bool, StoreError>;

    async fn set_deposit_payment(
        &self,
        id: DepositId,
        payment: &PaymentInstructions,
    ) -> Result<(), StoreError>;
}
