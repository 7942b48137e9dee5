//! In-memory resource store
//!
//! A transaction takes the state lock for its whole lifetime and mutates a
//! private copy; commit swaps the copy in. Transactions are therefore fully
//! serialized, which is stronger than the PostgreSQL backend's row locking.
//!
//! Do not call [`ResourceStore`] methods while holding a [`MemoryTx`] from the
//! same store: they wait on the same lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ResourceStore, StoreTx};
use crate::core_types::{DepositId, Money, OrderId, ProductId, StockUnitId, UserId};
use crate::error::StoreError;
use crate::models::{
    Deposit, DepositStatus, NewDeposit, NewOrder, Order, OrderStatus, PaymentInstructions,
    Product, Role, StockCounts, StockStatus, StockUnit, User,
};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    next_id: i64,
    users: BTreeMap<UserId, User>,
    products: BTreeMap<ProductId, Product>,
    units: BTreeMap<StockUnitId, StockUnit>,
    orders: BTreeMap<OrderId, Order>,
    deposits: BTreeMap<DepositId, Deposit>,
    /// unit_id -> order_id; a unit sits in at most one queue
    reservations: BTreeMap<StockUnitId, OrderId>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn sorted_orders<F>(&self, limit: i64, filter: F) -> Vec<Order>
    where
        F: Fn(&Order) -> bool,
    {
        let mut orders: Vec<Order> = self.orders.values().filter(|o| filter(o)).cloned().collect();
        orders.sort_by_key(|o| (o.expired_at, o.id));
        orders.truncate(limit.max(0) as usize);
        orders
    }

    fn sorted_deposits<F>(&self, limit: i64, filter: F) -> Vec<Deposit>
    where
        F: Fn(&Deposit) -> bool,
    {
        let mut deposits: Vec<Deposit> =
            self.deposits.values().filter(|d| filter(d)).cloned().collect();
        deposits.sort_by_key(|d| (d.expired_at, d.id));
        deposits.truncate(limit.max(0) as usize);
        deposits
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, StoreError> {
        if self.work.orders.values().any(|o| o.order_ref == order.order_ref) {
            return Err(StoreError::Conflict(format!(
                "order_ref {} already exists",
                order.order_ref
            )));
        }
        let now = Utc::now();
        let id = self.work.next_id();
        let row = Order {
            id,
            order_ref: order.order_ref.clone(),
            user_id: order.user_id,
            product_id: order.product_id,
            quantity: order.quantity,
            price: order.price,
            total_amount: order.total_amount,
            payment_method: order.payment_method.clone(),
            status: OrderStatus::Pending,
            expired_at: order.expired_at,
            paid_at: None,
            is_notified: false,
            assigned_codes: Vec::new(),
            payment: PaymentInstructions::default(),
            created_at: now,
            updated_at: now,
        };
        self.work.orders.insert(id, row.clone());
        Ok(row)
    }

    async fn insert_deposit(&mut self, deposit: &NewDeposit) -> Result<Deposit, StoreError> {
        if self
            .work
            .deposits
            .values()
            .any(|d| d.deposit_ref == deposit.deposit_ref)
        {
            return Err(StoreError::Conflict(format!(
                "deposit_ref {} already exists",
                deposit.deposit_ref
            )));
        }
        let now = Utc::now();
        let id = self.work.next_id();
        let row = Deposit {
            id,
            deposit_ref: deposit.deposit_ref.clone(),
            user_id: deposit.user_id,
            amount: deposit.amount,
            channel: deposit.channel.clone(),
            status: DepositStatus::Pending,
            expired_at: deposit.expired_at,
            paid_at: None,
            is_notified: false,
            payment: PaymentInstructions::default(),
            created_at: now,
            updated_at: now,
        };
        self.work.deposits.insert(id, row.clone());
        Ok(row)
    }

    async fn transition_order(
        &mut self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Order>, StoreError> {
        match self.work.orders.get_mut(&id) {
            Some(order) if order.status == from => {
                order.status = to;
                if paid_at.is_some() {
                    order.paid_at = paid_at;
                }
                order.updated_at = Utc::now();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn transition_deposit(
        &mut self,
        id: DepositId,
        from: DepositStatus,
        to: DepositStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Deposit>, StoreError> {
        match self.work.deposits.get_mut(&id) {
            Some(deposit) if deposit.status == from => {
                deposit.status = to;
                if paid_at.is_some() {
                    deposit.paid_at = paid_at;
                }
                deposit.updated_at = Utc::now();
                Ok(Some(deposit.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn lock_ready_units(
        &mut self,
        product_id: ProductId,
        limit: i64,
    ) -> Result<Vec<StockUnit>, StoreError> {
        Ok(self
            .work
            .units
            .values()
            .filter(|u| u.product_id == product_id && u.status == StockStatus::Ready)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn set_unit_status(
        &mut self,
        unit_ids: &[StockUnitId],
        status: StockStatus,
        sold_to: Option<UserId>,
    ) -> Result<u64, StoreError> {
        let mut affected = 0;
        for id in unit_ids {
            if let Some(unit) = self.work.units.get_mut(id) {
                unit.status = status;
                unit.sold_to = sold_to;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_reservations(
        &mut self,
        order_id: OrderId,
        unit_ids: &[StockUnitId],
    ) -> Result<(), StoreError> {
        if let Some(taken) = unit_ids
            .iter()
            .find(|id| self.work.reservations.contains_key(id))
        {
            return Err(StoreError::Conflict(format!(
                "unit {} already queued",
                taken
            )));
        }
        for id in unit_ids {
            self.work.reservations.insert(*id, order_id);
        }
        Ok(())
    }

    async fn reserved_units(&mut self, order_id: OrderId) -> Result<Vec<StockUnit>, StoreError> {
        let mut units = Vec::new();
        for (unit_id, owner) in &self.work.reservations {
            if *owner != order_id {
                continue;
            }
            let unit = self.work.units.get(unit_id).ok_or_else(|| StoreError::Corrupt {
                table: "reservation_queue_tb",
                detail: format!("unit {} missing", unit_id),
            })?;
            units.push(unit.clone());
        }
        Ok(units)
    }

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64, StoreError> {
        let before = self.work.reservations.len();
        self.work.reservations.retain(|_, owner| *owner != order_id);
        Ok((before - self.work.reservations.len()) as u64)
    }

    async fn set_assigned_codes(
        &mut self,
        order_id: OrderId,
        codes: &[String],
    ) -> Result<(), StoreError> {
        if let Some(order) = self.work.orders.get_mut(&order_id) {
            order.assigned_codes = codes.to_vec();
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_order_notified(&mut self, order_id: OrderId) -> Result<(), StoreError> {
        if let Some(order) = self.work.orders.get_mut(&order_id) {
            order.is_notified = false;
        }
        Ok(())
    }

    async fn credit_balance(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError> {
        match self.work.users.get_mut(&user_id) {
            Some(user) => {
                user.balance += amount;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn debit_balance(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError> {
        match self.work.users.get_mut(&user_id) {
            Some(user) if user.balance >= amount => {
                user.balance -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

/// Process-local store backed by a single async mutex
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }

    async fn create_user(&self, role: Role, balance: Money) -> Result<User, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let user = User { id, balance, role };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn create_product(&self, name: &str, price: Money) -> Result<Product, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let product = Product {
            id,
            name: name.to_string(),
            price,
            is_active: true,
        };
        state.products.insert(id, product.clone());
        Ok(product)
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn import_stock(
        &self,
        product_id: ProductId,
        codes: &[String],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut seen: HashSet<String> = state
            .units
            .values()
            .filter(|u| u.product_id == product_id)
            .map(|u| u.code.clone())
            .collect();

        let mut inserted = 0;
        for code in codes {
            if !seen.insert(code.clone()) {
                continue;
            }
            let id = state.next_id();
            state.units.insert(
                id,
                StockUnit {
                    id,
                    product_id,
                    code: code.clone(),
                    status: StockStatus::Ready,
                    sold_to: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn stock_counts(&self, product_id: ProductId) -> Result<StockCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StockCounts::default();
        for unit in state.units.values().filter(|u| u.product_id == product_id) {
            match unit.status {
                StockStatus::Ready => counts.ready += 1,
                StockStatus::Reserved => counts.reserved += 1,
                StockStatus::Sold => counts.sold += 1,
            }
        }
        Ok(counts)
    }

    async fn stock_units(&self, product_id: ProductId) -> Result<Vec<StockUnit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .units
            .values()
            .filter(|u| u.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn get_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.order_ref == order_ref)
            .cloned())
    }

    async fn pending_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_orders(limit, |o| o.status == OrderStatus::Pending))
    }

    async fn overdue_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_orders(limit, |o| o.is_overdue(now)))
    }

    async fn unnotified_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_orders(limit, |o| o.status.is_terminal() && !o.is_notified))
    }

    async fn mark_order_notified(
        &self,
        id: OrderId,
        announced: OrderStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(&id) {
            Some(order) if !order.is_notified && order.status == announced => {
                order.is_notified = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_order_payment(
        &self,
        id: OrderId,
        payment: &PaymentInstructions,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(&id) {
            order.payment = payment.clone();
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_deposit(&self, id: DepositId) -> Result<Option<Deposit>, StoreError> {
        Ok(self.state.lock().await.deposits.get(&id).cloned())
    }

    async fn get_deposit_by_ref(&self, deposit_ref: &str) -> Result<Option<Deposit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deposits
            .values()
            .find(|d| d.deposit_ref == deposit_ref)
            .cloned())
    }

    async fn pending_deposits(&self, limit: i64) -> Result<Vec<Deposit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_deposits(limit, |d| d.status == DepositStatus::Pending))
    }

    async fn overdue_deposits(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Deposit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_deposits(limit, |d| d.is_overdue(now)))
    }

    async fn unnotified_deposits(&self, limit: i64) -> Result<Vec<Deposit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_deposits(limit, |d| d.status.is_terminal() && !d.is_notified))
    }

    async fn mark_deposit_notified(
        &self,
        id: DepositId,
        announced: DepositStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.deposits.get_mut(&id) {
            Some(deposit) if !deposit.is_notified && deposit.status == announced => {
                deposit.is_notified = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_deposit_payment(
        &self,
        id: DepositId,
        payment: &PaymentInstructions,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(deposit) = state.deposits.get_mut(&id) {
            deposit.payment = payment.clone();
            deposit.updated_at = Utc::now();
        }
        Ok(())
    }
}
