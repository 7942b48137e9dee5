//! Order / Deposit state machine
//!
//! ```text
//! order:   PENDING ──paid──▶ SUCCESS ──refund──▶ REFUND
//!             ├──declined──▶ FAILED
//!             └──deadline──▶ EXPIRED
//! deposit: PENDING ──paid──▶ SUCCESS
//!             ├──declined──▶ FAILED
//!             └──deadline──▶ EXPIRED
//! ```
//!
//! Every transition is one store transaction: a compare-and-swap on status
//! followed by its side effects (stock, balance). If the status already moved
//! the transaction is dropped untouched and the caller gets
//! [`TransitionOutcome::AlreadyTerminal`], so concurrent reconcilers may race
//! on one record.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{EngineError, StoreError};
use crate::models::{Deposit, DepositStatus, Order, OrderStatus};
use crate::reservation::{promote_in, release_in};
use crate::store::ResourceStore;

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome<T> {
    /// This call performed the transition; carries the updated record
    Applied(T),
    /// Another caller got there first (or the record is in another state)
    AlreadyTerminal,
}

impl<T> TransitionOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            TransitionOutcome::Applied(record) => Some(record),
            TransitionOutcome::AlreadyTerminal => None,
        }
    }
}

/// Legal order transitions
pub fn order_transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Success) | (Pending, Failed) | (Pending, Expired) | (Success, Refund)
    )
}

/// Legal deposit transitions
pub fn deposit_transition_allowed(from: DepositStatus, to: DepositStatus) -> bool {
    use DepositStatus::*;
    matches!(
        (from, to),
        (Pending, Success) | (Pending, Failed) | (Pending, Expired)
    )
}

// ============================================================================
// Orders
// ============================================================================

/// PENDING → SUCCESS: promote the reserved units and, for balance payments,
/// debit the buyer.
///
/// An insufficient balance aborts the whole transaction; the order stays
/// PENDING with its reservation intact.
pub async fn apply_order_success(
    store: &dyn ResourceStore,
    order: &Order,
) -> Result<TransitionOutcome<Order>, EngineError> {
    let mut tx = store.begin().await?;
    let paid_at = Utc::now();

    let Some(updated) = tx
        .transition_order(order.id, OrderStatus::Pending, OrderStatus::Success, Some(paid_at))
        .await?
    else {
        debug!(order_ref = %order.order_ref, "Order already terminal, success skipped");
        return Ok(TransitionOutcome::AlreadyTerminal);
    };

    let codes = promote_in(tx.as_mut(), order.id, order.user_id).await?;
    if codes.len() != order.quantity as usize {
        return Err(StoreError::Corrupt {
            table: "reservation_queue_tb",
            detail: format!(
                "order {} has {} queued units, expected {}",
                order.order_ref,
                codes.len(),
                order.quantity
            ),
        }
        .into());
    }

    if order.payment_method.is_balance() {
        let user_id = order.user_id.ok_or(EngineError::GuestBalancePayment)?;
        if !tx.debit_balance(user_id, order.total_amount).await? {
            return Err(EngineError::InsufficientBalance);
        }
    }

    tx.commit().await?;
    info!(
        order_ref = %order.order_ref,
        quantity = order.quantity,
        method = %order.payment_method,
        "Order paid"
    );
    Ok(TransitionOutcome::Applied(Order {
        assigned_codes: codes,
        ..updated
    }))
}

async fn close_order(
    store: &dyn ResourceStore,
    order: &Order,
    to: OrderStatus,
) -> Result<TransitionOutcome<Order>, EngineError> {
    let mut tx = store.begin().await?;

    let Some(updated) = tx
        .transition_order(order.id, OrderStatus::Pending, to, None)
        .await?
    else {
        debug!(order_ref = %order.order_ref, target = %to, "Order already terminal, close skipped");
        return Ok(TransitionOutcome::AlreadyTerminal);
    };

    let released = release_in(tx.as_mut(), order.id).await?;
    tx.commit().await?;

    info!(order_ref = %order.order_ref, status = %to, released, "Order closed");
    Ok(TransitionOutcome::Applied(updated))
}

/// PENDING → EXPIRED, releasing the reservation
pub async fn apply_order_expiry(
    store: &dyn ResourceStore,
    order: &Order,
) -> Result<TransitionOutcome<Order>, EngineError> {
    close_order(store, order, OrderStatus::Expired).await
}

/// PENDING → FAILED, releasing the reservation
pub async fn apply_order_failure(
    store: &dyn ResourceStore,
    order: &Order,
) -> Result<TransitionOutcome<Order>, EngineError> {
    close_order(store, order, OrderStatus::Failed).await
}

/// SUCCESS → REFUND: credit the total back to a registered buyer and re-arm
/// the notification. Sold units stay sold.
pub async fn apply_order_refund(
    store: &dyn ResourceStore,
    order: &Order,
) -> Result<TransitionOutcome<Order>, EngineError> {
    let mut tx = store.begin().await?;

    let Some(updated) = tx
        .transition_order(order.id, OrderStatus::Success, OrderStatus::Refund, None)
        .await?
    else {
        debug!(order_ref = %order.order_ref, "Order not in SUCCESS, refund skipped");
        return Ok(TransitionOutcome::AlreadyTerminal);
    };

    if let Some(user_id) = order.user_id
        && !tx.credit_balance(user_id, order.total_amount).await?
    {
        return Err(EngineError::UserNotFound(user_id));
    }
    tx.reset_order_notified(order.id).await?;
    tx.commit().await?;

    info!(order_ref = %order.order_ref, amount = %order.total_amount, "Order refunded");
    Ok(TransitionOutcome::Applied(Order {
        is_notified: false,
        ..updated
    }))
}

// ============================================================================
// Deposits
// ============================================================================

/// PENDING → SUCCESS and credit the requested amount, in one commit.
///
/// The status CAS is the idempotency key: a second call (sequential or
/// concurrent) sees zero rows and credits nothing.
pub async fn apply_deposit_success(
    store: &dyn ResourceStore,
    deposit: &Deposit,
) -> Result<TransitionOutcome<Deposit>, EngineError> {
    let mut tx = store.begin().await?;
    let paid_at = Utc::now();

    let Some(updated) = tx
        .transition_deposit(
            deposit.id,
            DepositStatus::Pending,
            DepositStatus::Success,
            Some(paid_at),
        )
        .await?
    else {
        debug!(deposit_ref = %deposit.deposit_ref, "Deposit already terminal, credit skipped");
        return Ok(TransitionOutcome::AlreadyTerminal);
    };

    if !tx.credit_balance(deposit.user_id, deposit.amount).await? {
        return Err(EngineError::UserNotFound(deposit.user_id));
    }
    tx.commit().await?;

    info!(
        deposit_ref = %deposit.deposit_ref,
        user_id = deposit.user_id,
        amount = %deposit.amount,
        "Deposit credited"
    );
    Ok(TransitionOutcome::Applied(updated))
}

async fn close_deposit(
    store: &dyn ResourceStore,
    deposit: &Deposit,
    to: DepositStatus,
) -> Result<TransitionOutcome<Deposit>, EngineError> {
    let mut tx = store.begin().await?;

    let Some(updated) = tx
        .transition_deposit(deposit.id, DepositStatus::Pending, to, None)
        .await?
    else {
        debug!(deposit_ref = %deposit.deposit_ref, target = %to, "Deposit already terminal, close skipped");
        return Ok(TransitionOutcome::AlreadyTerminal);
    };
    tx.commit().await?;

    info!(deposit_ref = %deposit.deposit_ref, status = %to, "Deposit closed");
    Ok(TransitionOutcome::Applied(updated))
}

pub async fn apply_deposit_expiry(
    store: &dyn ResourceStore,
    deposit: &Deposit,
) -> Result<TransitionOutcome<Deposit>, EngineError> {
    close_deposit(store, deposit, DepositStatus::Expired).await
}

pub async fn apply_deposit_failure(
    store: &dyn ResourceStore,
    deposit: &Deposit,
) -> Result<TransitionOutcome<Deposit>, EngineError> {
    close_deposit(store, deposit, DepositStatus::Failed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Money;
    use crate::models::{NewDeposit, NewOrder, PaymentMethod, Role, StockStatus};
    use crate::reservation::reserve_in;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        product_id: i64,
    }

    async fn fixture(units: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let product = store.create_product("Gift Card", Money::from(10)).await.unwrap();
        let codes: Vec<String> = (0..units).map(|i| format!("GC-{i}")).collect();
        store.import_stock(product.id, &codes).await.unwrap();
        Fixture {
            store,
            product_id: product.id,
        }
    }

    async fn reserved_order(
        f: &Fixture,
        order_ref: &str,
        quantity: i32,
        user_id: Option<i64>,
        method: PaymentMethod,
    ) -> Order {
        let mut tx = f.store.begin().await.unwrap();
        let order = tx
            .insert_order(&NewOrder {
                order_ref: order_ref.to_string(),
                user_id,
                product_id: f.product_id,
                quantity,
                price: Money::from(10),
                total_amount: Money::from(10 * quantity),
                payment_method: method,
                expired_at: Utc::now() + chrono::Duration::minutes(15),
            })
            .await
            .unwrap();
        reserve_in(tx.as_mut(), order.id, f.product_id, quantity)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        order
    }

    async fn pending_deposit(store: &MemoryStore, user_id: i64, amount: Money) -> Deposit {
        let mut tx = store.begin().await.unwrap();
        let deposit = tx
            .insert_deposit(&NewDeposit {
                deposit_ref: format!("DEP-{}", ulid::Ulid::new()),
                user_id,
                amount,
                channel: "QRIS".to_string(),
                expired_at: Utc::now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        deposit
    }

    #[test]
    fn test_transition_table() {
        assert!(order_transition_allowed(OrderStatus::Pending, OrderStatus::Success));
        assert!(order_transition_allowed(OrderStatus::Success, OrderStatus::Refund));
        assert!(!order_transition_allowed(OrderStatus::Expired, OrderStatus::Success));
        assert!(!order_transition_allowed(OrderStatus::Refund, OrderStatus::Success));
        assert!(!order_transition_allowed(OrderStatus::Pending, OrderStatus::Refund));

        assert!(deposit_transition_allowed(DepositStatus::Pending, DepositStatus::Expired));
        assert!(!deposit_transition_allowed(DepositStatus::Success, DepositStatus::Failed));
    }

    #[tokio::test]
    async fn test_order_success_promotes_and_is_idempotent() {
        let f = fixture(5).await;
        let order = reserved_order(&f, "ORD-1", 3, None, PaymentMethod::parse("QRIS")).await;

        let outcome = apply_order_success(f.store.as_ref(), &order).await.unwrap();
        let paid = outcome.applied().expect("first success applies");
        assert_eq!(paid.status, OrderStatus::Success);
        assert_eq!(paid.assigned_codes, vec!["GC-0", "GC-1", "GC-2"]);
        assert!(paid.paid_at.is_some());

        let again = apply_order_success(f.store.as_ref(), &order).await.unwrap();
        assert_eq!(again, TransitionOutcome::AlreadyTerminal);

        let counts = f.store.stock_counts(f.product_id).await.unwrap();
        assert_eq!((counts.ready, counts.reserved, counts.sold), (2, 0, 3));
    }

    #[tokio::test]
    async fn test_balance_order_debits_buyer() {
        let f = fixture(2).await;
        let buyer = f.store.create_user(Role::Member, Money::from(50)).await.unwrap();
        let order = reserved_order(&f, "ORD-1", 2, Some(buyer.id), PaymentMethod::Balance).await;

        assert!(apply_order_success(f.store.as_ref(), &order).await.unwrap().is_applied());

        let buyer = f.store.get_user(buyer.id).await.unwrap().unwrap();
        assert_eq!(buyer.balance, Money::from(30));
        let units = f.store.stock_units(f.product_id).await.unwrap();
        assert!(units.iter().all(|u| u.sold_to == Some(buyer.id)));
    }

    #[tokio::test]
    async fn test_insufficient_balance_keeps_order_pending() {
        let f = fixture(2).await;
        let buyer = f.store.create_user(Role::Member, Money::from(5)).await.unwrap();
        let order = reserved_order(&f, "ORD-1", 1, Some(buyer.id), PaymentMethod::Balance).await;

        let err = apply_order_success(f.store.as_ref(), &order).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance));

        let stored = f.store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(stored.assigned_codes.is_empty());
        let counts = f.store.stock_counts(f.product_id).await.unwrap();
        assert_eq!(counts.reserved, 1);
        assert_eq!(
            f.store.get_user(buyer.id).await.unwrap().unwrap().balance,
            Money::from(5)
        );
    }

    #[tokio::test]
    async fn test_expiry_releases_and_blocks_success() {
        let f = fixture(5).await;
        let order = reserved_order(&f, "ORD-1", 3, None, PaymentMethod::parse("QRIS")).await;

        assert!(apply_order_expiry(f.store.as_ref(), &order).await.unwrap().is_applied());
        let counts = f.store.stock_counts(f.product_id).await.unwrap();
        assert_eq!(counts.ready, 5);

        // a late "paid" must not resurrect the order
        let late = apply_order_success(f.store.as_ref(), &order).await.unwrap();
        assert_eq!(late, TransitionOutcome::AlreadyTerminal);
        assert_eq!(f.store.stock_counts(f.product_id).await.unwrap().sold, 0);
    }

    #[tokio::test]
    async fn test_failure_releases() {
        let f = fixture(3).await;
        let order = reserved_order(&f, "ORD-1", 2, None, PaymentMethod::parse("QRIS")).await;

        let closed = apply_order_failure(f.store.as_ref(), &order)
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(closed.status, OrderStatus::Failed);
        assert_eq!(f.store.stock_counts(f.product_id).await.unwrap().ready, 3);
    }

    #[tokio::test]
    async fn test_refund_credits_and_rearms_notification() {
        let f = fixture(1).await;
        let buyer = f.store.create_user(Role::Member, Money::ZERO).await.unwrap();
        let order = reserved_order(&f, "ORD-1", 1, Some(buyer.id), PaymentMethod::parse("QRIS"))
            .await;

        apply_order_success(f.store.as_ref(), &order).await.unwrap();
        assert!(
            f.store
                .mark_order_notified(order.id, OrderStatus::Success)
                .await
                .unwrap()
        );

        let refunded = apply_order_refund(f.store.as_ref(), &order)
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(refunded.status, OrderStatus::Refund);

        let stored = f.store.get_order(order.id).await.unwrap().unwrap();
        assert!(!stored.is_notified);
        assert_eq!(
            f.store.get_user(buyer.id).await.unwrap().unwrap().balance,
            Money::from(10)
        );

        let again = apply_order_refund(f.store.as_ref(), &order).await.unwrap();
        assert_eq!(again, TransitionOutcome::AlreadyTerminal);

        // an ack for the earlier SUCCESS announcement must not cover the refund
        assert!(
            !f.store
                .mark_order_notified(order.id, OrderStatus::Success)
                .await
                .unwrap()
        );
        assert!(!f.store.get_order(order.id).await.unwrap().unwrap().is_notified);
    }

    async fn race_order_success(f: &Fixture, order: &Order, racers: usize) -> usize {
        let handles: Vec<_> = (0..racers)
            .map(|_| {
                let store = f.store.clone();
                let order = order.clone();
                tokio::spawn(async move { apply_order_success(store.as_ref(), &order).await })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_applied() {
                applied += 1;
            }
        }
        applied
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_order_success_applies_once() {
        let f = fixture(6).await;
        let order = reserved_order(&f, "ORD-1", 3, None, PaymentMethod::parse("QRIS")).await;

        assert_eq!(race_order_success(&f, &order, 4).await, 1);

        let stored = f.store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Success);
        assert_eq!(stored.assigned_codes, vec!["GC-0", "GC-1", "GC-2"]);
        let counts = f.store.stock_counts(f.product_id).await.unwrap();
        assert_eq!((counts.ready, counts.reserved, counts.sold), (3, 0, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_balance_order_debits_once() {
        let f = fixture(4).await;
        let buyer = f.store.create_user(Role::Member, Money::from(100)).await.unwrap();
        let order = reserved_order(&f, "ORD-1", 2, Some(buyer.id), PaymentMethod::Balance).await;

        assert_eq!(race_order_success(&f, &order, 4).await, 1);

        assert_eq!(
            f.store.get_user(buyer.id).await.unwrap().unwrap().balance,
            Money::from(80)
        );
        let stored = f.store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_codes.len(), 2);
        let units = f.store.stock_units(f.product_id).await.unwrap();
        let sold: Vec<_> = units
            .iter()
            .filter(|u| u.status == StockStatus::Sold)
            .collect();
        assert_eq!(sold.len(), 2);
        assert!(sold.iter().all(|u| u.sold_to == Some(buyer.id)));
    }

    #[tokio::test]
    async fn test_concurrent_deposit_success_credits_once() {
        let store = Arc::new(MemoryStore::new());
        let user = store.create_user(Role::Member, Money::ZERO).await.unwrap();
        let deposit = pending_deposit(&store, user.id, Money::from(50_000)).await;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let deposit = deposit.clone();
                tokio::spawn(async move { apply_deposit_success(store.as_ref(), &deposit).await })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_applied() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(
            store.get_user(user.id).await.unwrap().unwrap().balance,
            Money::from(50_000)
        );
    }

    #[tokio::test]
    async fn test_deposit_expiry_blocks_credit() {
        let store = Arc::new(MemoryStore::new());
        let user = store.create_user(Role::Member, Money::ZERO).await.unwrap();
        let deposit = pending_deposit(&store, user.id, Money::from(100)).await;

        assert!(apply_deposit_expiry(store.as_ref(), &deposit).await.unwrap().is_applied());
        assert_eq!(
            apply_deposit_success(store.as_ref(), &deposit).await.unwrap(),
            TransitionOutcome::AlreadyTerminal
        );
        assert_eq!(
            store.get_user(user.id).await.unwrap().unwrap().balance,
            Money::ZERO
        );
    }

    #[tokio::test]
    async fn test_deposit_failure() {
        let store = Arc::new(MemoryStore::new());
        let user = store.create_user(Role::Member, Money::ZERO).await.unwrap();
        let deposit = pending_deposit(&store, user.id, Money::from(100)).await;

        let failed = apply_deposit_failure(store.as_ref(), &deposit)
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(failed.status, DepositStatus::Failed);
    }
}
