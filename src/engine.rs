//! Shop engine facade
//!
//! Entry point for every collaborator (HTTP API, bots, admin tools). Owns the
//! store, the gateway, the reconciler and the poller registry; the sweeper is
//! built from it and run by the binary.
//!
//! # Order flow
//! 1. Validate quantity, product and (balance method) buyer funds
//! 2. One transaction: insert the PENDING order and reserve its units
//! 3. Balance method: settle immediately. Gateway method: create the charge,
//!    persist the payment instructions, optionally start a poller.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core_types::{Money, ProductId, RecordRef, UserId};
use crate::error::EngineError;
use crate::models::{
    Deposit, NewDeposit, NewOrder, Order, OrderStatus, PaymentMethod, StockCounts,
};
use crate::notify::NotificationDispatcher;
use crate::payment::PaymentGateway;
use crate::reconcile::{PollerRegistry, ReconcileOutcome, Reconciler, Sweeper};
use crate::reservation::reserve_in;
use crate::state_machine::{
    TransitionOutcome, apply_deposit_failure, apply_order_failure, apply_order_refund,
    order_transition_allowed,
};
use crate::store::ResourceStore;

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub product_id: ProductId,
    pub quantity: i32,
    /// `BALANCE` or a gateway channel code
    pub payment_method: String,
    /// `None` for guest checkout
    pub user_id: Option<UserId>,
    /// Start an active poller for gateway payments
    pub start_poller: bool,
}

#[derive(Debug, Clone)]
pub struct CreateDepositRequest {
    pub user_id: UserId,
    pub amount: Money,
    pub channel: String,
    pub start_poller: bool,
}

pub struct ShopEngine {
    store: Arc<dyn ResourceStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<Reconciler>,
    pollers: Arc<PollerRegistry>,
    config: EngineConfig,
}

impl ShopEngine {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<NotificationDispatcher>,
        config: EngineConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(store.clone(), gateway.clone(), notifier));
        let pollers = Arc::new(PollerRegistry::new(
            reconciler.clone(),
            config.poll_interval(),
        ));
        Self {
            store,
            gateway,
            reconciler,
            pollers,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn pollers(&self) -> &Arc<PollerRegistry> {
        &self.pollers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sweeper bound to this engine's reconciler
    pub fn sweeper(&self) -> Sweeper {
        self.sweeper_with_interval(self.config.sweep_interval())
    }

    pub fn sweeper_with_interval(&self, interval: Duration) -> Sweeper {
        Sweeper::new(self.reconciler.clone(), interval, self.config.batch_size)
    }

    /// Stop all active pollers
    pub fn shutdown(&self) {
        self.pollers.cancel_all();
    }

    // ========================================================================
    // Orders
    // ========================================================================

    pub async fn create_order(&self, req: CreateOrderRequest) -> Result<Order, EngineError> {
        let max = self.config.max_order_quantity;
        if req.quantity < 1 || req.quantity > max {
            return Err(EngineError::InvalidQuantity {
                got: req.quantity,
                max,
            });
        }
        if req.payment_method.trim().is_empty() {
            return Err(EngineError::InvalidPaymentMethod(req.payment_method));
        }
        let method = PaymentMethod::parse(&req.payment_method);

        let product = self
            .store
            .get_product(req.product_id)
            .await?
            .ok_or(EngineError::ProductNotFound(req.product_id))?;
        if !product.is_active {
            return Err(EngineError::ProductInactive(product.id));
        }
        let total_amount = product.price * Money::from(req.quantity);

        if let Some(user_id) = req.user_id {
            let user = self
                .store
                .get_user(user_id)
                .await?
                .ok_or(EngineError::UserNotFound(user_id))?;
            // checked again, atomically, when the order settles
            if method.is_balance() && user.balance < total_amount {
                return Err(EngineError::InsufficientBalance);
            }
        } else if method.is_balance() {
            return Err(EngineError::GuestBalancePayment);
        }

        let new_order = NewOrder {
            order_ref: RecordRef::new_order().to_string(),
            user_id: req.user_id,
            product_id: product.id,
            quantity: req.quantity,
            price: product.price,
            total_amount,
            payment_method: method.clone(),
            expired_at: Utc::now() + self.config.order_window(),
        };

        let mut tx = self.store.begin().await?;
        let mut order = tx.insert_order(&new_order).await?;
        reserve_in(tx.as_mut(), order.id, product.id, req.quantity).await?;
        tx.commit().await?;

        info!(
            order_ref = %order.order_ref,
            product_id = product.id,
            quantity = order.quantity,
            total = %total_amount,
            method = %method,
            "Order created"
        );

        let Some(channel) = method.channel() else {
            if let Err(e) = self.reconciler.reconcile_order(&order, Utc::now()).await {
                warn!(order_ref = %order.order_ref, error = %e, "Balance settlement deferred");
            }
            return self.reload_order(&order.order_ref).await;
        };

        match self
            .gateway
            .create_charge(&order.order_ref, total_amount, channel)
            .await
        {
            Ok(payment) => {
                self.store.set_order_payment(order.id, &payment).await?;
                order.payment = payment;
            }
            Err(e) => {
                warn!(order_ref = %order.order_ref, error = %e, "Charge creation failed");
                apply_order_failure(self.store.as_ref(), &order).await?;
                return Err(e.into());
            }
        }

        if req.start_poller {
            self.start_poller(&order.order_ref, order.expired_at);
        }
        Ok(order)
    }

    pub async fn get_order_status(&self, order_ref: &str) -> Result<Order, EngineError> {
        let reference = parse_ref(order_ref)?;
        if !reference.is_order() {
            return Err(EngineError::OrderNotFound(order_ref.to_string()));
        }
        self.reload_order(reference.as_str()).await
    }

    /// Admin: expire a pending order now instead of at its deadline. Its units
    /// return to READY and the buyer is told the order EXPIRED.
    pub async fn cancel_reservation(&self, order_ref: &str) -> Result<Order, EngineError> {
        let order = self.get_order_status(order_ref).await?;
        if !order_transition_allowed(order.status, OrderStatus::Expired) {
            return Err(EngineError::InvalidStateTransition(format!(
                "cannot cancel {} order",
                order.status
            )));
        }

        self.pollers.cancel(&order.order_ref);
        match self.reconciler.cancel_order(&order).await? {
            TransitionOutcome::Applied(updated) => {
                info!(order_ref = %order.order_ref, "Reservation cancelled");
                Ok(updated)
            }
            TransitionOutcome::AlreadyTerminal => Err(EngineError::InvalidStateTransition(
                "order left PENDING before it could be cancelled".to_string(),
            )),
        }
    }

    /// Admin: refund a successful order to the buyer's balance
    pub async fn refund_order(&self, order_ref: &str) -> Result<Order, EngineError> {
        let order = self.get_order_status(order_ref).await?;
        if !order_transition_allowed(order.status, OrderStatus::Refund) {
            return Err(EngineError::InvalidStateTransition(format!(
                "cannot refund {} order",
                order.status
            )));
        }

        match apply_order_refund(self.store.as_ref(), &order).await? {
            TransitionOutcome::Applied(updated) => Ok(updated),
            TransitionOutcome::AlreadyTerminal => Err(EngineError::InvalidStateTransition(
                "order already refunded".to_string(),
            )),
        }
    }

    async fn reload_order(&self, order_ref: &str) -> Result<Order, EngineError> {
        self.store
            .get_order_by_ref(order_ref)
            .await?
            .ok_or_else(|| EngineError::OrderNotFound(order_ref.to_string()))
    }

    // ========================================================================
    // Deposits
    // ========================================================================

    pub async fn create_deposit(&self, req: CreateDepositRequest) -> Result<Deposit, EngineError> {
        let (min, max) = (self.config.min_deposit, self.config.max_deposit);
        if req.amount < min || req.amount > max {
            return Err(EngineError::InvalidAmount(format!(
                "deposit must be between {} and {}, got {}",
                min, max, req.amount
            )));
        }
        let channel = req.channel.trim().to_uppercase();
        if channel.is_empty() || channel == PaymentMethod::BALANCE {
            return Err(EngineError::InvalidPaymentMethod(req.channel));
        }
        if self.store.get_user(req.user_id).await?.is_none() {
            return Err(EngineError::UserNotFound(req.user_id));
        }

        let new_deposit = NewDeposit {
            deposit_ref: RecordRef::new_deposit().to_string(),
            user_id: req.user_id,
            amount: req.amount,
            channel,
            expired_at: Utc::now() + self.config.deposit_window(),
        };

        let mut tx = self.store.begin().await?;
        let mut deposit = tx.insert_deposit(&new_deposit).await?;
        tx.commit().await?;

        info!(
            deposit_ref = %deposit.deposit_ref,
            user_id = deposit.user_id,
            amount = %deposit.amount,
            channel = %deposit.channel,
            "Deposit created"
        );

        match self
            .gateway
            .create_charge(&deposit.deposit_ref, deposit.amount, &deposit.channel)
            .await
        {
            Ok(payment) => {
                self.store.set_deposit_payment(deposit.id, &payment).await?;
                deposit.payment = payment;
            }
            Err(e) => {
                warn!(deposit_ref = %deposit.deposit_ref, error = %e, "Charge creation failed");
                apply_deposit_failure(self.store.as_ref(), &deposit).await?;
                return Err(e.into());
            }
        }

        if req.start_poller {
            self.start_poller(&deposit.deposit_ref, deposit.expired_at);
        }
        Ok(deposit)
    }

    pub async fn get_deposit_status(&self, deposit_ref: &str) -> Result<Deposit, EngineError> {
        let reference = parse_ref(deposit_ref)?;
        if !reference.is_deposit() {
            return Err(EngineError::DepositNotFound(deposit_ref.to_string()));
        }
        self.store
            .get_deposit_by_ref(reference.as_str())
            .await?
            .ok_or_else(|| EngineError::DepositNotFound(deposit_ref.to_string()))
    }

    // ========================================================================
    // Stock
    // ========================================================================

    /// Admin: add codes to a product. Blank lines and codes already present
    /// are skipped. Returns how many units were added.
    pub async fn import_stock(
        &self,
        product_id: ProductId,
        codes: &[String],
    ) -> Result<u64, EngineError> {
        if self.store.get_product(product_id).await?.is_none() {
            return Err(EngineError::ProductNotFound(product_id));
        }
        let cleaned: Vec<String> = codes
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        let inserted = self.store.import_stock(product_id, &cleaned).await?;
        info!(
            product_id,
            submitted = codes.len(),
            inserted,
            "Stock imported"
        );
        Ok(inserted)
    }

    pub async fn stock_counts(&self, product_id: ProductId) -> Result<StockCounts, EngineError> {
        if self.store.get_product(product_id).await?.is_none() {
            return Err(EngineError::ProductNotFound(product_id));
        }
        Ok(self.store.stock_counts(product_id).await?)
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Provider callback: never trusted, only triggers an immediate reconcile
    /// which re-asks the gateway.
    pub async fn handle_payment_callback(
        &self,
        reference: &str,
    ) -> Result<ReconcileOutcome, EngineError> {
        let reference = parse_ref(reference)?;
        let outcome = self.reconciler.reconcile_ref(&reference, Utc::now()).await?;
        if outcome.is_final() {
            self.pollers.cancel(reference.as_str());
        }
        info!(reference = %reference, ?outcome, "Payment callback reconciled");
        Ok(outcome)
    }

    fn start_poller(&self, reference: &str, deadline: chrono::DateTime<Utc>) {
        match reference.parse::<RecordRef>() {
            Ok(reference) => {
                self.pollers.spawn(reference, deadline);
            }
            Err(e) => warn!(error = %e, "Poller not started"),
        }
    }
}

fn parse_ref(raw: &str) -> Result<RecordRef, EngineError> {
    raw.trim()
        .parse::<RecordRef>()
        .map_err(|e| EngineError::InvalidReference(e.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepositStatus, Role};
    use crate::payment::{GatewayStatus, MockGateway};
    use crate::store::MemoryStore;

    struct Harness {
        engine: ShopEngine,
        store: Arc<MemoryStore>,
        gateway: Arc<MockGateway>,
        product_id: ProductId,
    }

    async fn harness(units: usize) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::with_fee(Money::from(700)));
        let engine = ShopEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(NotificationDispatcher::new(Vec::new())),
            EngineConfig {
                max_order_quantity: 10,
                min_deposit: Money::from(10_000),
                max_deposit: Money::from(1_000_000),
                ..EngineConfig::default()
            },
        );
        let product = store
            .create_product("Game Voucher", Money::from(15_000))
            .await
            .unwrap();
        let codes: Vec<String> = (0..units).map(|i| format!("GV-{i:03}")).collect();
        engine.import_stock(product.id, &codes).await.unwrap();
        Harness {
            engine,
            store,
            gateway,
            product_id: product.id,
        }
    }

    fn order_req(h: &Harness, quantity: i32, method: &str, user_id: Option<UserId>) -> CreateOrderRequest {
        CreateOrderRequest {
            product_id: h.product_id,
            quantity,
            payment_method: method.to_string(),
            user_id,
            start_poller: false,
        }
    }

    #[tokio::test]
    async fn test_create_gateway_order() {
        let h = harness(5).await;
        let order = h.engine.create_order(order_req(&h, 3, "qris", None)).await.unwrap();

        assert!(order.order_ref.starts_with("ORD-"));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, Money::from(45_000));
        assert_eq!(order.payment.amount_charged, Some(Money::from(45_700)));
        assert_eq!(h.gateway.charge_count(), 1);

        let counts = h.engine.stock_counts(h.product_id).await.unwrap();
        assert_eq!((counts.ready, counts.reserved), (2, 3));

        let stored = h.engine.get_order_status(&order.order_ref).await.unwrap();
        assert_eq!(stored.payment.amount_charged, Some(Money::from(45_700)));
    }

    #[tokio::test]
    async fn test_quantity_validation() {
        let h = harness(5).await;
        for quantity in [0, -1, 11] {
            let err = h
                .engine
                .create_order(order_req(&h, quantity, "QRIS", None))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidQuantity { .. }));
        }
    }

    #[tokio::test]
    async fn test_insufficient_stock_leaves_no_order() {
        let h = harness(2).await;
        let err = h
            .engine
            .create_order(order_req(&h, 3, "QRIS", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientStock { available: 2, .. }));
        assert_eq!(h.gateway.charge_count(), 0);
        assert!(h.store.pending_orders(10).await.unwrap().is_empty());
        assert_eq!(h.engine.stock_counts(h.product_id).await.unwrap().ready, 2);
    }

    #[tokio::test]
    async fn test_guest_cannot_pay_with_balance() {
        let h = harness(2).await;
        let err = h
            .engine
            .create_order(order_req(&h, 1, "BALANCE", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::GuestBalancePayment));
    }

    #[tokio::test]
    async fn test_balance_order_settles_immediately() {
        let h = harness(3).await;
        let buyer = h.store.create_user(Role::Member, Money::from(40_000)).await.unwrap();

        let order = h
            .engine
            .create_order(order_req(&h, 2, "balance", Some(buyer.id)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Success);
        assert_eq!(order.assigned_codes, vec!["GV-000", "GV-001"]);
        assert_eq!(h.gateway.charge_count(), 0);
        assert_eq!(
            h.store.get_user(buyer.id).await.unwrap().unwrap().balance,
            Money::from(10_000)
        );
    }

    #[tokio::test]
    async fn test_balance_checked_before_reservation() {
        let h = harness(3).await;
        let buyer = h.store.create_user(Role::Member, Money::from(1_000)).await.unwrap();

        let err = h
            .engine
            .create_order(order_req(&h, 1, "BALANCE", Some(buyer.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance));
        assert_eq!(h.engine.stock_counts(h.product_id).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_charge_failure_releases_stock() {
        let h = harness(3).await;
        h.gateway.set_fail_charges(true);

        let err = h
            .engine
            .create_order(order_req(&h, 2, "QRIS", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Gateway(_)));
        assert_eq!(h.engine.stock_counts(h.product_id).await.unwrap().ready, 3);
    }

    #[tokio::test]
    async fn test_missing_product() {
        let h = harness(1).await;
        let mut req = order_req(&h, 1, "QRIS", None);
        req.product_id = 9_999;
        assert!(matches!(
            h.engine.create_order(req).await.unwrap_err(),
            EngineError::ProductNotFound(9_999)
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_refund_rules() {
        let h = harness(4).await;
        let buyer = h.store.create_user(Role::Member, Money::from(15_000)).await.unwrap();

        let pending = h.engine.create_order(order_req(&h, 2, "QRIS", None)).await.unwrap();
        let cancelled = h.engine.cancel_reservation(&pending.order_ref).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Expired);
        assert_eq!(h.engine.stock_counts(cancelled.product_id).await.unwrap().ready, 4);
        assert!(matches!(
            h.engine.cancel_reservation(&pending.order_ref).await.unwrap_err(),
            EngineError::InvalidStateTransition(_)
        ));
        assert!(matches!(
            h.engine.refund_order(&pending.order_ref).await.unwrap_err(),
            EngineError::InvalidStateTransition(_)
        ));

        let paid = h
            .engine
            .create_order(order_req(&h, 1, "BALANCE", Some(buyer.id)))
            .await
            .unwrap();
        let refunded = h.engine.refund_order(&paid.order_ref).await.unwrap();
        assert_eq!(refunded.status, OrderStatus::Refund);
        assert_eq!(
            h.store.get_user(buyer.id).await.unwrap().unwrap().balance,
            Money::from(15_000)
        );
    }

    #[tokio::test]
    async fn test_deposit_validation_and_creation() {
        let h = harness(0).await;
        let user = h.store.create_user(Role::Member, Money::ZERO).await.unwrap();
        let req = |amount: i64| CreateDepositRequest {
            user_id: user.id,
            amount: Money::from(amount),
            channel: "qris".to_string(),
            start_poller: false,
        };

        assert!(matches!(
            h.engine.create_deposit(req(5_000)).await.unwrap_err(),
            EngineError::InvalidAmount(_)
        ));
        assert!(matches!(
            h.engine.create_deposit(req(2_000_000)).await.unwrap_err(),
            EngineError::InvalidAmount(_)
        ));

        let deposit = h.engine.create_deposit(req(50_000)).await.unwrap();
        assert_eq!(deposit.channel, "QRIS");
        assert_eq!(deposit.status, DepositStatus::Pending);
        assert_eq!(deposit.payment.amount_received, Some(Money::from(50_000)));

        let fetched = h.engine.get_deposit_status(&deposit.deposit_ref).await.unwrap();
        assert_eq!(fetched.id, deposit.id);
    }

    #[tokio::test]
    async fn test_callback_reconciles() {
        let h = harness(0).await;
        let user = h.store.create_user(Role::Member, Money::ZERO).await.unwrap();
        let deposit = h
            .engine
            .create_deposit(CreateDepositRequest {
                user_id: user.id,
                amount: Money::from(50_000),
                channel: "QRIS".to_string(),
                start_poller: true,
            })
            .await
            .unwrap();
        assert!(h.engine.pollers().is_active(&deposit.deposit_ref));

        h.gateway.set_status(&deposit.deposit_ref, GatewayStatus::Paid);
        let outcome = h
            .engine
            .handle_payment_callback(&deposit.deposit_ref)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Paid);
        assert!(!h.engine.pollers().is_active(&deposit.deposit_ref));

        // replayed callback changes nothing
        let again = h
            .engine
            .handle_payment_callback(&deposit.deposit_ref)
            .await
            .unwrap();
        assert_eq!(again, ReconcileOutcome::AlreadyTerminal);
        assert_eq!(
            h.store.get_user(user.id).await.unwrap().unwrap().balance,
            Money::from(50_000)
        );
    }

    #[tokio::test]
    async fn test_bad_reference() {
        let h = harness(0).await;
        assert!(matches!(
            h.engine.get_order_status("nope").await.unwrap_err(),
            EngineError::InvalidReference(_)
        ));
        assert!(matches!(
            h.engine.handle_payment_callback("ORD-123").await.unwrap_err(),
            EngineError::InvalidReference(_)
        ));
    }
}
