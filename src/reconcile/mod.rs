//! Reconciliation
//!
//! Brings pending orders and deposits in line with the gateway:
//! - [`Reconciler`]: one check-and-apply step for one record, shared by every
//!   trigger (poller tick, sweep, payment callback)
//! - [`poller::PollerRegistry`]: per-record active pollers
//! - [`sweep::Sweeper`]: the periodic global pass
//! - [`expiry::ExpirySweeper`]: forces overdue records to a terminal state
//!
//! Triggers may overlap freely. Every write goes through the compare-and-swap
//! transitions in [`crate::state_machine`], so at most one of them applies.

pub mod expiry;
pub mod poller;
pub mod sweep;

pub use expiry::{ExpiryReport, ExpirySweeper};
pub use poller::PollerRegistry;
pub use sweep::{SweepReport, Sweeper};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core_types::RecordRef;
use crate::error::EngineError;
use crate::models::{Deposit, Order};
use crate::notify::{Notification, NotificationDispatcher};
use crate::payment::{GatewayError, GatewayStatus, PaymentGateway};
use crate::state_machine::{
    TransitionOutcome, apply_deposit_expiry, apply_deposit_failure, apply_deposit_success,
    apply_order_expiry, apply_order_failure, apply_order_success,
};
use crate::store::ResourceStore;

/// What a reconcile step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This step moved the record to SUCCESS
    Paid,
    /// This step moved the record to FAILED
    Declined,
    /// This step moved the record to EXPIRED
    Expired,
    /// Gateway still reports unpaid and the deadline has not passed
    StillPending,
    /// Record was already terminal, or a concurrent step won the race
    AlreadyTerminal,
}

impl ReconcileOutcome {
    /// The record needs no further polling
    pub fn is_final(&self) -> bool {
        !matches!(self, ReconcileOutcome::StillPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Paid => "PAID",
            ReconcileOutcome::Declined => "DECLINED",
            ReconcileOutcome::Expired => "EXPIRED",
            ReconcileOutcome::StillPending => "STILL_PENDING",
            ReconcileOutcome::AlreadyTerminal => "ALREADY_TERMINAL",
        }
    }
}

fn outcome_of<T>(outcome: TransitionOutcome<T>, applied: ReconcileOutcome) -> ReconcileOutcome {
    if outcome.is_applied() {
        applied
    } else {
        ReconcileOutcome::AlreadyTerminal
    }
}

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<NotificationDispatcher>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    // ========================================================================
    // Gateway checks
    // ========================================================================

    /// Balance-method orders have no gateway charge and count as paid.
    async fn check_order(&self, order: &Order) -> Result<GatewayStatus, GatewayError> {
        match order.payment_method.channel() {
            None => Ok(GatewayStatus::Paid),
            Some(channel) => {
                self.gateway
                    .check_status(&order.order_ref, order.total_amount, channel)
                    .await
            }
        }
    }

    async fn check_deposit(&self, deposit: &Deposit) -> Result<GatewayStatus, GatewayError> {
        self.gateway
            .check_status(&deposit.deposit_ref, deposit.amount, &deposit.channel)
            .await
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// One reconcile step for a pending order.
    ///
    /// Gateway errors propagate unchanged and leave the order untouched.
    pub async fn reconcile_order(
        &self,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        if order.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal);
        }

        match self.check_order(order).await? {
            GatewayStatus::Paid => self.settle_order(order).await,
            GatewayStatus::Declined => {
                let outcome = apply_order_failure(self.store.as_ref(), order).await?;
                if let TransitionOutcome::Applied(updated) = &outcome {
                    self.announce_order(updated).await;
                }
                Ok(outcome_of(outcome, ReconcileOutcome::Declined))
            }
            // the deadline alone decides expiry; an early gateway EXPIRED waits for it
            GatewayStatus::Pending | GatewayStatus::Expired if order.is_overdue(now) => {
                self.close_expired_order(order).await
            }
            GatewayStatus::Pending | GatewayStatus::Expired => Ok(ReconcileOutcome::StillPending),
        }
    }

    /// Final check for an overdue order: paid settles it, anything else
    /// (including a gateway error) expires it.
    pub async fn expire_order(&self, order: &Order) -> Result<ReconcileOutcome, EngineError> {
        if order.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal);
        }

        match self.check_order(order).await {
            Ok(GatewayStatus::Paid) => match self.settle_order(order).await {
                Err(EngineError::InsufficientBalance) => {
                    debug!(order_ref = %order.order_ref, "Balance still short at deadline");
                }
                other => return other,
            },
            Ok(status) => {
                debug!(order_ref = %order.order_ref, gateway_status = %status, "Final check not paid");
            }
            Err(e) => {
                warn!(order_ref = %order.order_ref, error = %e, "Final gateway check failed, expiring");
            }
        }
        self.close_expired_order(order).await
    }

    /// Close a pending order ahead of its deadline, the same way the expiry
    /// pass would, without consulting the gateway.
    pub async fn cancel_order(
        &self,
        order: &Order,
    ) -> Result<TransitionOutcome<Order>, EngineError> {
        let outcome = apply_order_expiry(self.store.as_ref(), order).await?;
        if let TransitionOutcome::Applied(updated) = &outcome {
            self.announce_order(updated).await;
        }
        Ok(outcome)
    }

    async fn settle_order(&self, order: &Order) -> Result<ReconcileOutcome, EngineError> {
        let outcome = apply_order_success(self.store.as_ref(), order).await?;
        if let TransitionOutcome::Applied(updated) = &outcome {
            self.announce_order(updated).await;
        }
        Ok(outcome_of(outcome, ReconcileOutcome::Paid))
    }

    async fn close_expired_order(&self, order: &Order) -> Result<ReconcileOutcome, EngineError> {
        let outcome = self.cancel_order(order).await?;
        Ok(outcome_of(outcome, ReconcileOutcome::Expired))
    }

    /// Dispatch the order's notification and acknowledge it on success.
    ///
    /// Returns whether this call flipped `is_notified`.
    pub async fn notify_order(&self, order: &Order) -> Result<bool, EngineError> {
        let product_name = match self.store.get_product(order.product_id).await? {
            Some(product) => product.name,
            None => format!("product #{}", order.product_id),
        };
        let notification = Notification::for_order(order, &product_name);
        if !self.notifier.notify(&notification).await {
            return Ok(false);
        }
        Ok(self
            .store
            .mark_order_notified(order.id, order.status)
            .await?)
    }

    /// Immediate best-effort notification after a transition; the sweep
    /// retries whatever this misses.
    async fn announce_order(&self, order: &Order) {
        if let Err(e) = self.notify_order(order).await {
            warn!(order_ref = %order.order_ref, error = %e, "Notification deferred to sweep");
        }
    }

    // ========================================================================
    // Deposits
    // ========================================================================

    pub async fn reconcile_deposit(
        &self,
        deposit: &Deposit,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        if deposit.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal);
        }

        match self.check_deposit(deposit).await? {
            GatewayStatus::Paid => self.settle_deposit(deposit).await,
            GatewayStatus::Declined => {
                let outcome = apply_deposit_failure(self.store.as_ref(), deposit).await?;
                if let TransitionOutcome::Applied(updated) = &outcome {
                    self.announce_deposit(updated).await;
                }
                Ok(outcome_of(outcome, ReconcileOutcome::Declined))
            }
            GatewayStatus::Pending | GatewayStatus::Expired if deposit.is_overdue(now) => {
                self.close_expired_deposit(deposit).await
            }
            GatewayStatus::Pending | GatewayStatus::Expired => Ok(ReconcileOutcome::StillPending),
        }
    }

    /// Final check for an overdue deposit: paid credits it, anything else
    /// expires it.
    pub async fn expire_deposit(&self, deposit: &Deposit) -> Result<ReconcileOutcome, EngineError> {
        if deposit.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal);
        }

        match self.check_deposit(deposit).await {
            Ok(GatewayStatus::Paid) => return self.settle_deposit(deposit).await,
            Ok(status) => {
                debug!(deposit_ref = %deposit.deposit_ref, gateway_status = %status, "Final check not paid");
            }
            Err(e) => {
                warn!(deposit_ref = %deposit.deposit_ref, error = %e, "Final gateway check failed, expiring");
            }
        }
        self.close_expired_deposit(deposit).await
    }

    async fn settle_deposit(&self, deposit: &Deposit) -> Result<ReconcileOutcome, EngineError> {
        let outcome = apply_deposit_success(self.store.as_ref(), deposit).await?;
        if let TransitionOutcome::Applied(updated) = &outcome {
            self.announce_deposit(updated).await;
        }
        Ok(outcome_of(outcome, ReconcileOutcome::Paid))
    }

    async fn close_expired_deposit(
        &self,
        deposit: &Deposit,
    ) -> Result<ReconcileOutcome, EngineError> {
        let outcome = apply_deposit_expiry(self.store.as_ref(), deposit).await?;
        if let TransitionOutcome::Applied(updated) = &outcome {
            self.announce_deposit(updated).await;
        }
        Ok(outcome_of(outcome, ReconcileOutcome::Expired))
    }

    pub async fn notify_deposit(&self, deposit: &Deposit) -> Result<bool, EngineError> {
        let notification = Notification::for_deposit(deposit);
        if !self.notifier.notify(&notification).await {
            return Ok(false);
        }
        Ok(self
            .store
            .mark_deposit_notified(deposit.id, deposit.status)
            .await?)
    }

    async fn announce_deposit(&self, deposit: &Deposit) {
        if let Err(e) = self.notify_deposit(deposit).await {
            warn!(deposit_ref = %deposit.deposit_ref, error = %e, "Notification deferred to sweep");
        }
    }

    // ========================================================================
    // By reference
    // ========================================================================

    /// Load the record behind `reference` and run one reconcile step on it
    pub async fn reconcile_ref(
        &self,
        reference: &RecordRef,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        if reference.is_order() {
            let order = self
                .store
                .get_order_by_ref(reference.as_str())
                .await?
                .ok_or_else(|| EngineError::OrderNotFound(reference.to_string()))?;
            self.reconcile_order(&order, now).await
        } else {
            let deposit = self
                .store
                .get_deposit_by_ref(reference.as_str())
                .await?
                .ok_or_else(|| EngineError::DepositNotFound(reference.to_string()))?;
            self.reconcile_deposit(&deposit, now).await
        }
    }
}
