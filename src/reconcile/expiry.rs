//! Expiry pass
//!
//! Overdue pending records get one final gateway check. Paid settles; any
//! other answer, or no answer at all, expires the record and releases its
//! stock. Each record is handled on its own: one failure never stops the pass.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};

use super::{ReconcileOutcome, Reconciler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub expired: usize,
    /// Paid at the last moment and settled instead
    pub settled: usize,
    pub errors: usize,
}

impl ExpiryReport {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Expired => self.expired += 1,
            ReconcileOutcome::Paid => self.settled += 1,
            _ => {}
        }
    }
}

pub struct ExpirySweeper {
    reconciler: Arc<Reconciler>,
    batch_size: i64,
}

impl ExpirySweeper {
    pub fn new(reconciler: Arc<Reconciler>, batch_size: i64) -> Self {
        Self {
            reconciler,
            batch_size,
        }
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> ExpiryReport {
        let mut report = ExpiryReport::default();
        let store = self.reconciler.store();

        match store.overdue_orders(now, self.batch_size).await {
            Ok(orders) => {
                for order in orders {
                    match self.reconciler.expire_order(&order).await {
                        Ok(outcome) => report.record(outcome),
                        Err(e) => {
                            report.errors += 1;
                            error!(order_ref = %order.order_ref, error = %e, "Expiry failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load overdue orders");
            }
        }

        match store.overdue_deposits(now, self.batch_size).await {
            Ok(deposits) => {
                for deposit in deposits {
                    match self.reconciler.expire_deposit(&deposit).await {
                        Ok(outcome) => report.record(outcome),
                        Err(e) => {
                            report.errors += 1;
                            error!(deposit_ref = %deposit.deposit_ref, error = %e, "Expiry failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load overdue deposits");
            }
        }

        if report.expired > 0 || report.settled > 0 {
            info!(
                expired = report.expired,
                settled = report.settled,
                errors = report.errors,
                "Expiry pass"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Money, RecordRef};
    use crate::models::{NewDeposit, NewOrder, OrderStatus, PaymentMethod, Role};
    use crate::notify::NotificationDispatcher;
    use crate::payment::{GatewayError, GatewayStatus, MockGateway};
    use crate::reservation::reserve_in;
    use crate::store::{MemoryStore, ResourceStore};

    #[tokio::test]
    async fn test_pass_expires_and_settles() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            gateway.clone(),
            Arc::new(NotificationDispatcher::new(Vec::new())),
        ));
        let product = store.create_product("Voucher", Money::from(10)).await.unwrap();
        let codes: Vec<String> = (0..4).map(|i| format!("C{i}")).collect();
        store.import_stock(product.id, &codes).await.unwrap();
        let user = store.create_user(Role::Member, Money::ZERO).await.unwrap();

        let past = Utc::now() - chrono::Duration::seconds(5);
        let mut refs = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for _ in 0..2 {
            let reference = RecordRef::new_order().to_string();
            let order = tx
                .insert_order(&NewOrder {
                    order_ref: reference.clone(),
                    user_id: None,
                    product_id: product.id,
                    quantity: 2,
                    price: Money::from(10),
                    total_amount: Money::from(20),
                    payment_method: PaymentMethod::parse("QRIS"),
                    expired_at: past,
                })
                .await
                .unwrap();
            reserve_in(tx.as_mut(), order.id, product.id, 2).await.unwrap();
            refs.push(reference);
        }
        let deposit = tx
            .insert_deposit(&NewDeposit {
                deposit_ref: RecordRef::new_deposit().to_string(),
                user_id: user.id,
                amount: Money::from(100),
                channel: "QRIS".to_string(),
                expired_at: past,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        gateway.set_status(&refs[0], GatewayStatus::Paid);
        gateway.push_response(&refs[1], Err(GatewayError::Timeout));

        let report = ExpirySweeper::new(reconciler, 100).run_pass(Utc::now()).await;
        assert_eq!(report.settled, 1);
        assert_eq!(report.expired, 2);
        assert_eq!(report.errors, 0);

        let paid = store.get_order_by_ref(&refs[0]).await.unwrap().unwrap();
        let lapsed = store.get_order_by_ref(&refs[1]).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Success);
        assert_eq!(lapsed.status, OrderStatus::Expired);

        let counts = store.stock_counts(product.id).await.unwrap();
        assert_eq!((counts.ready, counts.reserved, counts.sold), (2, 0, 2));
        assert!(store.get_deposit(deposit.id).await.unwrap().unwrap().status.is_terminal());
    }
}
