//! Active pollers
//!
//! One task per gateway-paid record, ticking every `poll_interval` until the
//! record is final, its deadline passes, or it is cancelled. The registry is
//! keyed by reference, so a record never has two pollers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::core_types::RecordRef;

struct PollerHandle {
    id: u64,
    cancel: watch::Sender<bool>,
}

pub struct PollerRegistry {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    active: Arc<DashMap<String, PollerHandle>>,
    next_id: AtomicU64,
}

impl PollerRegistry {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            active: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start polling `reference` until `deadline`.
    ///
    /// Returns `false` if a poller for this reference is already running.
    pub fn spawn(&self, reference: RecordRef, deadline: DateTime<Utc>) -> bool {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        match self.active.entry(reference.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(PollerHandle {
                    id,
                    cancel: cancel_tx,
                });
            }
        }

        let reconciler = self.reconciler.clone();
        let active = self.active.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            poll_loop(&reconciler, &reference, deadline, interval, cancel_rx).await;
            active.remove_if(reference.as_str(), |_, handle| handle.id == id);
        });

        debug!(id, "Poller started");
        true
    }

    /// Stop the poller for `reference`. Returns whether one was running.
    pub fn cancel(&self, reference: &str) -> bool {
        match self.active.remove(reference) {
            Some((_, handle)) => {
                let _ = handle.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Stop every poller (shutdown)
    pub fn cancel_all(&self) {
        let count = self.active.len();
        self.active.retain(|_, handle| {
            let _ = handle.cancel.send(true);
            false
        });
        if count > 0 {
            info!(count, "Pollers cancelled");
        }
    }

    pub fn is_active(&self, reference: &str) -> bool {
        self.active.contains_key(reference)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

async fn poll_loop(
    reconciler: &Reconciler,
    reference: &RecordRef,
    deadline: DateTime<Utc>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately; the charge was just created
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                match reconciler.reconcile_ref(reference, now).await {
                    Ok(outcome) if outcome.is_final() => {
                        debug!(reference = %reference, ?outcome, "Poller finished");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        warn!(reference = %reference, error = %e, "Poll failed, will retry");
                    }
                    Err(e) => {
                        warn!(reference = %reference, error = %e, "Poll failed, stopping");
                        break;
                    }
                }
                if now >= deadline {
                    debug!(reference = %reference, "Deadline passed, leaving to sweep");
                    break;
                }
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(reference = %reference, "Poller cancelled");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Money;
    use crate::models::{NewOrder, OrderStatus, PaymentMethod};
    use crate::notify::NotificationDispatcher;
    use crate::payment::{GatewayStatus, MockGateway};
    use crate::reservation::reserve_in;
    use crate::store::{MemoryStore, ResourceStore};

    async fn setup(interval_ms: u64) -> (Arc<MemoryStore>, Arc<MockGateway>, PollerRegistry, RecordRef) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            gateway.clone(),
            Arc::new(NotificationDispatcher::new(Vec::new())),
        ));

        let product = store.create_product("Voucher", Money::from(10)).await.unwrap();
        store
            .import_stock(product.id, &["X".to_string()])
            .await
            .unwrap();

        let reference = RecordRef::new_order();
        let mut tx = store.begin().await.unwrap();
        let order = tx
            .insert_order(&NewOrder {
                order_ref: reference.to_string(),
                user_id: None,
                product_id: product.id,
                quantity: 1,
                price: Money::from(10),
                total_amount: Money::from(10),
                payment_method: PaymentMethod::parse("QRIS"),
                expired_at: Utc::now() + chrono::Duration::minutes(15),
            })
            .await
            .unwrap();
        reserve_in(tx.as_mut(), order.id, product.id, 1).await.unwrap();
        tx.commit().await.unwrap();

        let registry = PollerRegistry::new(reconciler, Duration::from_millis(interval_ms));
        (store, gateway, registry, reference)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_poller_settles_and_exits() {
        let (store, gateway, registry, reference) = setup(20).await;
        let deadline = Utc::now() + chrono::Duration::minutes(15);

        assert!(registry.spawn(reference.clone(), deadline));
        assert!(!registry.spawn(reference.clone(), deadline), "no duplicate pollers");

        gateway.set_status(reference.as_str(), GatewayStatus::Paid);
        wait_until(|| !registry.is_active(reference.as_str())).await;

        let order = store
            .get_order_by_ref(reference.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Success);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let (_store, gateway, registry, reference) = setup(20).await;
        let deadline = Utc::now() + chrono::Duration::minutes(15);

        registry.spawn(reference.clone(), deadline);
        wait_until(|| gateway.check_count_for(reference.as_str()) >= 1).await;

        assert!(registry.cancel(reference.as_str()));
        assert_eq!(registry.active_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_cancel = gateway.check_count_for(reference.as_str());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.check_count_for(reference.as_str()), after_cancel);
    }

    #[tokio::test]
    async fn test_deadline_stops_polling() {
        let (_store, gateway, registry, reference) = setup(20).await;

        registry.spawn(reference.clone(), Utc::now());
        wait_until(|| !registry.is_active(reference.as_str())).await;
        assert_eq!(gateway.check_count_for(reference.as_str()), 1);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (_store, _gateway, registry, reference) = setup(1_000).await;
        let deadline = Utc::now() + chrono::Duration::minutes(15);

        registry.spawn(reference.clone(), deadline);
        registry.spawn(RecordRef::new_deposit(), deadline);
        assert_eq!(registry.active_count(), 2);

        registry.cancel_all();
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.cancel(reference.as_str()));
    }
}
