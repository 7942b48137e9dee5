//! Periodic sweep
//!
//! Pass order per tick: expiry → pending orders → pending deposits →
//! notification retry. A single [`Sweeper`] owns its "already running" flag;
//! an overlapping [`Sweeper::sweep_once`] returns a skipped report instead of
//! running twice.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{ExpiryReport, ExpirySweeper, ReconcileOutcome, Reconciler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another pass was still running
    pub skipped: bool,
    pub expiry: ExpiryReport,
    pub orders_checked: usize,
    pub orders_settled: usize,
    pub deposits_checked: usize,
    pub deposits_settled: usize,
    pub notified: usize,
    pub errors: usize,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Clears the running flag when the pass ends, even by panic
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Sweeper {
    reconciler: Arc<Reconciler>,
    expiry: ExpirySweeper,
    interval: Duration,
    batch_size: i64,
    running: AtomicBool,
}

impl Sweeper {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration, batch_size: i64) -> Self {
        Self {
            expiry: ExpirySweeper::new(reconciler.clone(), batch_size),
            reconciler,
            interval,
            batch_size,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tick until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, batch_size = self.batch_size, "Sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    if report.errors > 0 {
                        warn!(errors = report.errors, "Sweep finished with errors");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Sweeper stopped");
    }

    pub async fn sweep_once(&self) -> SweepReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sweep already running, skipped");
            return SweepReport::skipped();
        }
        let _guard = RunningGuard(&self.running);

        let mut report = SweepReport {
            expiry: self.expiry.run_pass(Utc::now()).await,
            ..SweepReport::default()
        };
        report.errors += report.expiry.errors;

        self.sweep_orders(&mut report).await;
        self.sweep_deposits(&mut report).await;
        self.retry_notifications(&mut report).await;

        debug!(?report, "Sweep done");
        report
    }

    async fn sweep_orders(&self, report: &mut SweepReport) {
        let orders = match self.reconciler.store().pending_orders(self.batch_size).await {
            Ok(orders) => orders,
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load pending orders");
                return;
            }
        };

        for order in orders {
            report.orders_checked += 1;
            match self.reconciler.reconcile_order(&order, Utc::now()).await {
                Ok(ReconcileOutcome::Paid) => report.orders_settled += 1,
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(order_ref = %order.order_ref, error = %e, "Order check failed");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(order_ref = %order.order_ref, error = %e, "Order reconcile failed");
                }
            }
        }
    }

    async fn sweep_deposits(&self, report: &mut SweepReport) {
        let deposits = match self.reconciler.store().pending_deposits(self.batch_size).await {
            Ok(deposits) => deposits,
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load pending deposits");
                return;
            }
        };

        for deposit in deposits {
            report.deposits_checked += 1;
            match self.reconciler.reconcile_deposit(&deposit, Utc::now()).await {
                Ok(ReconcileOutcome::Paid) => report.deposits_settled += 1,
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(deposit_ref = %deposit.deposit_ref, error = %e, "Deposit check failed");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(deposit_ref = %deposit.deposit_ref, error = %e, "Deposit reconcile failed");
                }
            }
        }
    }

    async fn retry_notifications(&self, report: &mut SweepReport) {
        let store = self.reconciler.store();

        match store.unnotified_orders(self.batch_size).await {
            Ok(orders) => {
                for order in orders {
                    match self.reconciler.notify_order(&order).await {
                        Ok(true) => report.notified += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.errors += 1;
                            error!(order_ref = %order.order_ref, error = %e, "Notification retry failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load unnotified orders");
            }
        }

        match store.unnotified_deposits(self.batch_size).await {
            Ok(deposits) => {
                for deposit in deposits {
                    match self.reconciler.notify_deposit(&deposit).await {
                        Ok(true) => report.notified += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.errors += 1;
                            error!(deposit_ref = %deposit.deposit_ref, error = %e, "Notification retry failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load unnotified deposits");
            }
        }
    }
}
