//! Scriptable in-process gateway for tests and local development
//!
//! Responses are resolved per reference in this order: queued one-shot
//! responses, then the sticky status set with [`MockGateway::set_status`],
//! then the default status.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{GatewayError, GatewayStatus, PaymentGateway};
use crate::core_types::Money;
use crate::models::PaymentInstructions;

type Scripted = Result<GatewayStatus, GatewayError>;

pub struct MockGateway {
    default_status: Mutex<GatewayStatus>,
    sticky: Mutex<HashMap<String, GatewayStatus>>,
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<HashMap<String, usize>>,
    fail_charges: AtomicBool,
    check_count: AtomicUsize,
    charge_count: AtomicUsize,
    fee: Money,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_fee(Money::ZERO)
    }

    /// Charges will ask the payer for `amount + fee`
    pub fn with_fee(fee: Money) -> Self {
        Self {
            default_status: Mutex::new(GatewayStatus::Pending),
            sticky: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            fail_charges: AtomicBool::new(false),
            check_count: AtomicUsize::new(0),
            charge_count: AtomicUsize::new(0),
            fee,
        }
    }

    pub fn set_default_status(&self, status: GatewayStatus) {
        *self
            .default_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Every subsequent check for `reference` reports `status`
    pub fn set_status(&self, reference: &str, status: GatewayStatus) {
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.to_string(), status);
    }

    /// Queue a one-shot response for `reference`
    pub fn push_response(&self, reference: &str, response: Scripted) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(reference.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_fail_charges(&self, fail: bool) {
        self.fail_charges.store(fail, Ordering::SeqCst);
    }

    pub fn check_count(&self) -> usize {
        self.check_count.load(Ordering::SeqCst)
    }

    pub fn check_count_for(&self, reference: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .copied()
            .unwrap_or(0)
    }

    pub fn charge_count(&self) -> usize {
        self.charge_count.load(Ordering::SeqCst)
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_charge(
        &self,
        reference: &str,
        amount: Money,
        channel: &str,
    ) -> Result<PaymentInstructions, GatewayError> {
        self.charge_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_charges.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("mock charge failure".to_string()));
        }

        Ok(PaymentInstructions {
            amount_charged: Some(amount + self.fee),
            amount_received: Some(amount),
            qr_payload: Some(format!("MOCKQR|{}|{}|{}", channel, reference, amount)),
            checkout_url: Some(format!("https://pay.invalid/checkout/{}", reference)),
        })
    }

    async fn check_status(
        &self,
        reference: &str,
        _amount: Money,
        _channel: &str,
    ) -> Result<GatewayStatus, GatewayError> {
        self.check_count.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(reference.to_string())
            .or_insert(0) += 1;

        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(reference)
            .and_then(|q| q.pop_front());
        if let Some(response) = queued {
            return response;
        }

        if let Some(status) = self
            .sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
        {
            return Ok(*status);
        }

        Ok(*self
            .default_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolution_order() {
        let gw = MockGateway::new();
        gw.set_status("ORD-1", GatewayStatus::Paid);
        gw.push_response("ORD-1", Err(GatewayError::Timeout));

        let amount = Money::from(10);
        assert!(matches!(
            gw.check_status("ORD-1", amount, "QRIS").await,
            Err(GatewayError::Timeout)
        ));
        assert_eq!(
            gw.check_status("ORD-1", amount, "QRIS").await.unwrap(),
            GatewayStatus::Paid
        );
        assert_eq!(
            gw.check_status("ORD-2", amount, "QRIS").await.unwrap(),
            GatewayStatus::Pending
        );
        assert_eq!(gw.check_count(), 3);
        assert_eq!(gw.check_count_for("ORD-1"), 2);
    }

    #[tokio::test]
    async fn test_charge_fee() {
        let gw = MockGateway::with_fee(Money::from(700));
        let ins = gw
            .create_charge("DEP-1", Money::from(50000), "QRIS")
            .await
            .unwrap();
        assert_eq!(ins.amount_charged, Some(Money::from(50700)));
        assert_eq!(ins.amount_received, Some(Money::from(50000)));

        gw.set_fail_charges(true);
        assert!(gw.create_charge("DEP-2", Money::from(1), "QRIS").await.is_err());
        assert_eq!(gw.charge_count(), 2);
    }
}
