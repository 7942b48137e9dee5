//! Payment Gateway Client
//!
//! Thin adapter over the external provider. The only business decision made
//! here is the mapping of provider statuses onto [`GatewayStatus`]; every
//! transport problem surfaces as a [`GatewayError`], which callers treat as
//! "try again next tick" and never as expiry.

pub mod http;
#[cfg(any(test, feature = "mock-gateway"))]
pub mod mock;

pub use http::HttpGateway;
#[cfg(any(test, feature = "mock-gateway"))]
pub use mock::MockGateway;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::core_types::Money;
use crate::models::PaymentInstructions;

/// Definitive payment status reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayStatus {
    Paid,
    /// Not paid yet. Not an error.
    Pending,
    /// The provider-side charge lapsed
    Expired,
    /// Declined, cancelled or failed at the provider
    Declined,
}

impl GatewayStatus {
    /// Map a provider status string.
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PAID" | "SETTLED" | "SUCCESS" => Some(GatewayStatus::Paid),
            "UNPAID" | "PENDING" => Some(GatewayStatus::Pending),
            "EXPIRED" => Some(GatewayStatus::Expired),
            "FAILED" | "DECLINED" | "CANCELLED" | "CANCELED" | "REFUND" => {
                Some(GatewayStatus::Declined)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Paid => "PAID",
            GatewayStatus::Pending => "PENDING",
            GatewayStatus::Expired => "EXPIRED",
            GatewayStatus::Declined => "DECLINED",
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway failures. All variants are transient from the engine's view.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Gateway request timed out")]
    Timeout,

    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed gateway response: {0}")]
    Malformed(String),

    #[error("Gateway rejected request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::Malformed(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Payment gateway adapter.
///
/// `reference` is the order/deposit reference and acts as the provider-side
/// idempotency key: creating a charge twice for one reference must not
/// produce two payable charges.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    /// Open a charge and return what the payer needs to complete it
    async fn create_charge(
        &self,
        reference: &str,
        amount: Money,
        channel: &str,
    ) -> Result<PaymentInstructions, GatewayError>;

    /// Look up the current status of a charge
    async fn check_status(
        &self,
        reference: &str,
        amount: Money,
        channel: &str,
    ) -> Result<GatewayStatus, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(GatewayStatus::from_provider("PAID"), Some(GatewayStatus::Paid));
        assert_eq!(GatewayStatus::from_provider("unpaid"), Some(GatewayStatus::Pending));
        assert_eq!(
            GatewayStatus::from_provider(" Expired "),
            Some(GatewayStatus::Expired)
        );
        assert_eq!(
            GatewayStatus::from_provider("FAILED"),
            Some(GatewayStatus::Declined)
        );
        assert_eq!(GatewayStatus::from_provider("WHATEVER"), None);
    }
}
