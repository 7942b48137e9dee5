//! HTTP/JSON gateway adapter
//!
//! Wire contract:
//!
//! ```text
//! POST {base_url}/charges
//!      {"reference": "ORD-…", "amount": "50000", "channel": "QRIS"}
//!   -> {"success": true, "data": {"status": "UNPAID", "amount_charged": "50700",
//!       "amount_received": "50000", "qr_string": "…", "checkout_url": "…"}}
//!
//! GET  {base_url}/charges/status?reference=…&amount=…&channel=…
//!   -> {"success": true, "data": {"status": "PAID"}}
//! ```
//!
//! HTTP 5xx, timeouts and undecodable bodies are transient errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{GatewayError, GatewayStatus, PaymentGateway};
use crate::config::PaymentConfig;
use crate::core_types::Money;
use crate::models::PaymentInstructions;

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChargeRequest<'a> {
    reference: &'a str,
    amount: String,
    channel: &'a str,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize, Debug)]
struct ChargeData {
    #[serde(default)]
    amount_charged: Option<Money>,
    #[serde(default)]
    amount_received: Option<Money>,
    #[serde(default)]
    qr_string: Option<String>,
    #[serde(default)]
    checkout_url: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StatusData {
    status: String,
}

impl HttpGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn read_envelope<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.success {
            let msg = envelope.message.unwrap_or_else(|| "unknown".to_string());
            return Err(if status.is_client_error() {
                GatewayError::Rejected(msg)
            } else {
                GatewayError::Malformed(msg)
            });
        }

        envelope
            .data
            .ok_or_else(|| GatewayError::Malformed("missing data".to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_charge(
        &self,
        reference: &str,
        amount: Money,
        channel: &str,
    ) -> Result<PaymentInstructions, GatewayError> {
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ChargeRequest {
                reference,
                amount: amount.normalize().to_string(),
                channel,
            })
            .send()
            .await?;

        let data: ChargeData = Self::read_envelope(response).await?;
        debug!(reference, amount_charged = ?data.amount_charged, "Charge created");

        Ok(PaymentInstructions {
            amount_charged: data.amount_charged,
            amount_received: data.amount_received,
            qr_payload: data.qr_string,
            checkout_url: data.checkout_url,
        })
    }

    async fn check_status(
        &self,
        reference: &str,
        amount: Money,
        channel: &str,
    ) -> Result<GatewayStatus, GatewayError> {
        let amount = amount.normalize().to_string();
        let response = self
            .client
            .get(format!("{}/charges/status", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[
                ("reference", reference),
                ("amount", amount.as_str()),
                ("channel", channel),
            ])
            .send()
            .await?;

        let data: StatusData = Self::read_envelope(response).await?;
        GatewayStatus::from_provider(&data.status).ok_or_else(|| {
            warn!(reference, status = %data.status, "Unknown provider status");
            GatewayError::Malformed(format!("unknown status {}", data.status))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_envelope_deserialize() {
        let json = r#"{
            "success": true,
            "data": {
                "status": "UNPAID",
                "amount_charged": "50700",
                "amount_received": 50000,
                "qr_string": "00020101021226...",
                "checkout_url": "https://pay.example/checkout/ORD-1"
            }
        }"#;

        let env: Envelope<ChargeData> = serde_json::from_str(json).unwrap();
        assert!(env.success);
        let data = env.data.unwrap();
        assert_eq!(data.amount_charged, Some(Money::from(50700)));
        assert_eq!(data.amount_received, Some(Money::from(50000)));
        assert!(data.qr_string.is_some());
    }

    #[test]
    fn test_failure_envelope_deserialize() {
        let json = r#"{"success": false, "message": "Invalid channel"}"#;
        let env: Envelope<StatusData> = serde_json::from_str(json).unwrap();
        assert!(!env.success);
        assert_eq!(env.message.as_deref(), Some("Invalid channel"));
        assert!(env.data.is_none());
    }

    #[test]
    fn test_base_url_trimmed() {
        let config = PaymentConfig {
            provider: "http".to_string(),
            base_url: "https://pay.example/api/".to_string(),
            api_key: "k".to_string(),
            timeout_ms: 1000,
        };
        let gateway = HttpGateway::new(&config).unwrap();
        assert_eq!(gateway.base_url, "https://pay.example/api");
    }
}
