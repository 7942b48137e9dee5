//! Notification Dispatcher
//!
//! Announces terminal orders and deposits over every configured channel.
//! Delivery is best effort per channel; [`NotificationDispatcher::notify`]
//! reports success when at least one channel accepted the message (or none
//! are configured). The caller then flips `is_notified`; anything not
//! acknowledged is retried by the sweep.

#[cfg(any(test, feature = "mock-gateway"))]
pub mod recording;
pub mod webhook;

#[cfg(any(test, feature = "mock-gateway"))]
pub use recording::RecordingChannel;
pub use webhook::WebhookChannel;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::core_types::{Money, UserId};
use crate::models::{Deposit, Order};

#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("Channel transport error: {0}")]
    Transport(String),

    #[error("Channel returned HTTP {status}")]
    Http { status: u16 },

    #[error("Channel misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => NotifyError::Http {
                status: status.as_u16(),
            },
            None => NotifyError::Transport(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Order,
    Deposit,
}

/// Outbound message payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub reference: String,
    pub status: String,
    /// `"<product> x<qty>"` for orders, amount and channel for deposits
    pub summary: String,
    pub amount: Money,
    pub recipient: Option<UserId>,
    /// Redeemed codes; only private channels receive them
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
}

impl Notification {
    pub fn for_order(order: &Order, product_name: &str) -> Self {
        Self {
            kind: NotificationKind::Order,
            reference: order.order_ref.clone(),
            status: order.status.as_str().to_string(),
            summary: format!("{} x{}", product_name, order.quantity),
            amount: order.total_amount,
            recipient: order.user_id,
            codes: order.assigned_codes.clone(),
        }
    }

    pub fn for_deposit(deposit: &Deposit) -> Self {
        Self {
            kind: NotificationKind::Deposit,
            reference: deposit.deposit_ref.clone(),
            status: deposit.status.as_str().to_string(),
            summary: format!("Deposit {} via {}", deposit.amount, deposit.channel),
            amount: deposit.amount,
            recipient: Some(deposit.user_id),
            codes: Vec::new(),
        }
    }

    /// Copy without codes, for channels that are not private to the buyer
    pub fn redacted(&self) -> Self {
        Self {
            codes: Vec::new(),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a send on this channel acknowledges the notification.
    /// Audit-only channels that cannot fail return `false`.
    fn acknowledges(&self) -> bool {
        true
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the application log. Codes are never logged.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn acknowledges(&self) -> bool {
        false
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            kind = ?notification.kind,
            reference = %notification.reference,
            status = %notification.status,
            summary = %notification.summary,
            recipient = ?notification.recipient,
            codes = notification.codes.len(),
            "Notification"
        );
        Ok(())
    }
}

pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    pub fn from_config(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if config.log_channel {
            channels.push(Arc::new(LogChannel));
        }
        for webhook in &config.webhooks {
            channels.push(Arc::new(WebhookChannel::new(webhook)?));
        }
        Ok(Self::new(channels))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Attempt every channel concurrently. `true` if at least one
    /// acknowledging channel delivered, or there is none to wait for.
    pub async fn notify(&self, notification: &Notification) -> bool {
        if self.channels.is_empty() {
            return true;
        }

        let results = join_all(self.channels.iter().map(|c| c.send(notification))).await;

        let mut acknowledging = 0;
        let mut delivered = 0;
        for (channel, result) in self.channels.iter().zip(results) {
            if channel.acknowledges() {
                acknowledging += 1;
            }
            match result {
                Ok(()) if channel.acknowledges() => delivered += 1,
                Ok(()) => {}
                Err(e) => warn!(
                    channel = channel.name(),
                    reference = %notification.reference,
                    error = %e,
                    "Notification channel failed"
                ),
            }
        }
        acknowledging == 0 || delivered > 0
    }
}
