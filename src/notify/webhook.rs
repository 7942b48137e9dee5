//! JSON webhook channel
//!
//! POSTs the notification to a fixed URL. Codes are stripped unless the
//! channel is configured as private (`include_codes: true`).

use async_trait::async_trait;
use std::time::Duration;

use super::{Notification, NotificationChannel, NotifyError};
use crate::config::WebhookChannelConfig;

pub struct WebhookChannel {
    name: String,
    url: String,
    include_codes: bool,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookChannelConfig) -> Result<Self, NotifyError> {
        if config.url.is_empty() {
            return Err(NotifyError::Config(format!(
                "webhook {} has no url",
                config.name
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotifyError::Config(e.to_string()))?;

        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            include_codes: config.include_codes,
            client,
        })
    }

    fn payload(&self, notification: &Notification) -> Notification {
        if self.include_codes {
            notification.clone()
        } else {
            notification.redacted()
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(&self.payload(notification))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
