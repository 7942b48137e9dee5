use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::core_types::Money;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub api: ApiConfig,
    /// PostgreSQL connection URL. Absent: in-memory store (dev only).
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Required in `X-Admin-Token` for admin endpoints. Unset: admin endpoints disabled.
    #[serde(default)]
    pub admin_token: Option<String>,
}

/// Reconciliation timing and business limits
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Active poller tick
    pub poll_interval_ms: u64,
    /// Global sweep tick
    pub sweep_interval_ms: u64,
    /// Order payment window; `expired_at = created_at + window`
    pub order_window_secs: u64,
    /// Deposit payment window
    pub deposit_window_secs: u64,
    /// Max records examined per sweep pass
    pub batch_size: i64,
    pub max_order_quantity: i32,
    pub min_deposit: Money,
    pub max_deposit: Money,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            sweep_interval_ms: 15_000,
            order_window_secs: 15 * 60,
            deposit_window_secs: 60 * 60,
            batch_size: 100,
            max_order_quantity: 100,
            min_deposit: Money::from(10_000),
            max_deposit: Money::from(10_000_000),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn order_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.order_window_secs as i64)
    }

    pub fn deposit_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deposit_window_secs as i64)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentConfig {
    /// `http` or `mock`
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            base_url: "http://localhost:9090/api".to_string(),
            api_key: String::new(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotifyConfig {
    /// Log every notification through `tracing`
    pub log_channel: bool,
    #[serde(default)]
    pub webhooks: Vec<WebhookChannelConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log_channel: true,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebhookChannelConfig {
    pub name: String,
    pub url: String,
    /// Only private/direct channels may carry redeemed codes
    #[serde(default)]
    pub include_codes: bool,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.poll_interval_ms == 0 || engine.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll and sweep intervals must be non-zero".to_string(),
            ));
        }
        if engine.batch_size <= 0 || engine.max_order_quantity <= 0 {
            return Err(ConfigError::Invalid(
                "batch_size and max_order_quantity must be positive".to_string(),
            ));
        }
        if engine.min_deposit > engine.max_deposit {
            return Err(ConfigError::Invalid(
                "min_deposit exceeds max_deposit".to_string(),
            ));
        }
        match self.payment.provider.as_str() {
            "http" | "mock" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "unknown payment provider: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_YAML: &str = r#"
log_level: "info"
log_dir: "./logs"
log_file: "codevault.log"
use_json: false
rotation: "daily"
api:
  host: "0.0.0.0"
  port: 8080
  admin_token: "dev-admin"
engine:
  poll_interval_ms: 5000
  sweep_interval_ms: 15000
  order_window_secs: 900
  deposit_window_secs: 3600
  batch_size: 50
  max_order_quantity: 10
  min_deposit: 10000
  max_deposit: "5000000"
payment:
  provider: "http"
  base_url: "https://pay.example/api"
  api_key: "secret"
  timeout_ms: 8000
notify:
  log_channel: true
  webhooks:
    - name: "public-feed"
      url: "https://hooks.example/public"
    - name: "audit"
      url: "https://hooks.example/audit"
      include_codes: true
"#;

    #[test]
    fn test_config_deserialize() {
        let config = AppConfig::from_yaml(DEV_YAML).unwrap();

        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.admin_token.as_deref(), Some("dev-admin"));
        assert!(config.postgres_url.is_none());
        assert_eq!(config.engine.batch_size, 50);
        assert_eq!(config.engine.min_deposit, Money::from(10_000));
        assert_eq!(config.engine.max_deposit, Money::from(5_000_000));
        assert_eq!(config.engine.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.engine.order_window(), chrono::Duration::minutes(15));
        assert_eq!(config.payment.provider, "http");
        assert_eq!(config.notify.webhooks.len(), 2);
        assert!(!config.notify.webhooks[0].include_codes);
        assert!(config.notify.webhooks[1].include_codes);
        assert_eq!(config.notify.webhooks[0].timeout_ms, 5_000);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let yaml = r#"
log_level: "debug"
log_dir: "./logs"
log_file: "codevault.log"
use_json: true
rotation: "never"
api:
  host: "127.0.0.1"
  port: 9000
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.sweep_interval(), Duration::from_secs(15));
        assert_eq!(config.payment.provider, "mock");
        assert!(config.notify.log_channel);
        assert!(config.api.admin_token.is_none());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = DEV_YAML.replace("provider: \"http\"", "provider: \"carrier-pigeon\"");
        assert!(matches!(
            AppConfig::from_yaml(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }
}
