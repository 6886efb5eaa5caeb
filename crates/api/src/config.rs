//! Server configuration, read from the environment

use schoolpay_ledger::{phone, propagator, ChannelRegistry, LedgerConfig, LedgerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub run_migrations: bool,
    pub phone_country_code: String,
    pub payment_channels: ChannelRegistry,
    /// Bearer token for staff endpoints; empty disables them
    pub staff_api_token: String,
    pub pending_alert_webhook_url: Option<String>,
    pub propagation_concurrency: usize,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let payment_channels = match optional("PAYMENT_CHANNELS") {
            Some(json) => ChannelRegistry::from_json(&json).map_err(|e| ConfigError::Invalid {
                key: "PAYMENT_CHANNELS",
                message: match e {
                    LedgerError::Configuration(m) => m,
                    other => other.to_string(),
                },
            })?,
            None => {
                tracing::warn!("PAYMENT_CHANNELS not set - every payment will be held as OTHER");
                ChannelRegistry::default()
            }
        };

        let propagation_concurrency = match optional("PROPAGATION_CONCURRENCY") {
            Some(raw) => raw.parse::<usize>().map_err(|e| ConfigError::Invalid {
                key: "PROPAGATION_CONCURRENCY",
                message: e.to_string(),
            })?,
            None => propagator::DEFAULT_CONCURRENCY,
        };

        let run_migrations = optional("RUN_MIGRATIONS")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            database_direct_url: optional("DATABASE_DIRECT_URL"),
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            run_migrations,
            phone_country_code: optional("PHONE_COUNTRY_CODE")
                .unwrap_or_else(|| phone::DEFAULT_COUNTRY_CODE.to_string()),
            payment_channels,
            staff_api_token: optional("STAFF_API_TOKEN").unwrap_or_default(),
            pending_alert_webhook_url: optional("PENDING_ALERT_WEBHOOK_URL"),
            propagation_concurrency,
            allowed_origins: optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    /// Settings handed to the ledger services
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            phone_country_code: self.phone_country_code.clone(),
            channels: self.payment_channels.clone(),
            propagation_concurrency: self.propagation_concurrency,
        }
    }
}

/// Set and non-blank, trimmed
fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
