//! Configuration module for ledger-sync-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncServiceConfig {
    /// Port, service name, log level and OTLP endpoint.
    pub common: core_config::Config,
    pub database: DatabaseConfig,
    pub aggregator: AggregatorConfig,
    pub sync: SyncConfig,
    pub webhook: WebhookConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub base_url: String,
    pub client_id: String,
    pub secret: Secret<String>,
    pub timeout: Duration,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_pages: u32,
    /// Zero disables the background poller.
    pub poll_interval: Duration,
    pub transfer_tolerance_days: i64,
}

impl SyncConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: Secret<String>,
    pub tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub staleness: chrono::Duration,
    pub default_days: i64,
    pub max_days: i64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SyncServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load("ledger-sync-service")?;

        Ok(Self {
            common,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            },
            aggregator: AggregatorConfig {
                base_url: env::var("AGGREGATOR_BASE_URL")
                    .unwrap_or_else(|_| "https://sandbox.aggregator.example".to_string()),
                client_id: env::var("AGGREGATOR_CLIENT_ID").unwrap_or_default(),
                secret: Secret::new(env::var("AGGREGATOR_SECRET").unwrap_or_default()),
                timeout: Duration::from_secs(env_or("AGGREGATOR_TIMEOUT_SECS", 30)),
                page_size: env_or("AGGREGATOR_PAGE_SIZE", 500),
            },
            sync: SyncConfig {
                max_retries: env_or("SYNC_MAX_RETRIES", 4),
                initial_backoff: Duration::from_millis(env_or("SYNC_INITIAL_BACKOFF_MS", 500)),
                max_pages: env_or("SYNC_MAX_PAGES", 200),
                poll_interval: Duration::from_secs(env_or("SYNC_POLL_INTERVAL_SECS", 0)),
                transfer_tolerance_days: env_or("TRANSFER_DATE_TOLERANCE_DAYS", 3),
            },
            webhook: WebhookConfig {
                secret: Secret::new(env::var("WEBHOOK_SECRET").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("WEBHOOK_SECRET is required"))
                })?),
                tolerance_secs: env_or("WEBHOOK_TOLERANCE_SECS", 300),
            },
            history: HistoryConfig {
                staleness: chrono::Duration::hours(env_or("HISTORY_STALENESS_HOURS", 24)),
                default_days: env_or("HISTORY_DEFAULT_DAYS", 90),
                max_days: env_or("HISTORY_MAX_DAYS", 3650),
            },
        })
    }
}
