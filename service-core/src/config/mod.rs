//! Settings every service binary shares: listen port, service name, log level
//! and the optional OTLP collector.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `configuration` file, `APP__`-prefixed environment variables, then the bare
//! `SERVICE_NAME`, `LOG_LEVEL` and `OTLP_ENDPOINT` variables.

use crate::error::AppError;
use config::{Config as Cfg, Environment, File, Source};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// `service_name` is used when no source names the service.
    pub fn load(service_name: &str) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::layered(
            service_name,
            File::with_name("configuration").required(false),
        )
    }

    fn layered<S>(service_name: &str, file: S) -> Result<Self, AppError>
    where
        S: Source + Send + Sync + 'static,
    {
        let config = Cfg::builder()
            .set_default("service_name", service_name)?
            .add_source(file)
            .add_source(Environment::with_prefix("APP").separator("__"))
            .set_override_option("service_name", non_empty_var("SERVICE_NAME"))?
            .set_override_option("log_level", non_empty_var("LOG_LEVEL"))?
            .set_override_option("otlp_endpoint", non_empty_var("OTLP_ENDPOINT"))?
            .build()?;

        let mut config: Self = config.try_deserialize()?;
        config.otlp_endpoint = config.otlp_endpoint.filter(|e| !e.is_empty());
        Ok(config)
    }
}
