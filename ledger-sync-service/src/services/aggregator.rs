//! Aggregator client.
//!
//! The sync pipeline only talks to the aggregator through [`AggregatorClient`];
//! the handle is passed into every sync call so tests can substitute a scripted
//! implementation and credentials stay scoped to the item being synced.

use crate::config::AggregatorConfig;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use service_core::retry::Retryable;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Error codes the aggregator uses for credentials that need user action.
const AUTH_ERROR_CODES: &[&str] = &[
    "ITEM_LOGIN_REQUIRED",
    "INVALID_ACCESS_TOKEN",
    "ACCESS_NOT_GRANTED",
    "USER_PERMISSION_REVOKED",
    "ITEM_NOT_FOUND",
];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("aggregator request timed out")]
    Timeout,

    #[error("aggregator transport error: {0}")]
    Transport(String),

    #[error("aggregator rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("aggregator server error (status {status})")]
    ServerError { status: u16 },

    #[error("aggregator rejected credential: {code}")]
    Auth { code: String },

    #[error("malformed aggregator page: {0}")]
    MalformedPage(String),

    #[error("aggregator rejected request (status {status}): {code}")]
    Rejected { status: u16, code: String },
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transport(_) | Self::RateLimited { .. } | Self::ServerError { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Transaction record as the aggregator reports it. Provider amounts are
/// positive when money leaves the account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub original_description: Option<String>,
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub pending: bool,
    /// Everything else the aggregator sends, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemovedTransaction {
    pub transaction_id: String,
}

/// One page of the incremental-changes stream.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeltaPage {
    #[serde(default)]
    pub added: Vec<ProviderTransaction>,
    #[serde(default)]
    pub modified: Vec<ProviderTransaction>,
    #[serde(default)]
    pub removed: Vec<RemovedTransaction>,
    pub next_cursor: String,
    pub has_more: bool,
}

impl DeltaPage {
    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.next_cursor.trim().is_empty() {
            return Err(ProviderError::MalformedPage(
                "page carries an empty next_cursor".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for txn in self.added.iter().chain(self.modified.iter()) {
            if txn.transaction_id.is_empty() || txn.account_id.is_empty() {
                return Err(ProviderError::MalformedPage(
                    "transaction without transaction_id or account_id".to_string(),
                ));
            }
            if !seen.insert(txn.transaction_id.as_str()) {
                return Err(ProviderError::MalformedPage(format!(
                    "transaction {} appears twice in one page",
                    txn.transaction_id
                )));
            }
        }

        if self.removed.iter().any(|r| r.transaction_id.is_empty()) {
            return Err(ProviderError::MalformedPage(
                "removed entry without transaction_id".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderBalances {
    #[serde(default)]
    pub current: Option<Decimal>,
    #[serde(default)]
    pub iso_currency_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderAccount {
    pub account_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    pub balances: ProviderBalances,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<ProviderAccount>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[async_trait]
pub trait AggregatorClient: Send + Sync {
    /// Fetch the page of changes following `cursor` (`None` on first run).
    async fn transactions_sync(
        &self,
        credential: &Secret<String>,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, ProviderError>;

    /// Current account list and balances for an item.
    async fn get_accounts(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ProviderAccount>, ProviderError>;
}

/// reqwest-backed client for the aggregator's JSON API.
#[derive(Clone)]
pub struct HttpAggregatorClient {
    client: Client,
    config: AggregatorConfig,
}

impl HttpAggregatorClient {
    pub fn new(config: AggregatorConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn credentials(&self, credential: &Secret<String>) -> Value {
        json!({
            "client_id": self.config.client_id,
            "secret": self.config.secret.expose_secret(),
            "access_token": credential.expose_secret(),
        })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(classify_transport)?;

        tracing::debug!(path = %path, status = %status, "Aggregator response");

        if status.is_success() {
            return serde_json::from_str(&text)
                .map_err(|e| ProviderError::MalformedPage(e.to_string()));
        }

        Err(classify_status(status, retry_after, &text))
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return ProviderError::ServerError {
            status: status.as_u16(),
        };
    }

    let detail: Option<ProviderErrorBody> = serde_json::from_str(body).ok();
    let code = detail
        .as_ref()
        .and_then(|d| d.error_code.clone())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    if let Some(message) = detail.as_ref().and_then(|d| d.error_message.as_deref()) {
        tracing::warn!(status = %status, code = %code, message = %message, "Aggregator rejected request");
    }

    if AUTH_ERROR_CODES.contains(&code.as_str()) || status == StatusCode::UNAUTHORIZED {
        ProviderError::Auth { code }
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            code,
        }
    }
}

#[async_trait]
impl AggregatorClient for HttpAggregatorClient {
    async fn transactions_sync(
        &self,
        credential: &Secret<String>,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, ProviderError> {
        let mut body = self.credentials(credential);
        body["count"] = json!(self.config.page_size);
        if let Some(cursor) = cursor {
            body["cursor"] = json!(cursor);
        }
        self.post("/transactions/sync", body).await
    }

    async fn get_accounts(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        let response: AccountsResponse = self
            .post("/accounts/get", self.credentials(credential))
            .await?;
        Ok(response.accounts)
    }
}
