use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Delivery lifecycle: `Received -> Verified -> Dispatched -> Acked`, ending
/// in `Rejected` (bad signature or body) or `Failed` (handler error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookState {
    Received,
    Verified,
    Dispatched,
    Acked,
    Rejected,
    Failed,
}

impl WebhookState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Dispatched => "dispatched",
            Self::Acked => "acked",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "verified" => Self::Verified,
            "dispatched" => Self::Dispatched,
            "acked" => Self::Acked,
            "rejected" => Self::Rejected,
            "failed" => Self::Failed,
            _ => Self::Received,
        }
    }
}

/// Inbound webhook body. Unknown fields are kept for the audit log.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "webhook_type")]
    pub event_category: String,
    #[serde(alias = "webhook_code")]
    pub event_code: String,
    pub item_id: String,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub event_id: Uuid,
    pub event_category: String,
    pub event_code: String,
    pub external_item_id: Option<String>,
    pub state: WebhookState,
    pub error: Option<String>,
    pub payload: String,
    pub received_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for WebhookEventRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        Ok(Self {
            event_id: row.try_get("event_id")?,
            event_category: row.try_get("event_category")?,
            event_code: row.try_get("event_code")?,
            external_item_id: row.try_get("external_item_id")?,
            state: WebhookState::from_str(&state),
            error: row.try_get("error")?,
            payload: row.try_get("payload")?,
            received_utc: row.try_get("received_utc")?,
            updated_utc: row.try_get("updated_utc")?,
        })
    }
}
