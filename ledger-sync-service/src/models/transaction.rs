use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::decimal_column;

/// Opaque provider payload kept alongside each transaction.
///
/// Reconciliation never branches on its contents; the accessors exist for
/// readers that want a specific field without depending on upstream shape.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(transparent)]
pub struct ProviderMetadata(Value);

impl ProviderMetadata {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    fn str_field(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(Value::as_str)
    }

    pub fn payment_channel(&self) -> Option<&str> {
        self.str_field("/payment_channel")
    }

    pub fn authorized_date(&self) -> Option<NaiveDate> {
        self.str_field("/authorized_date")
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }

    pub fn location_city(&self) -> Option<&str> {
        self.str_field("/location/city")
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    pub fn from_json_str(raw: &str) -> Self {
        Self(serde_json::from_str(raw).unwrap_or(Value::Null))
    }
}

/// Canonical ledger row. Written only by the reconciler.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub transaction_id: Uuid,
    pub external_transaction_id: String,
    pub account_id: Uuid,
    /// Inflow positive, outflow negative.
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub merchant_name: Option<String>,
    pub category_id: Option<Uuid>,
    pub is_pending: bool,
    pub is_internal_transfer: bool,
    pub provider_metadata: ProviderMetadata,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TransactionRecord {
    /// True when writing `candidate` would change any stored field.
    pub fn differs_from(&self, candidate: &NormalizedTransaction) -> bool {
        self.account_id != candidate.account_id
            || self.amount != candidate.amount
            || self.transaction_date != candidate.transaction_date
            || self.description != candidate.description
            || self.merchant_name != candidate.merchant_name
            || self.category_id != candidate.category_id
            || self.is_pending != candidate.is_pending
            || self.is_internal_transfer != candidate.is_internal_transfer
            || self.provider_metadata != candidate.provider_metadata
    }
}

impl<'r> FromRow<'r, SqliteRow> for TransactionRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let metadata: String = row.try_get("provider_metadata")?;
        Ok(Self {
            transaction_id: row.try_get("transaction_id")?,
            external_transaction_id: row.try_get("external_transaction_id")?,
            account_id: row.try_get("account_id")?,
            amount: decimal_column(row, "amount")?,
            transaction_date: row.try_get("transaction_date")?,
            description: row.try_get("description")?,
            merchant_name: row.try_get("merchant_name")?,
            category_id: row.try_get("category_id")?,
            is_pending: row.try_get("is_pending")?,
            is_internal_transfer: row.try_get("is_internal_transfer")?,
            provider_metadata: ProviderMetadata::from_json_str(&metadata),
            created_utc: row.try_get("created_utc")?,
            updated_utc: row.try_get("updated_utc")?,
        })
    }
}

/// Write candidate produced by the reconciler from a provider record.
#[derive(Debug, Clone)]
pub struct NormalizedTransaction {
    pub external_transaction_id: String,
    pub account_id: Uuid,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub merchant_name: Option<String>,
    pub category_id: Option<Uuid>,
    pub is_pending: bool,
    pub is_internal_transfer: bool,
    pub provider_metadata: ProviderMetadata,
}
