use chrono::{DateTime, Utc};
use secrecy::Secret;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Aggregator product a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Product {
    Transactions,
}

impl Product {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
        }
    }
}

/// A linked aggregator login. Owns the credential and sync health fields.
#[derive(Debug, Clone)]
pub struct LinkedItem {
    pub item_id: Uuid,
    pub external_item_id: String,
    pub owner_id: String,
    pub access_token: Secret<String>,
    pub institution_name: Option<String>,
    pub is_active: bool,
    pub last_refreshed_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for LinkedItem {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let access_token: String = row.try_get("access_token")?;
        Ok(Self {
            item_id: row.try_get("item_id")?,
            external_item_id: row.try_get("external_item_id")?,
            owner_id: row.try_get("owner_id")?,
            access_token: Secret::new(access_token),
            institution_name: row.try_get("institution_name")?,
            is_active: row.try_get("is_active")?,
            last_refreshed_utc: row.try_get("last_refreshed_utc")?,
            last_error: row.try_get("last_error")?,
            created_utc: row.try_get("created_utc")?,
            updated_utc: row.try_get("updated_utc")?,
        })
    }
}
