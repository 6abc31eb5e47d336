use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::decimal_column;

/// Aggregator account type. Decides which way a transaction moves the
/// reported balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Depository,
    Credit,
    Loan,
    Investment,
    Other,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Depository => "depository",
            Self::Credit => "credit",
            Self::Loan => "loan",
            Self::Investment => "investment",
            Self::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "depository" => Self::Depository,
            "credit" => Self::Credit,
            "loan" => Self::Loan,
            "investment" | "brokerage" => Self::Investment,
            _ => Self::Other,
        }
    }

    /// Change in reported balance caused by a ledger amount (inflow positive).
    ///
    /// Credit and loan balances report the amount owed, so spending raises them.
    pub fn balance_effect(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit | Self::Loan => -amount,
            Self::Depository | Self::Investment | Self::Other => amount,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub account_id: Uuid,
    pub item_id: Uuid,
    pub external_account_id: String,
    pub owner_id: String,
    pub name: String,
    pub account_type: AccountType,
    pub subtype: Option<String>,
    pub currency: String,
    pub current_balance: Decimal,
    pub is_hidden: bool,
    pub ledger_changed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Account {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let account_type: String = row.try_get("account_type")?;
        Ok(Self {
            account_id: row.try_get("account_id")?,
            item_id: row.try_get("item_id")?,
            external_account_id: row.try_get("external_account_id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            account_type: AccountType::from_str(&account_type),
            subtype: row.try_get("subtype")?,
            currency: row.try_get("currency")?,
            current_balance: decimal_column(row, "current_balance")?,
            is_hidden: row.try_get("is_hidden")?,
            ledger_changed_utc: row.try_get("ledger_changed_utc")?,
            created_utc: row.try_get("created_utc")?,
            updated_utc: row.try_get("updated_utc")?,
        })
    }
}
