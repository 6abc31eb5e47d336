use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::decimal_column;

/// One day of a reconstructed balance series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub date: NaiveDate,
    pub balance: Decimal,
}

/// Which transactions a series counts. The two are never mixed in one
/// cached series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Skips internal transfers (and hidden accounts in owner totals).
    Exclusive,
    /// Counts everything. Never cached.
    Inclusive,
}

impl HistoryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Inclusive => "inclusive",
        }
    }

    pub fn from_include_internal(include_internal: bool) -> Self {
        if include_internal {
            Self::Inclusive
        } else {
            Self::Exclusive
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalanceHistoryRow {
    pub account_id: Uuid,
    pub balance_date: NaiveDate,
    pub balance: Decimal,
    pub is_hidden: bool,
    pub updated_utc: DateTime<Utc>,
}

impl From<BalanceHistoryRow> for BalancePoint {
    fn from(row: BalanceHistoryRow) -> Self {
        Self {
            date: row.balance_date,
            balance: row.balance,
        }
    }
}

impl<'r> FromRow<'r, SqliteRow> for BalanceHistoryRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            account_id: row.try_get("account_id")?,
            balance_date: row.try_get("balance_date")?,
            balance: decimal_column(row, "balance")?,
            is_hidden: row.try_get("is_hidden")?,
            updated_utc: row.try_get("updated_utc")?,
        })
    }
}
