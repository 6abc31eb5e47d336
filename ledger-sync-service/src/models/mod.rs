//! Domain models for ledger-sync-service.

#![allow(clippy::should_implement_trait)]

pub mod account;
pub mod balance;
pub mod category;
pub mod item;
pub mod transaction;
pub mod webhook;

pub use account::{Account, AccountType};
pub use balance::{BalanceHistoryRow, BalancePoint, HistoryMode};
pub use category::Category;
pub use item::{LinkedItem, Product};
pub use transaction::{NormalizedTransaction, ProviderMetadata, TransactionRecord};
pub use webhook::{WebhookEventRecord, WebhookPayload, WebhookState};

use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

/// Money is stored as canonical decimal text; SQLite has no exact numeric type.
pub(crate) fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}
