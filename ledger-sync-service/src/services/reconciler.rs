//! Transaction reconciler.
//!
//! Applies one aggregator page to the canonical ledger inside a single SQLite
//! transaction: adds, modifications and removals commit together or not at all.

use crate::models::{Account, NormalizedTransaction, ProviderMetadata, TransactionRecord};
use crate::services::aggregator::{DeltaPage, ProviderTransaction};
use crate::services::database::{db_error, stamp_ledger_changed, Database};
use crate::services::metrics::record_reconciled;
use crate::services::normalizer::{normalize_merchant, Normalizer, PendingCategories};
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::error::AppError;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Accounts of one item keyed by the aggregator's account id.
pub type AccountIndex = HashMap<String, Account>;

/// What one page did to the ledger.
#[derive(Debug, Default, Clone)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Earliest date touched per account; history from there on is stale.
    pub affected: HashMap<Uuid, NaiveDate>,
}

impl ReconcileOutcome {
    pub fn updated(&self) -> bool {
        self.added + self.modified + self.removed > 0
    }

    pub fn touch(&mut self, account_id: Uuid, date: NaiveDate) {
        self.affected
            .entry(account_id)
            .and_modify(|d| *d = (*d).min(date))
            .or_insert(date);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteAction {
    Added,
    Modified,
    Unchanged,
}

pub struct Reconciler {
    db: Database,
    normalizer: Arc<Normalizer>,
    transfer_tolerance_days: i64,
}

impl Reconciler {
    pub fn new(db: Database, normalizer: Arc<Normalizer>, transfer_tolerance_days: i64) -> Self {
        Self {
            db,
            normalizer,
            transfer_tolerance_days,
        }
    }

    /// Apply a validated page. Any failure rolls the whole page back.
    #[instrument(skip(self, page, accounts), fields(
        added = page.added.len(),
        modified = page.modified.len(),
        removed = page.removed.len()
    ))]
    pub async fn apply(
        &self,
        page: &DeltaPage,
        accounts: &AccountIndex,
    ) -> Result<ReconcileOutcome, AppError> {
        let mut outcome = ReconcileOutcome::default();
        let mut pending = PendingCategories::default();

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        for provider in page.added.iter().chain(page.modified.iter()) {
            let account = accounts.get(&provider.account_id).ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "transaction {} references unknown account {}",
                    provider.transaction_id,
                    provider.account_id
                ))
            })?;

            let action = self
                .upsert(&mut tx, provider, account, &mut pending, &mut outcome)
                .await?;
            match action {
                WriteAction::Added => outcome.added += 1,
                WriteAction::Modified => outcome.modified += 1,
                WriteAction::Unchanged => outcome.unchanged += 1,
            }
        }

        for removed in &page.removed {
            let deleted = sqlx::query(
                "DELETE FROM transactions WHERE external_transaction_id = ? RETURNING account_id, transaction_date",
            )
            .bind(&removed.transaction_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete transaction", e))?;

            match deleted {
                Some(row) => {
                    let account_id: Uuid = row
                        .try_get("account_id")
                        .map_err(|e| db_error("Bad account_id", e))?;
                    let date: NaiveDate = row
                        .try_get("transaction_date")
                        .map_err(|e| db_error("Bad transaction_date", e))?;
                    outcome.removed += 1;
                    outcome.touch(account_id, date);
                }
                None => {
                    debug!(external_transaction_id = %removed.transaction_id, "Removed transaction not present");
                }
            }
        }

        for account_id in outcome.affected.keys() {
            stamp_ledger_changed(&mut *tx, *account_id).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit page", e))?;

        // Only committed categories become visible to other runs.
        self.normalizer.remember(pending);

        record_reconciled("added", outcome.added);
        record_reconciled("modified", outcome.modified);
        record_reconciled("unchanged", outcome.unchanged);
        record_reconciled("removed", outcome.removed);

        info!(
            added = outcome.added,
            modified = outcome.modified,
            unchanged = outcome.unchanged,
            removed = outcome.removed,
            "Page reconciled"
        );

        Ok(outcome)
    }

    async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        provider: &ProviderTransaction,
        account: &Account,
        pending: &mut PendingCategories,
        outcome: &mut ReconcileOutcome,
    ) -> Result<WriteAction, AppError> {
        let category_id = match provider.category.as_deref() {
            Some(levels) if !levels.is_empty() => {
                self.normalizer.resolve_in_tx(conn, levels, pending).await?
            }
            _ => None,
        };

        // Aggregator amounts are positive for outflows.
        let amount = -provider.amount;
        let transfer_partner = if provider.pending {
            None
        } else {
            self.find_transfer_partner(conn, provider, account, amount)
                .await?
        };

        let candidate = NormalizedTransaction {
            external_transaction_id: provider.transaction_id.clone(),
            account_id: account.account_id,
            amount,
            transaction_date: provider.date,
            description: provider
                .name
                .clone()
                .or_else(|| provider.original_description.clone())
                .or_else(|| provider.merchant_name.clone())
                .unwrap_or_default(),
            merchant_name: normalize_merchant(
                provider.merchant_name.as_deref(),
                provider.name.as_deref(),
                provider.original_description.as_deref(),
            ),
            category_id,
            is_pending: provider.pending,
            is_internal_transfer: transfer_partner.is_some(),
            provider_metadata: ProviderMetadata::new(Value::Object(provider.extra.clone())),
        };

        if let Some(partner) = transfer_partner {
            if !partner.is_internal_transfer {
                sqlx::query(
                    "UPDATE transactions SET is_internal_transfer = 1, updated_utc = ? WHERE transaction_id = ?",
                )
                .bind(Utc::now())
                .bind(partner.transaction_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| db_error("Failed to flag transfer counterpart", e))?;
                outcome.touch(partner.account_id, partner.transaction_date);
            }
        }

        let existing = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT transaction_id, external_transaction_id, account_id, amount, transaction_date,
                description, merchant_name, category_id, is_pending, is_internal_transfer,
                provider_metadata, created_utc, updated_utc
            FROM transactions WHERE external_transaction_id = ?
            "#,
        )
        .bind(&candidate.external_transaction_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to load transaction", e))?;

        let now = Utc::now();
        match existing {
            None => {
                write_insert(conn, &candidate, now).await?;
                outcome.touch(candidate.account_id, candidate.transaction_date);
                Ok(WriteAction::Added)
            }
            Some(stored) if stored.differs_from(&candidate) => {
                write_update(conn, &candidate, now).await?;
                outcome.touch(stored.account_id, stored.transaction_date);
                outcome.touch(candidate.account_id, candidate.transaction_date);
                Ok(WriteAction::Modified)
            }
            Some(_) => Ok(WriteAction::Unchanged),
        }
    }

    /// Opposite-sign, equal-magnitude, settled transaction in another account
    /// of the same owner within the date tolerance. Unflagged rows win ties,
    /// then the closest date.
    async fn find_transfer_partner(
        &self,
        conn: &mut SqliteConnection,
        provider: &ProviderTransaction,
        account: &Account,
        amount: Decimal,
    ) -> Result<Option<TransferPartner>, AppError> {
        if amount.is_zero() {
            return Ok(None);
        }

        let tolerance = Duration::days(self.transfer_tolerance_days);
        let rows = sqlx::query(
            r#"
            SELECT t.transaction_id, t.account_id, t.amount, t.transaction_date, t.is_internal_transfer
            FROM transactions t
            JOIN accounts a ON a.account_id = t.account_id
            WHERE a.owner_id = ?
              AND t.account_id != ?
              AND t.external_transaction_id != ?
              AND t.is_pending = 0
              AND t.transaction_date >= ?
              AND t.transaction_date <= ?
            "#,
        )
        .bind(&account.owner_id)
        .bind(account.account_id)
        .bind(&provider.transaction_id)
        .bind(provider.date - tolerance)
        .bind(provider.date + tolerance)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to search transfer candidates", e))?;

        let mut best: Option<TransferPartner> = None;
        for row in rows {
            let raw: String = row.try_get("amount").map_err(|e| db_error("Bad amount", e))?;
            let candidate_amount: Decimal = raw.parse().map_err(|e| db_error("Bad amount", e))?;
            if candidate_amount != -amount {
                continue;
            }
            let partner = TransferPartner {
                transaction_id: row
                    .try_get("transaction_id")
                    .map_err(|e| db_error("Bad transaction_id", e))?,
                account_id: row
                    .try_get("account_id")
                    .map_err(|e| db_error("Bad account_id", e))?,
                transaction_date: row
                    .try_get("transaction_date")
                    .map_err(|e| db_error("Bad transaction_date", e))?,
                is_internal_transfer: row
                    .try_get("is_internal_transfer")
                    .map_err(|e| db_error("Bad is_internal_transfer", e))?,
            };
            let better = match &best {
                None => true,
                Some(current) => partner.rank(provider.date) < current.rank(provider.date),
            };
            if better {
                best = Some(partner);
            }
        }

        Ok(best)
    }
}

#[derive(Debug, Clone)]
struct TransferPartner {
    transaction_id: Uuid,
    account_id: Uuid,
    transaction_date: NaiveDate,
    is_internal_transfer: bool,
}

impl TransferPartner {
    fn rank(&self, date: NaiveDate) -> (bool, i64) {
        (
            self.is_internal_transfer,
            (self.transaction_date - date).num_days().abs(),
        )
    }
}

async fn write_insert(
    conn: &mut SqliteConnection,
    txn: &NormalizedTransaction,
    now: chrono::DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (transaction_id, external_transaction_id, account_id, amount,
            transaction_date, description, merchant_name, category_id, is_pending,
            is_internal_transfer, provider_metadata, created_utc, updated_utc)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&txn.external_transaction_id)
    .bind(txn.account_id)
    .bind(txn.amount.to_string())
    .bind(txn.transaction_date)
    .bind(&txn.description)
    .bind(txn.merchant_name.as_deref())
    .bind(txn.category_id)
    .bind(txn.is_pending)
    .bind(txn.is_internal_transfer)
    .bind(txn.provider_metadata.to_json_string())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("Failed to insert transaction", e))?;
    Ok(())
}

async fn write_update(
    conn: &mut SqliteConnection,
    txn: &NormalizedTransaction,
    now: chrono::DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE transactions SET
            account_id = ?, amount = ?, transaction_date = ?, description = ?,
            merchant_name = ?, category_id = ?, is_pending = ?, is_internal_transfer = ?,
            provider_metadata = ?, updated_utc = ?
        WHERE external_transaction_id = ?
        "#,
    )
    .bind(txn.account_id)
    .bind(txn.amount.to_string())
    .bind(txn.transaction_date)
    .bind(&txn.description)
    .bind(txn.merchant_name.as_deref())
    .bind(txn.category_id)
    .bind(txn.is_pending)
    .bind(txn.is_internal_transfer)
    .bind(txn.provider_metadata.to_json_string())
    .bind(now)
    .bind(&txn.external_transaction_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("Failed to update transaction", e))?;
    Ok(())
}
