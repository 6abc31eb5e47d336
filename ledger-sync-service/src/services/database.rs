//! Database service for ledger-sync-service.

#![allow(clippy::too_many_arguments)]

use crate::models::{
    Account, AccountType, BalanceHistoryRow, BalancePoint, Category, LinkedItem, Product,
    TransactionRecord, WebhookEventRecord, WebhookState,
};
use crate::services::aggregator::ProviderAccount;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ITEM_COLUMNS: &str = "item_id, external_item_id, owner_id, access_token, institution_name, \
     is_active, last_refreshed_utc, last_error, created_utc, updated_utc";

const ACCOUNT_COLUMNS: &str = "account_id, item_id, external_account_id, owner_id, name, \
     account_type, subtype, currency, current_balance, is_hidden, ledger_changed_utc, \
     created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, external_transaction_id, account_id, amount, \
     transaction_date, description, merchant_name, category_id, is_pending, \
     is_internal_transfer, provider_metadata, created_utc, updated_utc";

pub(crate) fn db_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Stamp an account whose ledger changed so cached history written before
/// now stops being served.
pub(crate) async fn stamp_ledger_changed(
    conn: &mut SqliteConnection,
    account_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query("UPDATE accounts SET ledger_changed_utc = ? WHERE account_id = ?")
        .bind(Utc::now())
        .bind(account_id)
        .execute(conn)
        .await
        .map_err(|e| db_error("Failed to stamp ledger change", e))?;
    Ok(())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "ledger-sync-service"))]
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        info!(max_connections = max_connections, "Connecting to SQLite");

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| db_error("Invalid DATABASE_URL", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("SQLite connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| db_error("Migration failed", e))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Linked Item Operations
    // =========================================================================

    /// Register a linked item. Linking itself happens upstream; this is the
    /// store half of that flow.
    #[instrument(skip(self, access_token), fields(owner_id = %owner_id))]
    pub async fn create_item(
        &self,
        external_item_id: &str,
        owner_id: &str,
        access_token: &Secret<String>,
        institution_name: Option<&str>,
    ) -> Result<LinkedItem, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_item"])
            .start_timer();

        let now = Utc::now();
        let item = sqlx::query_as::<_, LinkedItem>(&format!(
            r#"
            INSERT INTO linked_items (item_id, external_item_id, owner_id, access_token,
                institution_name, is_active, created_utc, updated_utc)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(external_item_id)
        .bind(owner_id)
        .bind(access_token.expose_secret())
        .bind(institution_name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create item", e))?;

        timer.observe_duration();
        info!(item_id = %item.item_id, "Linked item created");
        Ok(item)
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn get_item(&self, item_id: Uuid) -> Result<Option<LinkedItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_item"])
            .start_timer();

        let item = sqlx::query_as::<_, LinkedItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM linked_items WHERE item_id = ?"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get item", e))?;

        timer.observe_duration();
        Ok(item)
    }

    #[instrument(skip(self))]
    pub async fn get_item_by_external_id(
        &self,
        external_item_id: &str,
    ) -> Result<Option<LinkedItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_item_by_external_id"])
            .start_timer();

        let item = sqlx::query_as::<_, LinkedItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM linked_items WHERE external_item_id = ?"
        ))
        .bind(external_item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get item", e))?;

        timer.observe_duration();
        Ok(item)
    }

    #[instrument(skip(self))]
    pub async fn list_active_items(&self) -> Result<Vec<LinkedItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_items"])
            .start_timer();

        let items = sqlx::query_as::<_, LinkedItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM linked_items WHERE is_active = 1 ORDER BY created_utc"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list items", e))?;

        timer.observe_duration();
        Ok(items)
    }

    /// Successful run: stamp the refresh time and clear any recorded error.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn mark_item_refreshed(&self, item_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_item_refreshed"])
            .start_timer();

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE linked_items
            SET last_refreshed_utc = ?, last_error = NULL, updated_utc = ?
            WHERE item_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark item refreshed", e))?;

        timer.observe_duration();
        Ok(())
    }

    /// Record a sync failure; `deactivate` takes the item out of polling.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn record_item_error(
        &self,
        item_id: Uuid,
        error: &str,
        deactivate: bool,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_item_error"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE linked_items
            SET last_error = ?,
                is_active = CASE WHEN ? THEN 0 ELSE is_active END,
                updated_utc = ?
            WHERE item_id = ?
            "#,
        )
        .bind(error)
        .bind(deactivate)
        .bind(Utc::now())
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record item error", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(item_id = %item_id, product = product.as_str()))]
    pub async fn get_cursor(
        &self,
        item_id: Uuid,
        product: Product,
    ) -> Result<Option<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_cursor"])
            .start_timer();

        let cursor: Option<Option<String>> = sqlx::query_scalar(
            "SELECT cursor FROM item_cursors WHERE item_id = ? AND product = ?",
        )
        .bind(item_id)
        .bind(product.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get cursor", e))?;

        timer.observe_duration();
        Ok(cursor.flatten())
    }

    /// Persist a cursor. Callers only do this after the page it belongs to
    /// has committed.
    #[instrument(skip(self, cursor), fields(item_id = %item_id, product = product.as_str()))]
    pub async fn save_cursor(
        &self,
        item_id: Uuid,
        product: Product,
        cursor: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_cursor"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO item_cursors (item_id, product, cursor, updated_utc)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (item_id, product)
            DO UPDATE SET cursor = excluded.cursor, updated_utc = excluded.updated_utc
            "#,
        )
        .bind(item_id)
        .bind(product.as_str())
        .bind(cursor)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save cursor", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    #[instrument(skip(self, item), fields(item_id = %item.item_id))]
    pub async fn create_account(
        &self,
        item: &LinkedItem,
        external_account_id: &str,
        name: &str,
        account_type: AccountType,
        subtype: Option<&str>,
        currency: &str,
        current_balance: Decimal,
    ) -> Result<Account, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_account"])
            .start_timer();

        let now = Utc::now();
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (account_id, item_id, external_account_id, owner_id, name,
                account_type, subtype, currency, current_balance, is_hidden, created_utc, updated_utc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(item.item_id)
        .bind(external_account_id)
        .bind(&item.owner_id)
        .bind(name)
        .bind(account_type.as_str())
        .bind(subtype)
        .bind(currency)
        .bind(current_balance.to_string())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create account", e))?;

        timer.observe_duration();
        info!(account_id = %account.account_id, "Account created");
        Ok(account)
    }

    /// Apply the aggregator's view of an account. The hidden flag is a user
    /// preference and is left alone.
    #[instrument(skip(self, item, provider), fields(item_id = %item.item_id, external_account_id = %provider.account_id))]
    pub async fn upsert_provider_account(
        &self,
        item: &LinkedItem,
        provider: &ProviderAccount,
    ) -> Result<Account, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_provider_account"])
            .start_timer();

        let now = Utc::now();
        let account_type = AccountType::from_str(&provider.account_type);
        let currency = provider
            .balances
            .iso_currency_code
            .clone()
            .unwrap_or_else(|| "USD".to_string());
        let balance = provider.balances.current.unwrap_or(Decimal::ZERO);

        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (account_id, item_id, external_account_id, owner_id, name,
                account_type, subtype, currency, current_balance, is_hidden, created_utc, updated_utc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (external_account_id) DO UPDATE SET
                name = excluded.name,
                account_type = excluded.account_type,
                subtype = excluded.subtype,
                currency = excluded.currency,
                current_balance = CASE WHEN ? THEN excluded.current_balance ELSE accounts.current_balance END,
                updated_utc = excluded.updated_utc
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(item.item_id)
        .bind(&provider.account_id)
        .bind(&item.owner_id)
        .bind(&provider.name)
        .bind(account_type.as_str())
        .bind(provider.subtype.as_deref())
        .bind(currency)
        .bind(balance.to_string())
        .bind(now)
        .bind(now)
        .bind(provider.balances.current.is_some())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert account", e))?;

        timer.observe_duration();
        Ok(account)
    }

    /// The live balance moved outside any page we applied.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn mark_ledger_changed(&self, account_id: Uuid) -> Result<(), AppError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        stamp_ledger_changed(&mut *conn, account_id).await
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get account", e))?;

        timer.observe_duration();
        Ok(account)
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn list_item_accounts(&self, item_id: Uuid) -> Result<Vec<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_item_accounts"])
            .start_timer();

        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE item_id = ? ORDER BY created_utc"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list accounts", e))?;

        timer.observe_duration();
        Ok(accounts)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn list_owner_accounts(&self, owner_id: &str) -> Result<Vec<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_owner_accounts"])
            .start_timer();

        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = ? ORDER BY created_utc"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list accounts", e))?;

        timer.observe_duration();
        Ok(accounts)
    }

    /// Toggle the hidden flag, carrying it onto any cached history rows.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn set_account_hidden(&self, account_id: Uuid, hidden: bool) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_account_hidden"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query("UPDATE accounts SET is_hidden = ?, updated_utc = ? WHERE account_id = ?")
            .bind(hidden)
            .bind(Utc::now())
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to update account", e))?;

        sqlx::query("UPDATE balance_history SET is_hidden = ? WHERE account_id = ?")
            .bind(hidden)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to update history rows", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Category Operations
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn list_categories(&self) -> Result<Vec<Category>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_categories"])
            .start_timer();

        let categories = sqlx::query_as::<_, Category>(
            "SELECT category_id, slug, display_name, parent_id, created_utc FROM categories",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list categories", e))?;

        timer.observe_duration();
        Ok(categories)
    }

    #[instrument(skip(self))]
    pub async fn get_category_by_slug(&self, slug: &str) -> Result<Option<Category>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_category_by_slug"])
            .start_timer();

        let category = sqlx::query_as::<_, Category>(
            "SELECT category_id, slug, display_name, parent_id, created_utc FROM categories WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get category", e))?;

        timer.observe_duration();
        Ok(category)
    }

    #[instrument(skip(self), fields(category_id = %category_id))]
    pub async fn get_category(&self, category_id: Uuid) -> Result<Option<Category>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_category"])
            .start_timer();

        let category = sqlx::query_as::<_, Category>(
            "SELECT category_id, slug, display_name, parent_id, created_utc FROM categories WHERE category_id = ?",
        )
        .bind(category_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get category", e))?;

        timer.observe_duration();
        Ok(category)
    }

    // =========================================================================
    // Transaction Operations (read side; writes go through the reconciler)
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn get_transaction_by_external_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction_by_external_id"])
            .start_timer();

        let txn = sqlx::query_as::<_, TransactionRecord>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE external_transaction_id = ?"
        ))
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get transaction", e))?;

        timer.observe_duration();
        Ok(txn)
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn list_account_transactions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_account_transactions"])
            .start_timer();

        let txns = sqlx::query_as::<_, TransactionRecord>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE account_id = ?
            ORDER BY transaction_date, external_transaction_id
            "#
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list transactions", e))?;

        timer.observe_duration();
        Ok(txns)
    }

    /// Per-day sums of balance effects for days in `(after, through]`.
    #[instrument(skip(self, account), fields(account_id = %account.account_id))]
    pub async fn daily_deltas(
        &self,
        account: &Account,
        after: NaiveDate,
        through: NaiveDate,
        include_internal: bool,
    ) -> Result<BTreeMap<NaiveDate, Decimal>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["daily_deltas"])
            .start_timer();

        let rows = sqlx::query(
            r#"
            SELECT transaction_date, amount FROM transactions
            WHERE account_id = ?
              AND transaction_date > ?
              AND transaction_date <= ?
              AND (? OR is_internal_transfer = 0)
            "#,
        )
        .bind(account.account_id)
        .bind(after)
        .bind(through)
        .bind(include_internal)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load daily deltas", e))?;

        let mut deltas: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for row in rows {
            let date: NaiveDate = row
                .try_get("transaction_date")
                .map_err(|e| db_error("Bad transaction_date", e))?;
            let raw: String = row
                .try_get("amount")
                .map_err(|e| db_error("Bad amount", e))?;
            let amount = Decimal::from_str(&raw).map_err(|e| db_error("Bad amount", e))?;
            *deltas.entry(date).or_insert(Decimal::ZERO) += account.account_type.balance_effect(amount);
        }

        timer.observe_duration();
        Ok(deltas)
    }

    // =========================================================================
    // Balance History Operations
    // =========================================================================

    /// Stored rows for `[start, end]`, ascending. Never touches rows outside.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_history_rows(
        &self,
        account_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BalanceHistoryRow>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_history_rows"])
            .start_timer();

        let rows = sqlx::query_as::<_, BalanceHistoryRow>(
            r#"
            SELECT account_id, balance_date, balance, is_hidden, updated_utc
            FROM balance_history
            WHERE account_id = ? AND balance_date >= ? AND balance_date <= ?
            ORDER BY balance_date
            "#,
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load history", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    /// Upsert computed points, dropping any that fall outside `[start, end]`.
    #[instrument(skip(self, points), fields(account_id = %account_id, points = points.len()))]
    pub async fn upsert_history_rows(
        &self,
        account_id: Uuid,
        is_hidden: bool,
        start: NaiveDate,
        end: NaiveDate,
        points: &[BalancePoint],
    ) -> Result<usize, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_history_rows"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let mut written = 0;
        for point in points.iter().filter(|p| p.date >= start && p.date <= end) {
            sqlx::query(
                r#"
                INSERT INTO balance_history (account_id, balance_date, balance, is_hidden, updated_utc)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (account_id, balance_date) DO UPDATE SET
                    balance = excluded.balance,
                    is_hidden = excluded.is_hidden,
                    updated_utc = excluded.updated_utc
                "#,
            )
            .bind(account_id)
            .bind(point.date)
            .bind(point.balance.to_string())
            .bind(is_hidden)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to upsert history row", e))?;
            written += 1;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();
        Ok(written)
    }

    // =========================================================================
    // Webhook Operations
    // =========================================================================

    /// Append the audit record for a verified delivery.
    #[instrument(skip(self, payload))]
    pub async fn insert_webhook_event(
        &self,
        event_category: &str,
        event_code: &str,
        external_item_id: Option<&str>,
        payload: &str,
    ) -> Result<WebhookEventRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_webhook_event"])
            .start_timer();

        let now = Utc::now();
        let record = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            INSERT INTO webhook_events (event_id, event_category, event_code, external_item_id,
                state, error, payload, received_utc, updated_utc)
            VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?)
            RETURNING event_id, event_category, event_code, external_item_id, state, error,
                payload, received_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_category)
        .bind(event_code)
        .bind(external_item_id)
        .bind(WebhookState::Verified.as_str())
        .bind(payload)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert webhook event", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self), fields(event_id = %event_id, state = state.as_str()))]
    pub async fn update_webhook_state(
        &self,
        event_id: Uuid,
        state: WebhookState,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_webhook_state"])
            .start_timer();

        sqlx::query(
            "UPDATE webhook_events SET state = ?, error = ?, updated_utc = ? WHERE event_id = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update webhook event", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn get_webhook_event(
        &self,
        event_id: Uuid,
    ) -> Result<Option<WebhookEventRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_webhook_event"])
            .start_timer();

        let record = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT event_id, event_category, event_code, external_item_id, state, error,
                payload, received_utc, updated_utc
            FROM webhook_events WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get webhook event", e))?;

        timer.observe_duration();
        Ok(record)
    }

    /// Park a delivery whose handler failed for a reason retries cannot fix.
    #[instrument(skip(self, payload), fields(event_id = %event_id, task = %task))]
    pub async fn insert_dead_letter(
        &self,
        event_id: Uuid,
        task: &str,
        error: &str,
        payload: &str,
    ) -> Result<Uuid, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_dead_letter"])
            .start_timer();

        let dead_letter_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO webhook_dead_letters (dead_letter_id, event_id, task, error, payload, created_utc)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dead_letter_id)
        .bind(event_id)
        .bind(task)
        .bind(error)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert dead letter", e))?;

        timer.observe_duration();
        info!(dead_letter_id = %dead_letter_id, "Webhook dead-lettered");
        Ok(dead_letter_id)
    }
}
