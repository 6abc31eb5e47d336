//! Delta sync.
//!
//! Pages through the aggregator's change stream from the item's stored
//! cursor. Each page is reconciled in its own transaction and the cursor for
//! that page is written only after the commit, so a crash or failure resumes
//! from the last committed page.

use crate::config::SyncConfig;
use crate::models::{AccountType, LinkedItem, Product};
use crate::services::aggregator::{AggregatorClient, ProviderError};
use crate::services::database::Database;
use crate::services::history_cache::{HistoryCache, HistoryWindow};
use crate::services::metrics::{record_error, record_sync_run};
use crate::services::reconciler::{AccountIndex, ReconcileOutcome, Reconciler};
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::{retry_with_backoff, Retryable};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient aggregator failure: {0}")]
    Transient(ProviderError),

    #[error("aggregator rejected credential: {code}")]
    Auth { code: String },

    #[error("malformed page: {0}")]
    MalformedPage(String),

    #[error("aggregator error: {0}")]
    Provider(ProviderError),

    #[error("item {0} is inactive")]
    ItemInactive(Uuid),

    #[error("no linked item for {0}")]
    UnknownItem(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl SyncError {
    /// Stable label for `last_error` and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Auth { .. } => "auth",
            Self::MalformedPage(_) => "malformed_page",
            Self::Provider(_) => "provider",
            Self::ItemInactive(_) => "item_inactive",
            Self::UnknownItem(_) => "unknown_item",
            Self::Store(_) => "store",
        }
    }

    /// Whether redoing the same work later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Store(_))
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth { code } => Self::Auth { code },
            ProviderError::MalformedPage(reason) => Self::MalformedPage(reason),
            other if other.is_retryable() => Self::Transient(other),
            other => Self::Provider(other),
        }
    }
}

/// Result of one item sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub pages: u32,
    pub next_cursor: Option<String>,
    pub history_refreshed: usize,
    pub affected: HashMap<Uuid, NaiveDate>,
}

impl SyncOutcome {
    pub fn updated(&self) -> bool {
        self.added + self.modified + self.removed > 0
    }

    fn absorb(&mut self, page: ReconcileOutcome) {
        self.added += page.added;
        self.modified += page.modified;
        self.unchanged += page.unchanged;
        self.removed += page.removed;
        for (account_id, date) in page.affected {
            self.affected
                .entry(account_id)
                .and_modify(|d| *d = (*d).min(date))
                .or_insert(date);
        }
    }
}

/// Response shape of `sync_account`.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSyncResult {
    pub updated: bool,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct SyncService {
    db: Database,
    reconciler: Reconciler,
    history: HistoryCache,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(db: Database, reconciler: Reconciler, history: HistoryCache, config: SyncConfig) -> Self {
        Self {
            db,
            reconciler,
            history,
            config,
        }
    }

    /// Sync one item end to end: accounts, every pending page, then history
    /// for the accounts that changed. Failures are recorded on the item.
    #[instrument(skip(self, client, item), fields(item_id = %item.item_id, trigger = %trigger))]
    pub async fn sync_item(
        &self,
        client: &dyn AggregatorClient,
        item: &LinkedItem,
        trigger: &str,
        window: Option<HistoryWindow>,
    ) -> Result<SyncOutcome, SyncError> {
        if !item.is_active {
            record_sync_run(trigger, "item_inactive");
            return Err(SyncError::ItemInactive(item.item_id));
        }

        let mut outcome = match self.run(client, item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let deactivate = matches!(e, SyncError::Auth { .. });
                warn!(error = %e, kind = e.kind(), deactivate = deactivate, "Item sync failed");
                record_sync_run(trigger, e.kind());
                record_error(e.kind());
                if let Err(store_err) = self
                    .db
                    .record_item_error(item.item_id, &format!("{}: {}", e.kind(), e), deactivate)
                    .await
                {
                    error!(error = %store_err, "Failed to record item error");
                }
                return Err(e);
            }
        };

        self.db.mark_item_refreshed(item.item_id).await?;
        outcome.history_refreshed = self.refresh_history(&outcome.affected, window).await;
        record_sync_run(trigger, "success");

        info!(
            added = outcome.added,
            modified = outcome.modified,
            removed = outcome.removed,
            pages = outcome.pages,
            history_refreshed = outcome.history_refreshed,
            "Item sync complete"
        );
        Ok(outcome)
    }

    async fn run(
        &self,
        client: &dyn AggregatorClient,
        item: &LinkedItem,
    ) -> Result<SyncOutcome, SyncError> {
        let retry = self.config.retry_config();
        let mut outcome = SyncOutcome::default();

        let (accounts, balance_changed) = self.refresh_accounts(client, item).await?;
        let today = Utc::now().date_naive();
        let default_start = today - Duration::days(self.history.config().default_days - 1);
        for account_id in balance_changed {
            outcome.affected.entry(account_id).or_insert(default_start);
        }

        let mut cursor = self.db.get_cursor(item.item_id, Product::Transactions).await?;

        loop {
            let credential = &item.access_token;
            let current = cursor.as_deref();
            let page = retry_with_backoff(&retry, "transactions_sync", || {
                client.transactions_sync(credential, current)
            })
            .await?;

            page.validate()?;
            if let Some(unknown) = page
                .added
                .iter()
                .chain(page.modified.iter())
                .find(|t| !accounts.contains_key(&t.account_id))
            {
                return Err(SyncError::MalformedPage(format!(
                    "transaction {} references unknown account {}",
                    unknown.transaction_id, unknown.account_id
                )));
            }

            let applied = self.reconciler.apply(&page, &accounts).await?;
            // The page is committed; only now may its cursor be persisted.
            self.db
                .save_cursor(item.item_id, Product::Transactions, &page.next_cursor)
                .await?;

            outcome.absorb(applied);
            outcome.pages += 1;
            cursor = Some(page.next_cursor);

            if !page.has_more {
                break;
            }
            if outcome.pages >= self.config.max_pages {
                warn!(pages = outcome.pages, "Page cap reached; remaining pages left for the next run");
                break;
            }
        }

        outcome.next_cursor = cursor;
        Ok(outcome)
    }

    /// Pull current account metadata and balances. Returns the item's
    /// accounts keyed by aggregator id and the ids whose balance moved.
    #[instrument(skip(self, client, item), fields(item_id = %item.item_id))]
    pub async fn refresh_accounts(
        &self,
        client: &dyn AggregatorClient,
        item: &LinkedItem,
    ) -> Result<(AccountIndex, Vec<Uuid>), SyncError> {
        let retry = self.config.retry_config();
        let credential = &item.access_token;

        let previous: HashMap<Uuid, _> = self
            .db
            .list_item_accounts(item.item_id)
            .await?
            .into_iter()
            .map(|a| (a.account_id, a))
            .collect();

        let provider_accounts =
            retry_with_backoff(&retry, "get_accounts", || client.get_accounts(credential)).await?;

        let mut index = AccountIndex::new();
        let mut changed = Vec::new();
        for provider in &provider_accounts {
            let account = self.db.upsert_provider_account(item, provider).await?;
            match previous.get(&account.account_id) {
                None => changed.push(account.account_id),
                Some(old) if old.current_balance != account.current_balance => {
                    self.db.mark_ledger_changed(account.account_id).await?;
                    changed.push(account.account_id);
                }
                Some(_) => {}
            }
            index.insert(provider.account_id.clone(), account);
        }

        // Accounts the aggregator stopped reporting still own their history.
        for account in previous.into_values() {
            index
                .entry(account.external_account_id.clone())
                .or_insert(account);
        }

        Ok((index, changed))
    }

    /// Recompute stored history for each affected account. A change dated X
    /// moves every balance before X as well, so without an explicit window the
    /// whole default window is rewritten. One account's failure is logged and
    /// does not stop the others.
    async fn refresh_history(
        &self,
        affected: &HashMap<Uuid, NaiveDate>,
        window: Option<HistoryWindow>,
    ) -> usize {
        let today = Utc::now().date_naive();
        let floor = today - Duration::days(self.history.config().default_days - 1);
        let mut refreshed = 0;

        for (account_id, earliest) in affected {
            let account = match self.db.get_account(*account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => continue,
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "Failed to load account for history refresh");
                    continue;
                }
            };

            debug!(account_id = %account_id, earliest = %earliest, "Refreshing balance history");
            let target = match window {
                Some(window) => Ok(window),
                None => HistoryWindow::new(floor, today, today),
            };
            let result = match target {
                Ok(target) => self.history.refresh(&account, target).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    record_error("history_refresh");
                    warn!(account_id = %account_id, error = %e, "Balance history refresh failed");
                }
            }
        }
        refreshed
    }

    /// Caller-facing sync of the item behind one account.
    #[instrument(skip(self, client), fields(account_id = %account_id, owner_id = %owner_id))]
    pub async fn sync_account(
        &self,
        client: &dyn AggregatorClient,
        account_id: Uuid,
        owner_id: &str,
        window: Option<HistoryWindow>,
    ) -> Result<AccountSyncResult, AppError> {
        let account = self
            .db
            .get_account(account_id)
            .await?
            .filter(|a| a.owner_id == owner_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account not found")))?;

        let item = self.db.get_item(account.item_id).await?.ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Account has no linked item"))
        })?;

        match self.sync_item(client, &item, "manual", window).await {
            Ok(outcome) => Ok(AccountSyncResult {
                updated: outcome.updated(),
                added: outcome.added,
                modified: outcome.modified,
                removed: outcome.removed,
                error: None,
            }),
            Err(SyncError::Store(e)) => Err(e),
            Err(e) => Ok(AccountSyncResult {
                updated: false,
                added: 0,
                modified: 0,
                removed: 0,
                error: Some(format!("{}: {}", e.kind(), e)),
            }),
        }
    }

    /// Sync every active item, one task each.
    pub async fn sync_all_items(
        self: &Arc<Self>,
        client: Arc<dyn AggregatorClient>,
        trigger: &'static str,
    ) -> Result<SyncSummary, AppError> {
        let items = self.db.list_active_items().await?;
        let mut tasks = JoinSet::new();

        for item in items {
            let service = Arc::clone(self);
            let client = Arc::clone(&client);
            tasks.spawn(async move {
                service
                    .sync_item(client.as_ref(), &item, trigger, None)
                    .await
                    .is_ok()
            });
        }

        let mut summary = SyncSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "Sync task panicked");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Holdings changed upstream: refresh balances and recompute history for
    /// the item's investment accounts.
    #[instrument(skip(self, client, item), fields(item_id = %item.item_id))]
    pub async fn refresh_holdings(
        &self,
        client: &dyn AggregatorClient,
        item: &LinkedItem,
    ) -> Result<usize, SyncError> {
        if !item.is_active {
            return Err(SyncError::ItemInactive(item.item_id));
        }
        let (accounts, _) = self.refresh_accounts(client, item).await?;
        let today = Utc::now().date_naive();
        let start = today - Duration::days(self.history.config().default_days - 1);

        let affected: HashMap<Uuid, NaiveDate> = accounts
            .values()
            .filter(|a| a.account_type == AccountType::Investment)
            .map(|a| (a.account_id, start))
            .collect();
        Ok(self.refresh_history(&affected, None).await)
    }

    /// New or changed accounts upstream.
    pub async fn refresh_account_metadata(
        &self,
        client: &dyn AggregatorClient,
        item: &LinkedItem,
    ) -> Result<usize, SyncError> {
        if !item.is_active {
            return Err(SyncError::ItemInactive(item.item_id));
        }
        let (accounts, changed) = self.refresh_accounts(client, item).await?;
        let today = Utc::now().date_naive();
        let start = today - Duration::days(self.history.config().default_days - 1);
        let affected: HashMap<Uuid, NaiveDate> = changed.into_iter().map(|id| (id, start)).collect();
        self.refresh_history(&affected, None).await;
        Ok(accounts.len())
    }
}
