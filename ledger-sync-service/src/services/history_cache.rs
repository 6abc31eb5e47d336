//! Balance history cache.
//!
//! A window is served from `balance_history` only when every day in it has a
//! row, no row predates the account's last ledger change, and the newest row
//! is inside the staleness cutoff. Misses recompute through the engine and
//! upsert rows strictly inside the requested window.

use crate::config::HistoryConfig;
use crate::models::{Account, BalancePoint, HistoryMode};
use crate::services::balance_history::{reconstruct_window, HistoryError};
use crate::services::database::Database;
use crate::services::metrics::{record_cache_lookup, record_reconstruction};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Where a series came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Cache,
    Computed,
}

#[derive(Debug, Clone)]
pub struct HistoryResult {
    pub points: Vec<BalancePoint>,
    pub source: HistorySource,
}

/// Inclusive day range, already clamped to today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl HistoryWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, today: NaiveDate) -> Result<Self, HistoryError> {
        let end = end.min(today);
        if start > end {
            return Err(HistoryError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// The last `days` days ending today.
    pub fn trailing(days: i64, today: NaiveDate) -> Result<Self, HistoryError> {
        Self::ending(days, today, today)
    }

    /// `days` days ending on `end`. A start before the calendar's range is an
    /// invalid window, not a panic.
    pub fn ending(days: i64, end: NaiveDate, today: NaiveDate) -> Result<Self, HistoryError> {
        let start = chrono::Duration::try_days(days.max(1) - 1)
            .and_then(|span| end.checked_sub_signed(span))
            .ok_or(HistoryError::InvalidWindow {
                start: NaiveDate::MIN,
                end,
            })?;
        Self::new(start, end, today)
    }

    pub fn day_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Clone)]
pub struct HistoryCache {
    db: Database,
    config: HistoryConfig,
}

impl HistoryCache {
    pub fn new(db: Database, config: HistoryConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    #[instrument(skip(self, account), fields(account_id = %account.account_id))]
    pub async fn get(
        &self,
        account: &Account,
        window: HistoryWindow,
        force: bool,
        include_internal: bool,
    ) -> Result<HistoryResult, HistoryError> {
        let mode = HistoryMode::from_include_internal(include_internal);

        if !force && mode == HistoryMode::Exclusive {
            if let Some(points) = self.lookup(account, window).await? {
                record_cache_lookup("hit");
                debug!(days = points.len(), "Balance history served from cache");
                return Ok(HistoryResult {
                    points,
                    source: HistorySource::Cache,
                });
            }
        }
        record_cache_lookup(match (mode, force) {
            (HistoryMode::Inclusive, _) => "bypass",
            (_, true) => "forced",
            _ => "miss",
        });

        let points = self.compute(account, window, mode).await?;

        // Inclusive series never share storage with exclusive ones.
        if mode == HistoryMode::Exclusive {
            let written = self
                .db
                .upsert_history_rows(
                    account.account_id,
                    account.is_hidden,
                    window.start,
                    window.end,
                    &points,
                )
                .await?;
            info!(rows = written, "Balance history cached");
        }

        Ok(HistoryResult {
            points,
            source: HistorySource::Computed,
        })
    }

    /// Recompute and store the exclusive series for `window`.
    pub async fn refresh(
        &self,
        account: &Account,
        window: HistoryWindow,
    ) -> Result<HistoryResult, HistoryError> {
        self.get(account, window, true, false).await
    }

    async fn lookup(
        &self,
        account: &Account,
        window: HistoryWindow,
    ) -> Result<Option<Vec<BalancePoint>>, HistoryError> {
        let rows = self
            .db
            .get_history_rows(account.account_id, window.start, window.end)
            .await?;

        if rows.len() as i64 != window.day_count() {
            debug!(
                stored = rows.len(),
                expected = window.day_count(),
                "Cached window incomplete"
            );
            return Ok(None);
        }

        // Rows written before the ledger last changed may predate a
        // transaction that moves them.
        let oldest = rows.iter().map(|r| r.updated_utc).min();
        if let (Some(oldest), Some(changed)) = (oldest, account.ledger_changed_utc) {
            if oldest < changed {
                debug!(%oldest, %changed, "Cached window predates a ledger change");
                return Ok(None);
            }
        }

        let cutoff = Utc::now() - self.config.staleness;
        let fresh = rows.iter().map(|r| r.updated_utc).max().is_some_and(|t| t >= cutoff);
        if !fresh {
            debug!("Cached window stale");
            return Ok(None);
        }

        Ok(Some(rows.into_iter().map(BalancePoint::from).collect()))
    }

    async fn compute(
        &self,
        account: &Account,
        window: HistoryWindow,
        mode: HistoryMode,
    ) -> Result<Vec<BalancePoint>, HistoryError> {
        let today = Utc::now().date_naive();
        let deltas = self
            .db
            .daily_deltas(
                account,
                window.start,
                today,
                mode == HistoryMode::Inclusive,
            )
            .await?;

        record_reconstruction(mode.as_str());
        reconstruct_window(account.current_balance, &deltas, window.start, window.end, today)
    }

    /// Per-day total across an owner's accounts. Exclusive mode leaves hidden
    /// accounts and internal transfers out.
    #[instrument(skip(self, accounts), fields(accounts = accounts.len()))]
    pub async fn owner_series(
        &self,
        accounts: &[Account],
        window: HistoryWindow,
        force: bool,
        include_internal: bool,
    ) -> Result<Vec<BalancePoint>, HistoryError> {
        let mut totals: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        let mut date = window.start;
        while date <= window.end {
            totals.insert(date, Decimal::ZERO);
            date += chrono::Duration::days(1);
        }

        for account in accounts {
            if account.is_hidden && !include_internal {
                continue;
            }
            let series = self.get(account, window, force, include_internal).await?;
            for point in series.points {
                if let Some(total) = totals.get_mut(&point.date) {
                    *total += point.balance;
                }
            }
        }

        Ok(totals
            .into_iter()
            .map(|(date, balance)| BalancePoint { date, balance })
            .collect())
    }
}
