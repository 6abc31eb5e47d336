//! Balance history endpoints.

use crate::config::HistoryConfig;
use crate::middleware::OwnerContext;
use crate::models::BalancePoint;
use crate::services::{HistorySource, HistoryWindow};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

pub const HISTORY_SOURCE_HEADER: &str = "x-history-source";

#[derive(Debug, Deserialize, Validate)]
pub struct BalanceHistoryQuery {
    #[validate(range(min = 1))]
    pub days: Option<i64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub include_internal: bool,
}

/// Turn `days` or an explicit range into a window ending no later than today.
pub fn parse_window(
    days: Option<i64>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    today: NaiveDate,
    config: &HistoryConfig,
) -> Result<HistoryWindow, AppError> {
    if days.is_some_and(|days| days > config.max_days) {
        return Err(window_too_long(config.max_days));
    }

    let window = match (days, start_date, end_date) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "days cannot be combined with start_date/end_date"
            )));
        }
        (Some(days), None, None) => HistoryWindow::trailing(days, today)?,
        (None, Some(start), Some(end)) => HistoryWindow::new(start, end, today)?,
        (None, Some(start), None) => HistoryWindow::new(start, today, today)?,
        (None, None, Some(end)) => HistoryWindow::ending(config.default_days, end.min(today), today)?,
        (None, None, None) => HistoryWindow::trailing(config.default_days, today)?,
    };

    if window.day_count() > config.max_days {
        return Err(window_too_long(config.max_days));
    }

    Ok(window)
}

fn window_too_long(max_days: i64) -> AppError {
    let mut errors = ValidationErrors::new();
    let mut error = ValidationError::new("window_too_long");
    error.message = Some(format!("window may span at most {} days", max_days).into());
    errors.add("days", error);
    AppError::ValidationError(errors)
}

fn source_label(source: HistorySource) -> &'static str {
    match source {
        HistorySource::Cache => "cache",
        HistorySource::Computed => "computed",
    }
}

/// `GET /accounts/:account_id/balance-history`
pub async fn account_history(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(account_id): Path<Uuid>,
    Query(query): Query<BalanceHistoryQuery>,
) -> Result<impl IntoResponse, AppError> {
    query.validate()?;
    let today = Utc::now().date_naive();
    let window = parse_window(
        query.days,
        query.start_date,
        query.end_date,
        today,
        &state.config.history,
    )?;

    let account = state
        .db
        .get_account(account_id)
        .await?
        .filter(|a| a.owner_id == owner.owner_id)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account not found")))?;

    let result = state
        .history
        .get(&account, window, query.force, query.include_internal)
        .await?;

    tracing::debug!(
        account_id = %account_id,
        days = result.points.len(),
        source = source_label(result.source),
        "Balance history served"
    );

    Ok((
        [(HISTORY_SOURCE_HEADER, source_label(result.source))],
        Json(result.points),
    ))
}

/// `GET /owners/:owner_id/balance-history`
pub async fn owner_history(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(owner_id): Path<String>,
    Query(query): Query<BalanceHistoryQuery>,
) -> Result<Json<Vec<BalancePoint>>, AppError> {
    if owner_id != owner.owner_id {
        return Err(AppError::NotFound(anyhow::anyhow!("Owner not found")));
    }
    query.validate()?;
    let today = Utc::now().date_naive();
    let window = parse_window(
        query.days,
        query.start_date,
        query.end_date,
        today,
        &state.config.history,
    )?;

    let accounts = state.db.list_owner_accounts(&owner_id).await?;
    let points = state
        .history
        .owner_series(&accounts, window, query.force, query.include_internal)
        .await?;

    Ok(Json(points))
}
