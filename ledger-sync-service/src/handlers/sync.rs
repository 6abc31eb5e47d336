//! Manual sync trigger.

use crate::handlers::balances::parse_window;
use crate::middleware::OwnerContext;
use crate::services::AccountSyncResult;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// `POST /accounts/:account_id/sync`
///
/// Sync failures come back in the body's `error` field with a 200; only
/// store failures and unknown accounts are HTTP errors.
pub async fn sync_account(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(account_id): Path<Uuid>,
    body: Option<Json<SyncRequest>>,
) -> Result<Json<AccountSyncResult>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let today = Utc::now().date_naive();

    let window = match (request.start_date, request.end_date) {
        (None, None) => None,
        (start, end) => Some(parse_window(
            None,
            start,
            end,
            today,
            &state.config.history,
        )?),
    };

    tracing::info!(account_id = %account_id, owner_id = %owner.owner_id, "Manual sync requested");

    let result = state
        .sync
        .sync_account(state.aggregator.as_ref(), account_id, &owner.owner_id, window)
        .await?;

    Ok(Json(result))
}
