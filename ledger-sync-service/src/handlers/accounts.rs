//! Account preferences.

use crate::middleware::OwnerContext;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct HiddenRequest {
    pub hidden: bool,
}

#[derive(Debug, Serialize)]
pub struct HiddenResponse {
    pub account_id: Uuid,
    pub hidden: bool,
}

/// `PUT /accounts/:account_id/hidden`
///
/// Hidden accounts drop out of exclusive owner totals. Syncs never reset the
/// flag.
pub async fn set_hidden(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(account_id): Path<Uuid>,
    Json(request): Json<HiddenRequest>,
) -> Result<Json<HiddenResponse>, AppError> {
    state
        .db
        .get_account(account_id)
        .await?
        .filter(|a| a.owner_id == owner.owner_id)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account not found")))?;

    state
        .db
        .set_account_hidden(account_id, request.hidden)
        .await?;
    tracing::info!(account_id = %account_id, hidden = request.hidden, "Account visibility updated");

    Ok(Json(HiddenResponse {
        account_id,
        hidden: request.hidden,
    }))
}
