//! Aggregator webhook endpoint.

use crate::services::webhook::{DispatchOutcome, RejectReason, SIGNATURE_HEADER};
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use service_core::error::AppError;

/// `POST /webhooks/aggregator`
///
/// 401 for failed verification, 400 for an unreadable body, 503 when the
/// handler hit a transient failure (the aggregator redelivers), 200 otherwise.
pub async fn aggregator_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let now = chrono::Utc::now().timestamp();

    let outcome = state
        .webhooks
        .dispatch(state.aggregator.as_ref(), signature, &body, now)
        .await?;

    let response = match outcome {
        DispatchOutcome::Rejected(reason) => {
            let status = match reason {
                RejectReason::Signature(_) => StatusCode::UNAUTHORIZED,
                RejectReason::Body(_) => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(json!({ "status": "rejected", "error": reason.to_string() })),
            )
                .into_response()
        }
        DispatchOutcome::Acked { event_id, task } => (
            StatusCode::OK,
            Json(json!({
                "status": "acked",
                "event_id": event_id,
                "task": task.map(|t| t.as_str()),
            })),
        )
            .into_response(),
        DispatchOutcome::DeadLettered {
            event_id,
            dead_letter_id,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "dead_lettered",
                "event_id": event_id,
                "dead_letter_id": dead_letter_id,
            })),
        )
            .into_response(),
        DispatchOutcome::RetryLater { event_id, error } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "retry",
                "event_id": event_id,
                "error": error,
            })),
        )
            .into_response(),
    };

    Ok(response)
}
