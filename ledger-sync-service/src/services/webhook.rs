//! Webhook dispatcher.
//!
//! `Received -> Verified -> Dispatched -> Acked`, with `Rejected` for deliveries
//! that fail verification (nothing is written) and `Failed` for handler errors.
//! Transient handler failures ask the aggregator to redeliver; anything else is
//! dead-lettered and acknowledged.

use crate::models::{LinkedItem, WebhookPayload, WebhookState};
use crate::services::aggregator::AggregatorClient;
use crate::services::database::Database;
use crate::services::metrics::record_webhook;
use crate::services::sync::{SyncError, SyncService};
use secrecy::{ExposeSecret, Secret};
use service_core::utils::signature::{verify_signature_header, SignatureError};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "X-Aggregator-Signature";

/// Work a verified event maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookTask {
    TransactionResync,
    HoldingsResync,
    AccountMetadataRefresh,
}

impl WebhookTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionResync => "transaction_resync",
            Self::HoldingsResync => "holdings_resync",
            Self::AccountMetadataRefresh => "account_metadata_refresh",
        }
    }

    /// `None` for events this service does not act on.
    pub fn for_event(category: &str, code: &str) -> Option<Self> {
        match (category, code) {
            (
                "TRANSACTIONS",
                "SYNC_UPDATES_AVAILABLE" | "DEFAULT_UPDATE" | "INITIAL_UPDATE"
                | "HISTORICAL_UPDATE" | "TRANSACTIONS_REMOVED",
            ) => Some(Self::TransactionResync),
            ("HOLDINGS" | "INVESTMENTS_TRANSACTIONS", _) => Some(Self::HoldingsResync),
            (
                "ITEM",
                "NEW_ACCOUNTS_AVAILABLE" | "ERROR" | "PENDING_EXPIRATION"
                | "USER_PERMISSION_REVOKED",
            ) => Some(Self::AccountMetadataRefresh),
            _ => None,
        }
    }
}

/// How a delivery ended; the HTTP layer maps this to a status code.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Failed verification or unparseable body. Nothing was written.
    Rejected(RejectReason),
    Acked {
        event_id: Uuid,
        task: Option<WebhookTask>,
    },
    DeadLettered {
        event_id: Uuid,
        dead_letter_id: Uuid,
    },
    /// Transient failure; the aggregator should deliver again.
    RetryLater { event_id: Uuid, error: String },
}

#[derive(Debug)]
pub enum RejectReason {
    Signature(SignatureError),
    Body(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signature(e) => write!(f, "{}", e),
            Self::Body(e) => write!(f, "invalid body: {}", e),
        }
    }
}

pub struct WebhookDispatcher {
    db: Database,
    sync: Arc<SyncService>,
    secret: Secret<String>,
    tolerance_secs: i64,
}

impl WebhookDispatcher {
    pub fn new(
        db: Database,
        sync: Arc<SyncService>,
        secret: Secret<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            db,
            sync,
            secret,
            tolerance_secs,
        }
    }

    #[instrument(skip_all)]
    pub async fn dispatch(
        &self,
        client: &dyn AggregatorClient,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<DispatchOutcome, service_core::error::AppError> {
        // Received: verify before anything touches storage.
        if let Err(e) = verify_signature_header(
            self.secret.expose_secret(),
            signature,
            body,
            now,
            self.tolerance_secs,
        ) {
            warn!(error = %e, "Webhook signature rejected");
            record_webhook("unknown", WebhookState::Rejected.as_str());
            return Ok(DispatchOutcome::Rejected(RejectReason::Signature(e)));
        }

        let payload: WebhookPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Webhook body rejected");
                record_webhook("unknown", WebhookState::Rejected.as_str());
                return Ok(DispatchOutcome::Rejected(RejectReason::Body(e.to_string())));
            }
        };

        // Verified: the audit record goes in first, whatever happens next.
        let raw = String::from_utf8_lossy(body);
        let event = self
            .db
            .insert_webhook_event(
                &payload.event_category,
                &payload.event_code,
                Some(payload.item_id.as_str()),
                &raw,
            )
            .await?;
        let event_id = event.event_id;

        info!(
            event_id = %event_id,
            category = %payload.event_category,
            code = %payload.event_code,
            item = %payload.item_id,
            "Webhook verified"
        );

        let Some(task) = WebhookTask::for_event(&payload.event_category, &payload.event_code)
        else {
            self.db
                .update_webhook_state(event_id, WebhookState::Acked, Some("no handler for event"))
                .await?;
            record_webhook(&payload.event_category, WebhookState::Acked.as_str());
            return Ok(DispatchOutcome::Acked {
                event_id,
                task: None,
            });
        };

        self.db
            .update_webhook_state(event_id, WebhookState::Dispatched, None)
            .await?;

        match self.run_task(client, task, &payload).await {
            Ok(()) => {
                self.db
                    .update_webhook_state(event_id, WebhookState::Acked, None)
                    .await?;
                record_webhook(&payload.event_category, WebhookState::Acked.as_str());
                Ok(DispatchOutcome::Acked {
                    event_id,
                    task: Some(task),
                })
            }
            Err(SyncError::ItemInactive(item_id)) => {
                info!(item_id = %item_id, "Webhook for inactive item acknowledged without work");
                self.db
                    .update_webhook_state(event_id, WebhookState::Acked, Some("item inactive"))
                    .await?;
                record_webhook(&payload.event_category, WebhookState::Acked.as_str());
                Ok(DispatchOutcome::Acked {
                    event_id,
                    task: Some(task),
                })
            }
            Err(e) => {
                let message = format!("{}: {}", e.kind(), e);
                self.db
                    .update_webhook_state(event_id, WebhookState::Failed, Some(&message))
                    .await?;
                record_webhook(&payload.event_category, WebhookState::Failed.as_str());

                if e.is_transient() {
                    warn!(event_id = %event_id, error = %message, "Webhook handler failed transiently; requesting redelivery");
                    return Ok(DispatchOutcome::RetryLater {
                        event_id,
                        error: message,
                    });
                }

                let dead_letter_id = self
                    .db
                    .insert_dead_letter(event_id, task.as_str(), &message, &raw)
                    .await?;
                warn!(event_id = %event_id, error = %message, "Webhook handler failed; dead-lettered");
                Ok(DispatchOutcome::DeadLettered {
                    event_id,
                    dead_letter_id,
                })
            }
        }
    }

    async fn run_task(
        &self,
        client: &dyn AggregatorClient,
        task: WebhookTask,
        payload: &WebhookPayload,
    ) -> Result<(), SyncError> {
        let item = self.find_item(&payload.item_id).await?;

        match task {
            WebhookTask::TransactionResync => {
                self.sync.sync_item(client, &item, "webhook", None).await?;
            }
            WebhookTask::HoldingsResync => {
                self.sync.refresh_holdings(client, &item).await?;
            }
            WebhookTask::AccountMetadataRefresh => match payload.event_code.as_str() {
                "NEW_ACCOUNTS_AVAILABLE" => {
                    self.sync.refresh_account_metadata(client, &item).await?;
                }
                code => {
                    let error_code = payload
                        .error
                        .as_ref()
                        .and_then(|e| e.get("error_code"))
                        .and_then(|c| c.as_str())
                        .unwrap_or(code);
                    let deactivate = code == "USER_PERMISSION_REVOKED"
                        || error_code == "ITEM_LOGIN_REQUIRED";
                    self.db
                        .record_item_error(
                            item.item_id,
                            &format!("{}: {}", code.to_lowercase(), error_code),
                            deactivate,
                        )
                        .await?;
                    info!(item_id = %item.item_id, code = %code, deactivate = deactivate, "Item status recorded from webhook");
                }
            },
        }
        Ok(())
    }

    async fn find_item(&self, external_item_id: &str) -> Result<LinkedItem, SyncError> {
        self.db
            .get_item_by_external_id(external_item_id)
            .await?
            .ok_or_else(|| SyncError::UnknownItem(external_item_id.to_string()))
    }
}
