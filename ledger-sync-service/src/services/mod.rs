//! Services module for ledger-sync-service.

pub mod aggregator;
pub mod balance_history;
pub mod database;
pub mod history_cache;
pub mod metrics;
pub mod normalizer;
pub mod reconciler;
pub mod scheduler;
pub mod sync;
pub mod webhook;

pub use aggregator::{AggregatorClient, HttpAggregatorClient, ProviderError};
pub use balance_history::{reconstruct, HistoryError};
pub use database::Database;
pub use history_cache::{HistoryCache, HistoryResult, HistorySource, HistoryWindow};
pub use metrics::{get_metrics, init_metrics, record_error};
pub use normalizer::Normalizer;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use sync::{AccountSyncResult, SyncError, SyncOutcome, SyncService, SyncSummary};
pub use webhook::{DispatchOutcome, WebhookDispatcher, WebhookTask};
