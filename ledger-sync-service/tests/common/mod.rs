//! Common test utilities for ledger-sync-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ledger_sync_service::config::{
    AggregatorConfig, DatabaseConfig, HistoryConfig, SyncConfig, SyncServiceConfig, WebhookConfig,
};
use ledger_sync_service::models::{Account, LinkedItem};
use ledger_sync_service::services::aggregator::{
    DeltaPage, ProviderAccount, ProviderBalances, ProviderTransaction, RemovedTransaction,
};
use ledger_sync_service::services::{AggregatorClient, Database, ProviderError, SyncService};
use ledger_sync_service::startup::Application;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use service_core::config::Config as CommonConfig;
use service_core::utils::signature::signature_header;
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec-integration";
pub const OWNER_HEADER: &str = "X-Owner-ID";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,ledger_sync_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn days_ago(n: i64) -> NaiveDate {
    today() - chrono::Duration::days(n)
}

/// Aggregator double that replays queued responses in order. Once the page
/// queue is drained it reports an empty page at the caller's cursor.
#[derive(Default)]
pub struct ScriptedAggregator {
    pages: Mutex<VecDeque<Result<DeltaPage, ProviderError>>>,
    accounts: Mutex<Vec<ProviderAccount>>,
    cursors: Mutex<Vec<Option<String>>>,
    revoked: Mutex<HashSet<String>>,
    sync_calls: AtomicUsize,
    account_calls: AtomicUsize,
}

impl ScriptedAggregator {
    pub fn push_page(&self, page: DeltaPage) {
        self.pages.lock().unwrap().push_back(Ok(page));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.pages.lock().unwrap().push_back(Err(error));
    }

    /// Every call made with this credential fails with `ITEM_LOGIN_REQUIRED`.
    pub fn revoke(&self, credential: &str) {
        self.revoked.lock().unwrap().insert(credential.to_string());
    }

    fn check_credential(&self, credential: &Secret<String>) -> Result<(), ProviderError> {
        if self.revoked.lock().unwrap().contains(credential.expose_secret()) {
            return Err(ProviderError::Auth {
                code: "ITEM_LOGIN_REQUIRED".to_string(),
            });
        }
        Ok(())
    }

    pub fn set_accounts(&self, accounts: Vec<ProviderAccount>) {
        *self.accounts.lock().unwrap() = accounts;
    }

    /// Cursors passed to `transactions_sync`, oldest first.
    pub fn cursors_seen(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn account_calls(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AggregatorClient for ScriptedAggregator {
    async fn transactions_sync(
        &self,
        credential: &Secret<String>,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, ProviderError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.check_credential(credential)?;
        self.cursors
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));

        match self.pages.lock().unwrap().pop_front() {
            Some(next) => next,
            None => Ok(DeltaPage {
                next_cursor: cursor.unwrap_or("cursor-initial").to_string(),
                has_more: false,
                ..DeltaPage::default()
            }),
        }
    }

    async fn get_accounts(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        self.check_credential(credential)?;
        Ok(self.accounts.lock().unwrap().clone())
    }
}

pub fn provider_account(id: &str, account_type: &str, balance: &str) -> ProviderAccount {
    ProviderAccount {
        account_id: id.to_string(),
        name: format!("Account {}", id),
        account_type: account_type.to_string(),
        subtype: None,
        balances: ProviderBalances {
            current: Some(d(balance)),
            iso_currency_code: Some("USD".to_string()),
        },
    }
}

/// Aggregator-signed amount: positive means money left the account.
pub fn provider_txn(id: &str, account: &str, amount: &str, date: NaiveDate) -> ProviderTransaction {
    ProviderTransaction {
        transaction_id: id.to_string(),
        account_id: account.to_string(),
        amount: d(amount),
        date,
        name: Some("SQ *BLUE BOTTLE COFFEE".to_string()),
        merchant_name: None,
        original_description: None,
        category: Some(vec!["Food and Drink".to_string(), "Coffee Shop".to_string()]),
        pending: false,
        extra: serde_json::Map::new(),
    }
}

pub fn page(
    added: Vec<ProviderTransaction>,
    removed: &[&str],
    next_cursor: &str,
    has_more: bool,
) -> DeltaPage {
    DeltaPage {
        added,
        modified: Vec::new(),
        removed: removed
            .iter()
            .map(|id| RemovedTransaction {
                transaction_id: id.to_string(),
            })
            .collect(),
        next_cursor: next_cursor.to_string(),
        has_more,
    }
}

fn test_config(database_url: String) -> SyncServiceConfig {
    SyncServiceConfig {
        common: CommonConfig {
            port: 0,
            service_name: "ledger-sync-service-test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
        },
        database: DatabaseConfig {
            url: database_url,
            max_connections: 4,
        },
        aggregator: AggregatorConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            client_id: "test-client".to_string(),
            secret: Secret::new("test-secret".to_string()),
            timeout: Duration::from_secs(2),
            page_size: 100,
        },
        sync: SyncConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_pages: 20,
            poll_interval: Duration::ZERO,
            transfer_tolerance_days: 3,
        },
        webhook: WebhookConfig {
            secret: Secret::new(WEBHOOK_SECRET.to_string()),
            tolerance_secs: 300,
        },
        history: HistoryConfig {
            staleness: chrono::Duration::hours(24),
            default_days: 90,
            max_days: 400,
        },
    }
}

/// Test application wrapper.
pub struct TestApp {
    pub address: String,
    pub http_port: u16,
    pub db: Database,
    pub sync: Arc<SyncService>,
    pub aggregator: Arc<ScriptedAggregator>,
    pub client: reqwest::Client,
    pub owner_id: String,
    _dir: TempDir,
}

/// Spawn the service on a random port over a fresh SQLite file.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let database_url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let aggregator = Arc::new(ScriptedAggregator::default());

    let app = Application::build_with_client(test_config(database_url), aggregator.clone())
        .await
        .expect("Failed to build application");

    let http_port = app.http_port();
    let db = app.db().clone();
    let sync = app.state().sync.clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let address = format!("http://127.0.0.1:{}", http_port);
    let client = reqwest::Client::new();

    let mut attempts = 0;
    loop {
        match client.get(format!("{}/health", address)).send().await {
            Ok(_) => break,
            Err(_) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("Service did not come up after 20 attempts: {}", e),
        }
    }

    TestApp {
        address,
        http_port,
        db,
        sync,
        aggregator,
        client,
        owner_id: format!("owner-{}", Uuid::new_v4()),
        _dir: dir,
    }
}

impl TestApp {
    pub async fn seed_item(&self, external_item_id: &str) -> LinkedItem {
        self.db
            .create_item(
                external_item_id,
                &self.owner_id,
                &Secret::new(format!("access-{}", external_item_id)),
                Some("Test Bank"),
            )
            .await
            .expect("Failed to create item")
    }

    /// Run one sync for the item, reloading it first so flags are current.
    pub async fn sync(
        &self,
        item: &LinkedItem,
    ) -> Result<ledger_sync_service::services::SyncOutcome, ledger_sync_service::services::SyncError>
    {
        let item = self
            .db
            .get_item(item.item_id)
            .await
            .unwrap()
            .expect("item exists");
        self.sync
            .sync_item(self.aggregator.as_ref(), &item, "test", None)
            .await
    }

    pub async fn account(&self, item: &LinkedItem, external_account_id: &str) -> Account {
        self.db
            .list_item_accounts(item.item_id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.external_account_id == external_account_id)
            .expect("account exists")
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.db.pool())
            .await
            .unwrap()
    }

    /// Deliver a webhook signed with the configured secret.
    pub async fn post_webhook(&self, body: &[u8]) -> reqwest::Response {
        let header =
            signature_header(WEBHOOK_SECRET, Utc::now().timestamp(), body).unwrap();
        self.post_webhook_with_header(body, Some(header)).await
    }

    pub async fn post_webhook_with_header(
        &self,
        body: &[u8],
        header: Option<String>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("{}/webhooks/aggregator", self.address))
            .header("content-type", "application/json")
            .body(body.to_vec());
        if let Some(header) = header {
            request = request.header("X-Aggregator-Signature", header);
        }
        request.send().await.expect("Failed to send webhook")
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.address, path))
            .header(OWNER_HEADER, &self.owner_id)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.address, path))
            .header(OWNER_HEADER, &self.owner_id)
    }

    pub fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .put(format!("{}{}", self.address, path))
            .header(OWNER_HEADER, &self.owner_id)
    }
}
