//! Application startup and lifecycle management.

use crate::config::SyncServiceConfig;
use crate::handlers::{accounts, balances, categories, health, sync, webhooks};
use crate::services::scheduler::spawn_poller;
use crate::services::{
    init_metrics, AggregatorClient, Database, HistoryCache, HttpAggregatorClient, Normalizer,
    Reconciler, SyncService, WebhookDispatcher,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SyncServiceConfig,
    pub db: Database,
    pub aggregator: Arc<dyn AggregatorClient>,
    pub normalizer: Arc<Normalizer>,
    pub sync: Arc<SyncService>,
    pub history: Arc<HistoryCache>,
    pub webhooks: Arc<WebhookDispatcher>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application against the configured aggregator.
    pub async fn build(config: SyncServiceConfig) -> Result<Self, AppError> {
        let client = HttpAggregatorClient::new(config.aggregator.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to build aggregator client");
            AppError::ConfigError(anyhow::anyhow!("aggregator client: {}", e))
        })?;
        Self::build_with_client(config, Arc::new(client)).await
    }

    /// Build the application with a caller-supplied aggregator client.
    pub async fn build_with_client(
        config: SyncServiceConfig,
        aggregator: Arc<dyn AggregatorClient>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(&config.database.url, config.database.max_connections)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to open database");
                e
            })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let normalizer = Arc::new(Normalizer::new());
        let warmed = normalizer.warm(&db).await?;
        tracing::debug!(categories = warmed, "Category cache warmed");

        let history = HistoryCache::new(db.clone(), config.history.clone());
        let reconciler = Reconciler::new(
            db.clone(),
            Arc::clone(&normalizer),
            config.sync.transfer_tolerance_days,
        );
        let sync = Arc::new(SyncService::new(
            db.clone(),
            reconciler,
            history.clone(),
            config.sync.clone(),
        ));
        let webhooks = Arc::new(WebhookDispatcher::new(
            db.clone(),
            Arc::clone(&sync),
            config.webhook.secret.clone(),
            config.webhook.tolerance_secs,
        ));

        let state = AppState {
            config: config.clone(),
            db,
            aggregator,
            normalizer,
            sync,
            history: Arc::new(history),
            webhooks,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Ledger sync service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(health::health_check))
            .route("/ready", get(health::readiness_check))
            .route("/metrics", get(health::metrics_handler))
            .route("/accounts/:account_id/sync", post(sync::sync_account))
            .route("/accounts/:account_id/hidden", put(accounts::set_hidden))
            .route(
                "/accounts/:account_id/balance-history",
                get(balances::account_history),
            )
            .route(
                "/owners/:owner_id/balance-history",
                get(balances::owner_history),
            )
            .route("/categories/:slug/path", get(categories::category_path))
            .route("/webhooks/aggregator", post(webhooks::aggregator_webhook))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state.clone());

        let poll_interval = self.state.config.sync.poll_interval;
        let poller = if poll_interval.is_zero() {
            tracing::info!("Background polling disabled");
            None
        } else {
            Some(spawn_poller(
                Arc::clone(&self.state.sync),
                Arc::clone(&self.state.aggregator),
                poll_interval,
            ))
        };

        tracing::info!(
            service = "ledger-sync-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, router).await;

        if let Some(poller) = poller {
            poller.abort();
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
