//! Prometheus metrics for ledger-sync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_sync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for item sync runs by outcome.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_runs_total",
        "Total number of item sync runs",
        &["trigger", "outcome"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Counter for reconciled transaction records by action.
pub static RECONCILED_RECORDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_reconciled_records_total",
        "Transaction records applied by the reconciler",
        &["action"]
    )
    .expect("Failed to register RECONCILED_RECORDS")
});

pub static BALANCE_RECONSTRUCTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_balance_reconstructions_total",
        "Balance series computed by the history engine",
        &["mode"]
    )
    .expect("Failed to register BALANCE_RECONSTRUCTIONS")
});

pub static HISTORY_CACHE: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_history_cache_total",
        "Balance history cache lookups",
        &["result"]
    )
    .expect("Failed to register HISTORY_CACHE")
});

/// Counter for webhook deliveries by final state.
pub static WEBHOOK_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_webhook_events_total",
        "Webhook deliveries by category and final state",
        &["category", "state"]
    )
    .expect("Failed to register WEBHOOK_EVENTS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&RECONCILED_RECORDS);
    Lazy::force(&BALANCE_RECONSTRUCTIONS);
    Lazy::force(&HISTORY_CACHE);
    Lazy::force(&WEBHOOK_EVENTS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

pub fn record_sync_run(trigger: &str, outcome: &str) {
    SYNC_RUNS.with_label_values(&[trigger, outcome]).inc();
}

pub fn record_reconciled(action: &str, count: usize) {
    if count > 0 {
        RECONCILED_RECORDS
            .with_label_values(&[action])
            .inc_by(count as f64);
    }
}

pub fn record_reconstruction(mode: &str) {
    BALANCE_RECONSTRUCTIONS.with_label_values(&[mode]).inc();
}

pub fn record_cache_lookup(result: &str) {
    HISTORY_CACHE.with_label_values(&[result]).inc();
}

pub fn record_webhook(category: &str, state: &str) {
    WEBHOOK_EVENTS.with_label_values(&[category, state]).inc();
}
