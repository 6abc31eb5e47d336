//! Integration tests for the signed webhook endpoint.

mod common;

use common::{days_ago, page, provider_account, provider_txn, spawn_app, WEBHOOK_SECRET};
use ledger_sync_service::models::WebhookState;
use ledger_sync_service::services::ProviderError;
use serde_json::{json, Value};
use service_core::utils::signature::signature_header;
use uuid::Uuid;

fn event(category: &str, code: &str, item_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "webhook_type": category,
        "webhook_code": code,
        "item_id": item_id,
    }))
    .unwrap()
}

fn event_id(body: &Value) -> Uuid {
    Uuid::parse_str(body["event_id"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn tampered_body_is_rejected_without_side_effects() {
    let app = spawn_app().await;
    app.seed_item("item-tamper").await;

    let body = event("TRANSACTIONS", "SYNC_UPDATES_AVAILABLE", "item-tamper");
    let header = signature_header(WEBHOOK_SECRET, chrono::Utc::now().timestamp(), &body).unwrap();
    let tampered = event("TRANSACTIONS", "SYNC_UPDATES_AVAILABLE", "item-other");

    let response = app.post_webhook_with_header(&tampered, Some(header)).await;
    assert_eq!(response.status().as_u16(), 401);

    assert_eq!(app.count("webhook_events").await, 0);
    assert_eq!(app.aggregator.sync_calls(), 0);
    assert_eq!(app.aggregator.account_calls(), 0);
}

#[tokio::test]
async fn missing_or_expired_signature_is_rejected() {
    let app = spawn_app().await;
    let body = event("TRANSACTIONS", "SYNC_UPDATES_AVAILABLE", "item-x");

    let unsigned = app.post_webhook_with_header(&body, None).await;
    assert_eq!(unsigned.status().as_u16(), 401);

    let old = chrono::Utc::now().timestamp() - 3600;
    let expired = signature_header(WEBHOOK_SECRET, old, &body).unwrap();
    let response = app.post_webhook_with_header(&body, Some(expired)).await;
    assert_eq!(response.status().as_u16(), 401);

    assert_eq!(app.count("webhook_events").await, 0);
}

#[tokio::test]
async fn signed_garbage_is_a_bad_request() {
    let app = spawn_app().await;
    let response = app.post_webhook(b"not json").await;
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(app.count("webhook_events").await, 0);
}

#[tokio::test]
async fn sync_event_runs_a_sync_and_acks() {
    let app = spawn_app().await;
    app.seed_item("item-hook").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "300.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "30.00", days_ago(2))],
        &[],
        "cursor-1",
        false,
    ));

    let response = app
        .post_webhook(&event("TRANSACTIONS", "SYNC_UPDATES_AVAILABLE", "item-hook"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "acked");
    assert_eq!(body["task"], "transaction_resync");

    let record = app
        .db
        .get_webhook_event(event_id(&body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, WebhookState::Acked);
    assert_eq!(record.external_item_id.as_deref(), Some("item-hook"));
    assert_eq!(app.count("transactions").await, 1);
}

#[tokio::test]
async fn unhandled_event_is_recorded_and_acked() {
    let app = spawn_app().await;
    let response = app
        .post_webhook(&event("AUTH", "AUTOMATICALLY_VERIFIED", "item-any"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "acked");
    assert!(body["task"].is_null());
    assert_eq!(app.count("webhook_events").await, 1);
    assert_eq!(app.aggregator.sync_calls(), 0);
}

#[tokio::test]
async fn transient_failure_asks_for_redelivery() {
    let app = spawn_app().await;
    app.seed_item("item-flaky").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "300.00")]);
    for _ in 0..3 {
        app.aggregator.push_error(ProviderError::ServerError { status: 503 });
    }

    let response = app
        .post_webhook(&event("TRANSACTIONS", "SYNC_UPDATES_AVAILABLE", "item-flaky"))
        .await;
    assert_eq!(response.status().as_u16(), 503);
    let body: Value = response.json().await.unwrap();

    let record = app
        .db
        .get_webhook_event(event_id(&body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, WebhookState::Failed);
    assert!(record.error.unwrap().starts_with("transient"));
    assert_eq!(app.count("webhook_dead_letters").await, 0);
}

#[tokio::test]
async fn permanent_failure_is_dead_lettered() {
    let app = spawn_app().await;

    let response = app
        .post_webhook(&event("TRANSACTIONS", "SYNC_UPDATES_AVAILABLE", "item-missing"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "dead_lettered");

    let record = app
        .db
        .get_webhook_event(event_id(&body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, WebhookState::Failed);
    assert_eq!(app.count("webhook_dead_letters").await, 1);
}

#[tokio::test]
async fn inactive_item_is_acked_without_work() {
    let app = spawn_app().await;
    let item = app.seed_item("item-dormant").await;
    app.db
        .record_item_error(item.item_id, "auth: ITEM_LOGIN_REQUIRED", true)
        .await
        .unwrap();

    let response = app
        .post_webhook(&event("TRANSACTIONS", "DEFAULT_UPDATE", "item-dormant"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "acked");
    assert_eq!(app.aggregator.sync_calls(), 0);
}

#[tokio::test]
async fn revoked_permission_deactivates_item() {
    let app = spawn_app().await;
    let item = app.seed_item("item-revoked").await;

    let response = app
        .post_webhook(&event("ITEM", "USER_PERMISSION_REVOKED", "item-revoked"))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let stored = app.db.get_item(item.item_id).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert!(stored.last_error.is_some());
}
