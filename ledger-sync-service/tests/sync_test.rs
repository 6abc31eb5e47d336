//! Integration tests for delta sync and reconciliation.

mod common;

use common::{days_ago, page, provider_account, provider_txn, spawn_app};
use ledger_sync_service::models::Product;
use ledger_sync_service::services::{AggregatorClient, ProviderError, SyncError, SyncSummary};
use serde_json::Value;
use std::sync::Arc;

#[tokio::test]
async fn replaying_a_page_writes_nothing_new() {
    let app = spawn_app().await;
    let item = app.seed_item("item-replay").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "1000.00")]);

    let first = page(
        vec![
            provider_txn("t-1", "acc-1", "12.50", days_ago(3)),
            provider_txn("t-2", "acc-1", "40.00", days_ago(2)),
        ],
        &[],
        "cursor-1",
        false,
    );
    app.aggregator.push_page(first.clone());
    let outcome = app.sync(&item).await.expect("first sync");
    assert_eq!(outcome.added, 2);
    assert_eq!(outcome.pages, 1);

    app.aggregator.push_page(first);
    let replay = app.sync(&item).await.expect("replayed sync");
    assert_eq!(replay.added, 0);
    assert_eq!(replay.modified, 0);
    assert_eq!(replay.unchanged, 2);
    assert_eq!(app.count("transactions").await, 2);

    // The second run resumed from the stored cursor.
    assert_eq!(
        app.aggregator.cursors_seen(),
        vec![None, Some("cursor-1".to_string())]
    );
}

#[tokio::test]
async fn stored_amounts_are_inflow_positive_and_merchant_is_cleaned() {
    let app = spawn_app().await;
    let item = app.seed_item("item-sign").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "250.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-coffee", "acc-1", "4.75", days_ago(1))],
        &[],
        "cursor-1",
        false,
    ));

    app.sync(&item).await.expect("sync");

    let stored = app
        .db
        .get_transaction_by_external_id("t-coffee")
        .await
        .unwrap()
        .expect("stored");
    assert_eq!(stored.amount, common::d("-4.75"));
    assert_eq!(stored.merchant_name.as_deref(), Some("Blue Bottle Coffee"));
    assert!(stored.category_id.is_some());
    assert!(!stored.is_internal_transfer);
}

#[tokio::test]
async fn removed_ids_are_deleted_once() {
    let app = spawn_app().await;
    let item = app.seed_item("item-remove").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "10.00", days_ago(5))],
        &[],
        "cursor-1",
        false,
    ));
    app.sync(&item).await.expect("seed sync");

    app.aggregator
        .push_page(page(Vec::new(), &["t-1"], "cursor-2", false));
    let first = app.sync(&item).await.expect("removal");
    assert_eq!(first.removed, 1);

    app.aggregator
        .push_page(page(Vec::new(), &["t-1", "t-never-seen"], "cursor-3", false));
    let second = app.sync(&item).await.expect("replayed removal");
    assert_eq!(second.removed, 0);
    assert_eq!(app.count("transactions").await, 0);
}

#[tokio::test]
async fn transient_failure_keeps_last_committed_cursor() {
    let app = spawn_app().await;
    let item = app.seed_item("item-transient").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);

    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "10.00", days_ago(4))],
        &[],
        "cursor-1",
        true,
    ));
    // One initial attempt plus two retries.
    for _ in 0..3 {
        app.aggregator.push_error(ProviderError::Timeout);
    }

    let err = app.sync(&item).await.unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)), "got {:?}", err);

    let cursor = app
        .db
        .get_cursor(item.item_id, Product::Transactions)
        .await
        .unwrap();
    assert_eq!(cursor.as_deref(), Some("cursor-1"));
    assert_eq!(app.count("transactions").await, 1);

    let stored = app.db.get_item(item.item_id).await.unwrap().unwrap();
    assert!(stored.is_active);
    assert!(stored.last_error.unwrap().starts_with("transient"));

    app.aggregator.push_page(page(
        vec![provider_txn("t-2", "acc-1", "20.00", days_ago(3))],
        &[],
        "cursor-2",
        false,
    ));
    let resumed = app.sync(&item).await.expect("resumed sync");
    assert_eq!(resumed.added, 1);
    assert_eq!(
        app.aggregator.cursors_seen().last().cloned().flatten().as_deref(),
        Some("cursor-1")
    );
}

#[tokio::test]
async fn malformed_page_is_not_applied() {
    let app = spawn_app().await;
    let item = app.seed_item("item-malformed").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "10.00", days_ago(1))],
        &[],
        "",
        false,
    ));

    let err = app.sync(&item).await.unwrap_err();
    assert!(matches!(err, SyncError::MalformedPage(_)), "got {:?}", err);
    assert_eq!(app.count("transactions").await, 0);
    assert!(app
        .db
        .get_cursor(item.item_id, Product::Transactions)
        .await
        .unwrap()
        .is_none());

    let stored = app.db.get_item(item.item_id).await.unwrap().unwrap();
    assert!(stored.is_active);
    assert!(stored.last_error.unwrap().starts_with("malformed_page"));
}

#[tokio::test]
async fn transaction_for_unknown_account_is_malformed() {
    let app = spawn_app().await;
    let item = app.seed_item("item-orphan").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-elsewhere", "10.00", days_ago(1))],
        &[],
        "cursor-1",
        false,
    ));

    let err = app.sync(&item).await.unwrap_err();
    assert!(matches!(err, SyncError::MalformedPage(_)), "got {:?}", err);
    assert_eq!(app.count("transactions").await, 0);
}

#[tokio::test]
async fn auth_failure_deactivates_item() {
    let app = spawn_app().await;
    let item = app.seed_item("item-auth").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_error(ProviderError::Auth {
        code: "ITEM_LOGIN_REQUIRED".to_string(),
    });

    let err = app.sync(&item).await.unwrap_err();
    assert!(matches!(err, SyncError::Auth { .. }), "got {:?}", err);
    // Auth failures are not retried.
    assert_eq!(app.aggregator.sync_calls(), 1);

    let stored = app.db.get_item(item.item_id).await.unwrap().unwrap();
    assert!(!stored.is_active);

    let err = app.sync(&item).await.unwrap_err();
    assert!(matches!(err, SyncError::ItemInactive(_)));
    assert_eq!(app.aggregator.sync_calls(), 1);
}

#[tokio::test]
async fn matching_legs_across_accounts_are_flagged_as_transfers() {
    let app = spawn_app().await;
    let item = app.seed_item("item-transfer").await;
    app.aggregator.set_accounts(vec![
        provider_account("checking", "depository", "1000.00"),
        provider_account("savings", "depository", "5000.00"),
    ]);
    app.aggregator.push_page(page(
        vec![
            provider_txn("t-out", "checking", "250.00", days_ago(3)),
            provider_txn("t-in", "savings", "-250.00", days_ago(2)),
            provider_txn("t-rent", "checking", "900.00", days_ago(2)),
        ],
        &[],
        "cursor-1",
        false,
    ));

    app.sync(&item).await.expect("sync");

    for id in ["t-out", "t-in"] {
        let txn = app
            .db
            .get_transaction_by_external_id(id)
            .await
            .unwrap()
            .unwrap();
        assert!(txn.is_internal_transfer, "{} should be a transfer", id);
    }
    let rent = app
        .db
        .get_transaction_by_external_id("t-rent")
        .await
        .unwrap()
        .unwrap();
    assert!(!rent.is_internal_transfer);

    let checking = app.account(&item, "checking").await;
    let ids: Vec<String> = app
        .db
        .list_account_transactions(checking.account_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.external_transaction_id)
        .collect();
    assert_eq!(ids, vec!["t-out", "t-rent"]);
}

#[tokio::test]
async fn pages_are_followed_until_exhausted() {
    let app = spawn_app().await;
    let item = app.seed_item("item-paged").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "1.00", days_ago(3))],
        &[],
        "cursor-1",
        true,
    ));
    app.aggregator.push_page(page(
        vec![provider_txn("t-2", "acc-1", "2.00", days_ago(2))],
        &[],
        "cursor-2",
        false,
    ));

    let outcome = app.sync(&item).await.expect("sync");
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.added, 2);
    assert_eq!(outcome.next_cursor.as_deref(), Some("cursor-2"));
    assert!(outcome.history_refreshed >= 1);
}

#[tokio::test]
async fn manual_sync_endpoint_reports_counts() {
    let app = spawn_app().await;
    let item = app.seed_item("item-manual").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    // First sync creates the account row.
    app.sync(&item).await.expect("bootstrap");
    let account = app.account(&item, "acc-1").await;

    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "10.00", days_ago(1))],
        &[],
        "cursor-1",
        false,
    ));

    let response = app
        .post(&format!("/accounts/{}/sync", account.account_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["updated"], true);
    assert_eq!(body["added"], 1);
    assert!(body.get("error").is_none());

    let foreign = app
        .client
        .post(format!("{}/accounts/{}/sync", app.address, account.account_id))
        .header(common::OWNER_HEADER, "someone-else")
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status().as_u16(), 404);

    let anonymous = app
        .client
        .post(format!("{}/accounts/{}/sync", app.address, account.account_id))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status().as_u16(), 401);
}

#[tokio::test]
async fn manual_sync_reports_aggregator_failure_in_body() {
    let app = spawn_app().await;
    let item = app.seed_item("item-manual-fail").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.sync(&item).await.expect("bootstrap");
    let account = app.account(&item, "acc-1").await;

    app.aggregator.push_error(ProviderError::Rejected {
        status: 400,
        code: "INVALID_FIELD".to_string(),
    });

    let response = app
        .post(&format!("/accounts/{}/sync", account.account_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["updated"], false);
    assert!(body["error"].as_str().unwrap().contains("INVALID_FIELD"));
}

#[tokio::test]
async fn category_hierarchy_is_built_from_provider_levels() {
    let app = spawn_app().await;
    let item = app.seed_item("item-category").await;
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_page(page(
        vec![
            provider_txn("t-1", "acc-1", "3.00", days_ago(2)),
            provider_txn("t-2", "acc-1", "4.00", days_ago(1)),
        ],
        &[],
        "cursor-1",
        false,
    ));
    app.sync(&item).await.expect("sync");

    // Both transactions share one leaf category.
    assert_eq!(app.count("categories").await, 2);

    let response = app
        .get("/categories/coffee-shop/path")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let path: Value = response.json().await.unwrap();
    assert_eq!(path[0]["slug"], "food-and-drink");
    assert_eq!(path[1]["slug"], "coffee-shop");
    assert_eq!(path[1]["display_name"], "Coffee Shop");

    let missing = app.get("/categories/nope/path").send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn batch_run_isolates_a_failing_item() {
    let app = spawn_app().await;
    let healthy = app.seed_item("item-healthy").await;
    let revoked = app.seed_item("item-revoked").await;
    app.aggregator.revoke("access-item-revoked");
    app.aggregator
        .set_accounts(vec![provider_account("acc-1", "depository", "100.00")]);
    app.aggregator.push_page(page(
        vec![provider_txn("t-1", "acc-1", "10.00", days_ago(2))],
        &[],
        "cursor-1",
        false,
    ));

    let client: Arc<dyn AggregatorClient> = app.aggregator.clone();
    let summary = app.sync.sync_all_items(client, "poll").await.unwrap();
    assert_eq!(
        summary,
        SyncSummary {
            succeeded: 1,
            failed: 1
        }
    );

    let cursor = app
        .db
        .get_cursor(healthy.item_id, Product::Transactions)
        .await
        .unwrap();
    assert_eq!(cursor.as_deref(), Some("cursor-1"));
    assert_eq!(app.count("transactions").await, 1);

    let healthy = app.db.get_item(healthy.item_id).await.unwrap().unwrap();
    assert!(healthy.last_error.is_none());
    assert!(healthy.last_refreshed_utc.is_some());

    let revoked = app.db.get_item(revoked.item_id).await.unwrap().unwrap();
    assert!(revoked.last_error.is_some());
    assert!(!revoked.is_active);
    assert!(app
        .db
        .get_cursor(revoked.item_id, Product::Transactions)
        .await
        .unwrap()
        .is_none());
}
