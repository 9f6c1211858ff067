//! Monthly reset job integration tests.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use atelier_core::{PlanStatus, PlanTier, TransactionKind, UserId};
use atelier_service::{run_monthly_reset, Notification, ServiceConfig};
use atelier_store::Store;
use common::{header, test_config, value, FaultyStore, TestHarness};

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

#[tokio::test]
async fn reset_rolls_over_and_moves_anchor() {
    let harness = TestHarness::new();
    let reset_at = at(2025, 6, 15, 14, 30);
    let user_id = harness
        .seed_paid_account("monthly@example.com", PlanTier::Pro, 100, 40, reset_at, true)
        .await;

    // Due later the same UTC day still counts.
    let now = at(2025, 6, 15, 9, 0);
    let summary = run_monthly_reset(&harness.state, now).await.unwrap();
    assert_eq!(summary.total_candidates, 1);
    assert_eq!(summary.reset_count, 1);
    assert!(summary.errors.is_empty());

    let account = harness.account(user_id).await;
    assert_eq!(account.total_credits, 420);
    assert_eq!(account.used_credits, 0);
    assert_eq!(account.next_credit_reset_at, Some(at(2025, 7, 15, 14, 30)));
    assert_eq!(account.credits_expire_at, account.next_credit_reset_at);
    assert_eq!(account.last_credits_allocated_at, Some(now));

    let history = harness
        .store
        .list_transactions_by_user(&user_id, 10, 0)
        .await
        .unwrap();
    assert_eq!(history[0].kind, TransactionKind::MonthlyReset);
    assert_eq!(history[0].amount, 420);
}

#[tokio::test]
async fn rerun_on_the_same_day_is_a_no_op() {
    let harness = TestHarness::new();
    let user_id = harness
        .seed_paid_account("twice@example.com", PlanTier::Basic, 175, 175, at(2025, 6, 1, 0, 0), true)
        .await;

    let now = at(2025, 6, 1, 12, 0);
    let first = run_monthly_reset(&harness.state, now).await.unwrap();
    assert_eq!(first.reset_count, 1);
    assert_eq!(harness.account(user_id).await.total_credits, 175);

    let second = run_monthly_reset(&harness.state, now).await.unwrap();
    assert_eq!(second.total_candidates, 0);
    assert_eq!(second.reset_count, 0);
    assert_eq!(harness.account(user_id).await.total_credits, 175);
}

#[tokio::test]
async fn month_end_anchor_clamps() {
    let harness = TestHarness::new();
    let user_id = harness
        .seed_paid_account("clamp@example.com", PlanTier::Agency, 550, 550, at(2025, 1, 31, 10, 0), true)
        .await;

    run_monthly_reset(&harness.state, at(2025, 1, 31, 10, 0))
        .await
        .unwrap();

    let account = harness.account(user_id).await;
    assert_eq!(account.total_credits, 550);
    assert_eq!(account.next_credit_reset_at, Some(at(2025, 2, 28, 10, 0)));
}

#[tokio::test]
async fn late_run_keeps_original_anchor() {
    let harness = TestHarness::new();
    let user_id = harness
        .seed_paid_account("late@example.com", PlanTier::Pro, 360, 300, at(2025, 3, 5, 8, 0), true)
        .await;

    run_monthly_reset(&harness.state, at(2025, 3, 8, 2, 0))
        .await
        .unwrap();

    let account = harness.account(user_id).await;
    assert_eq!(account.total_credits, 420);
    assert_eq!(account.next_credit_reset_at, Some(at(2025, 4, 5, 8, 0)));
}

#[tokio::test]
async fn accounts_not_yet_due_or_inactive_are_left_alone() {
    let harness = TestHarness::new();
    let now = at(2025, 6, 15, 9, 0);

    let tomorrow = harness
        .seed_paid_account("soon@example.com", PlanTier::Pro, 360, 10, at(2025, 6, 16, 0, 0), true)
        .await;
    let canceled = harness
        .seed_paid_account("gone@example.com", PlanTier::Pro, 360, 10, at(2025, 6, 10, 0, 0), true)
        .await;
    let mut account = harness.account(canceled).await;
    account.plan_status = PlanStatus::Canceled;
    harness.store.put_account(&account).await.unwrap();

    let summary = run_monthly_reset(&harness.state, now).await.unwrap();
    assert_eq!(summary.total_candidates, 0);
    assert_eq!(harness.account(tomorrow).await.used_credits, 10);
    assert_eq!(harness.account(canceled).await.used_credits, 10);
}

#[tokio::test]
async fn free_tier_is_skipped() {
    let harness = TestHarness::new();
    let user_id = harness
        .seed_paid_account("free@example.com", PlanTier::Free, 10, 4, at(2025, 6, 1, 0, 0), true)
        .await;

    let summary = run_monthly_reset(&harness.state, at(2025, 6, 2, 0, 0))
        .await
        .unwrap();
    assert_eq!(summary.total_candidates, 1);
    assert_eq!(summary.reset_count, 0);
    assert!(summary.errors.is_empty());

    let account = harness.account(user_id).await;
    assert_eq!(account.total_credits, 10);
    assert_eq!(account.used_credits, 4);
}

#[tokio::test]
async fn reset_notifies_the_user() {
    let harness = TestHarness::new();
    harness
        .seed_paid_account("notify@example.com", PlanTier::Basic, 175, 100, at(2025, 6, 1, 6, 0), true)
        .await;

    run_monthly_reset(&harness.state, at(2025, 6, 1, 7, 0))
        .await
        .unwrap();

    let sent = harness.notifier.wait_for(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "notify@example.com");
    assert_eq!(
        sent[0].1,
        Notification::MonthlyReset {
            plan_tier: PlanTier::Basic,
            total_credits: 250,
            next_reset_at: at(2025, 7, 1, 6, 0),
        }
    );
}

/// Three due Pro accounts; resets for the middle one fail.
async fn partly_failing_ledger() -> (TestHarness, Vec<UserId>, UserId) {
    let store = Arc::new(FaultyStore::default());
    let harness = TestHarness::with_store(store.clone());
    let due = Utc::now() - Duration::days(1);

    let mut healthy = Vec::new();
    for email in ["one@example.com", "three@example.com"] {
        healthy.push(
            harness
                .seed_paid_account(email, PlanTier::Pro, 360, 100, due, true)
                .await,
        );
    }
    let broken = harness
        .seed_paid_account("two@example.com", PlanTier::Pro, 360, 100, due, true)
        .await;
    store.fail_resets_for(broken).await;

    (harness, healthy, broken)
}

#[tokio::test]
async fn one_failing_account_does_not_stop_the_run() {
    let (harness, healthy, broken) = partly_failing_ledger().await;

    let summary = run_monthly_reset(&harness.state, Utc::now()).await.unwrap();
    assert_eq!(summary.total_candidates, 3);
    assert_eq!(summary.reset_count, 2);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with(&broken.to_string()));

    for user_id in healthy {
        let account = harness.account(user_id).await;
        assert_eq!(account.used_credits, 0);
        assert_eq!(account.total_credits, 620);
    }
    let untouched = harness.account(broken).await;
    assert_eq!(untouched.used_credits, 100);
    assert_eq!(untouched.total_credits, 360);
}

// ============================================================================
// HTTP trigger
// ============================================================================

fn with_reset_secret() -> ServiceConfig {
    ServiceConfig {
        reset_secret: Some("cron-secret".into()),
        ..test_config()
    }
}

#[tokio::test]
async fn endpoint_requires_reset_secret_when_configured() {
    let harness = TestHarness::with_config(with_reset_secret());

    harness
        .server
        .post("/jobs/reset-credits")
        .await
        .assert_status_unauthorized();

    harness
        .server
        .post("/jobs/reset-credits")
        .add_header(header("x-reset-secret"), value("wrong"))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn endpoint_runs_the_reset() {
    let harness = TestHarness::with_config(with_reset_secret());
    let user_id = harness
        .seed_paid_account("cron@example.com", PlanTier::Pro, 360, 360, Utc::now() - Duration::days(1), true)
        .await;

    let response = harness
        .server
        .post("/jobs/reset-credits")
        .add_header(header("x-reset-secret"), value("cron-secret"))
        .await;
    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["reset"], 1);
    assert_eq!(json["total"], 1);
    assert_eq!(json["message"], "Reset credits for 1 of 1 accounts");
    assert!(json.get("errors").is_none());

    let account = harness.account(user_id).await;
    assert_eq!(account.total_credits, 360);
    assert_eq!(account.used_credits, 0);
}

#[tokio::test]
async fn endpoint_is_open_without_reset_secret() {
    let harness = TestHarness::new();

    let json: Value = harness.server.post("/jobs/reset-credits").await.json();
    assert_eq!(json["reset"], 0);
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn endpoint_reports_per_account_errors() {
    let (harness, _, broken) = partly_failing_ledger().await;

    let response = harness.server.post("/jobs/reset-credits").await;
    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["reset"], 2);
    assert_eq!(json["total"], 3);
    let errors = json["errors"].as_array().expect("errors should be an array");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].as_str().unwrap().contains(&broken.to_string()));
}
