//! Monthly credit reset job.
//!
//! Paid plans get their monthly allowance every calendar month, billed
//! monthly or annually. Once a day the job picks every active account whose
//! next reset falls on or before the end of the current UTC day, rolls the
//! unused balance into a fresh period and moves the reset anchor forward by
//! one month from where it was.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;

use atelier_core::{add_one_month, end_of_day, CreditAccount, CreditTransaction};
use atelier_store::StoreError;

use crate::credits::record_history;
use crate::notifier::{spawn_notification, Notification};
use crate::state::AppState;

/// Fallback delay between scheduler runs if the next midnight can't be computed.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of one reset run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    /// Accounts that received a new period.
    pub reset_count: usize,
    /// Accounts that were due.
    pub total_candidates: usize,
    /// Per-account failures, as `"{user_id}: {error}"`.
    pub errors: Vec<String>,
}

enum AccountReset {
    Reset,
    Skipped,
    Failed(String),
}

/// Run the monthly reset for every due account.
///
/// One account failing never stops the others; failures are collected into
/// the summary.
pub async fn run_monthly_reset(
    state: &AppState,
    now: DateTime<Utc>,
) -> Result<ResetSummary, StoreError> {
    let cutoff = end_of_day(now);
    let candidates = state.store.list_due_for_reset(cutoff).await?;
    let total_candidates = candidates.len();

    tracing::info!(
        candidates = total_candidates,
        cutoff = %cutoff,
        "Starting monthly credit reset"
    );

    let results: Vec<AccountReset> = stream::iter(candidates)
        .map(|account| reset_account(state, account, now))
        .buffer_unordered(state.config.reset_concurrency.max(1))
        .collect()
        .await;

    let mut summary = ResetSummary {
        total_candidates,
        ..ResetSummary::default()
    };
    for result in results {
        match result {
            AccountReset::Reset => summary.reset_count += 1,
            AccountReset::Skipped => {}
            AccountReset::Failed(error) => summary.errors.push(error),
        }
    }

    tracing::info!(
        reset = summary.reset_count,
        candidates = summary.total_candidates,
        errors = summary.errors.len(),
        "Monthly credit reset finished"
    );

    Ok(summary)
}

async fn reset_account(state: &AppState, account: CreditAccount, now: DateTime<Utc>) -> AccountReset {
    let user_id = account.user_id;

    let Some(monthly_credits) = account.plan_tier.monthly_credits() else {
        tracing::warn!(
            user_id = %user_id,
            plan_tier = %account.plan_tier,
            "Skipping reset for plan without a monthly allowance"
        );
        return AccountReset::Skipped;
    };
    let Some(expected_reset_at) = account.next_credit_reset_at else {
        return AccountReset::Skipped;
    };

    let new_total = match state
        .store
        .apply_reset(&user_id, expected_reset_at, monthly_credits, now)
        .await
    {
        Ok(Some(total)) => total,
        Ok(None) => {
            tracing::debug!(user_id = %user_id, "Account changed since it was listed, skipping reset");
            return AccountReset::Skipped;
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Monthly reset failed");
            return AccountReset::Failed(format!("{user_id}: {e}"));
        }
    };

    let next_reset_at = add_one_month(expected_reset_at);
    tracing::info!(
        user_id = %user_id,
        plan_tier = %account.plan_tier,
        total_credits = new_total,
        next_reset_at = %next_reset_at,
        "Monthly credits reset"
    );

    record_history(
        state.store.as_ref(),
        CreditTransaction::monthly_reset(user_id, account.plan_tier, new_total, now),
    )
    .await;

    spawn_notification(
        state.store.clone(),
        state.notifier.clone(),
        user_id,
        Notification::MonthlyReset {
            plan_tier: account.plan_tier,
            total_credits: new_total,
            next_reset_at,
        },
    );

    AccountReset::Reset
}

/// Run the reset at start-up and then after every UTC midnight.
pub fn spawn_reset_scheduler(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_monthly_reset(&state, Utc::now()).await {
                tracing::error!(error = %e, "Scheduled monthly reset failed");
            }

            let delay = until_next_midnight(Utc::now());
            tracing::debug!(delay_secs = delay.as_secs(), "Next monthly reset scheduled");
            tokio::time::sleep(delay).await;
        }
    })
}

/// Time from `now` to the next UTC midnight.
fn until_next_midnight(now: DateTime<Utc>) -> Duration {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or(FALLBACK_INTERVAL)
}
