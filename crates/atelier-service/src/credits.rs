//! Credit queries and deductions.
//!
//! Feature code calls [`CreditService::deduct_credits`] around every AI
//! generation. The balance check and the write are one store operation, so
//! concurrent requests for the same user can never spend past the ceiling.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use atelier_core::{
    CreditAccount, CreditInfo, CreditTransaction, DeductOutcome, UserId, LOW_CREDITS_THRESHOLD,
    SIGNUP_BONUS_CREDITS,
};
use atelier_store::{Result, Store};

use crate::notifier::{spawn_notification, Notification, Notifier};

/// Outcome of a deduction as reported to feature code.
///
/// Running out of credits is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionResult {
    /// Whether credits were consumed.
    pub success: bool,
    /// Credits left after the call; 0 on failure.
    pub remaining_credits: i64,
    /// Why the deduction was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeductionResult {
    fn applied(remaining_credits: i64) -> Self {
        Self {
            success: true,
            remaining_credits,
            error: None,
        }
    }

    fn refused(error: String) -> Self {
        Self {
            success: false,
            remaining_credits: 0,
            error: Some(error),
        }
    }
}

/// Credit operations on top of the ledger store.
#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl CreditService {
    /// Create a new service.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Credit numbers for a user, or `None` when no ledger row exists.
    pub async fn get_credit_info(&self, user_id: &UserId) -> Result<Option<CreditInfo>> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .map(|account| account.info()))
    }

    /// Whether the user could spend `required` credits right now.
    pub async fn has_enough_credits(&self, user_id: &UserId, required: i64) -> Result<bool> {
        let Some(account) = self.store.get_account(user_id).await? else {
            return Ok(false);
        };

        Ok(account.spendable_credits(Utc::now()) >= required)
    }

    /// Spend `amount` credits on `feature`.
    ///
    /// Store failures are returned as errors; every business refusal comes
    /// back as an unsuccessful [`DeductionResult`] with nothing written.
    pub async fn deduct_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        feature: Option<&str>,
    ) -> Result<DeductionResult> {
        if amount <= 0 {
            return Ok(DeductionResult::refused(format!(
                "Invalid amount: {amount} (must be positive)"
            )));
        }

        let now = Utc::now();
        let outcome = self.store.try_deduct(user_id, amount, now).await?;

        let (previous_remaining, remaining) = match outcome {
            DeductOutcome::Applied {
                previous_remaining,
                remaining,
            } => (previous_remaining, remaining),
            DeductOutcome::Insufficient { available } => {
                tracing::debug!(
                    user_id = %user_id,
                    available = available,
                    required = amount,
                    "Deduction refused: insufficient credits"
                );
                return Ok(DeductionResult::refused(format!(
                    "Insufficient credits: {available} available, {amount} required"
                )));
            }
            DeductOutcome::Expired => {
                tracing::debug!(user_id = %user_id, "Deduction refused: credits expired");
                return Ok(DeductionResult::refused(
                    "Credits expired: renew your plan to continue".to_string(),
                ));
            }
            DeductOutcome::AccountNotFound => {
                return Ok(DeductionResult::refused(
                    "No credit account found for user".to_string(),
                ));
            }
        };

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            remaining = remaining,
            feature = feature.unwrap_or("unspecified"),
            "Credits deducted"
        );

        record_history(
            self.store.as_ref(),
            CreditTransaction::usage(*user_id, amount, remaining, feature, now),
        )
        .await;

        if crossed_low_threshold(previous_remaining, remaining) {
            spawn_notification(
                self.store.clone(),
                self.notifier.clone(),
                *user_id,
                Notification::LowCredits {
                    remaining_credits: remaining,
                },
            );
        }

        Ok(DeductionResult::applied(remaining))
    }

    /// Grant the one-time signup bonus.
    ///
    /// Returns the updated account, or `None` if the bonus was already given.
    pub async fn grant_signup_bonus(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        let now = Utc::now();
        let Some(account) = self
            .store
            .grant_signup_bonus(user_id, SIGNUP_BONUS_CREDITS, now)
            .await?
        else {
            return Ok(None);
        };

        tracing::info!(
            user_id = %user_id,
            amount = SIGNUP_BONUS_CREDITS,
            "Signup bonus granted"
        );

        record_history(
            self.store.as_ref(),
            CreditTransaction::signup_bonus(
                *user_id,
                SIGNUP_BONUS_CREDITS,
                account.available_credits(),
                now,
            ),
        )
        .await;

        Ok(Some(account))
    }

    /// Credit history for a user, newest first.
    pub async fn history(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        self.store
            .list_transactions_by_user(user_id, limit, offset)
            .await
    }
}

/// True exactly when a deduction moves the balance from at or above the
/// low-credit threshold to below it.
#[must_use]
pub fn crossed_low_threshold(previous_remaining: i64, remaining: i64) -> bool {
    previous_remaining >= LOW_CREDITS_THRESHOLD && remaining < LOW_CREDITS_THRESHOLD
}

/// Append a history entry. The ledger row is already committed, so a
/// failure here is only logged.
pub(crate) async fn record_history(store: &dyn Store, entry: CreditTransaction) {
    if let Err(e) = store.put_transaction(&entry).await {
        tracing::warn!(
            user_id = %entry.user_id,
            kind = entry.kind.as_str(),
            error = %e,
            "Failed to record credit history"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;
    use atelier_core::{PlanStatus, PlanTier, TransactionKind};
    use atelier_store::MemoryStore;
    use chrono::Duration;

    async fn service_with(account: CreditAccount) -> (CreditService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put_account(&account).await.unwrap();
        let service = CreditService::new(store.clone(), Arc::new(LogNotifier));
        (service, store)
    }

    fn account(total: i64, used: i64) -> CreditAccount {
        let now = Utc::now();
        let mut account = CreditAccount::new(UserId::generate(), now);
        account.plan_tier = PlanTier::Pro;
        account.plan_status = PlanStatus::Active;
        account.total_credits = total;
        account.used_credits = used;
        account.credits_expire_at = Some(now + Duration::days(10));
        account.next_credit_reset_at = account.credits_expire_at;
        account
    }

    #[test]
    fn low_threshold_crossing() {
        assert!(crossed_low_threshold(20, 19));
        assert!(crossed_low_threshold(25, 0));
        assert!(!crossed_low_threshold(19, 18));
        assert!(!crossed_low_threshold(30, 20));
    }

    #[tokio::test]
    async fn deduct_reports_remaining_and_records_usage() {
        let account = account(100, 40);
        let user_id = account.user_id;
        let (service, store) = service_with(account).await;

        let result = service
            .deduct_credits(&user_id, 5, Some("redress"))
            .await
            .unwrap();
        assert_eq!(result, DeductionResult::applied(55));

        let history = store.list_transactions_by_user(&user_id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::Usage);
        assert_eq!(history[0].amount, -5);
    }

    #[tokio::test]
    async fn insufficient_leaves_usage_unchanged() {
        let account = account(10, 7);
        let user_id = account.user_id;
        let (service, store) = service_with(account).await;

        let result = service.deduct_credits(&user_id, 5, None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.remaining_credits, 0);
        assert!(result.error.unwrap().starts_with("Insufficient credits"));

        let stored = store.get_account(&user_id).await.unwrap().unwrap();
        assert_eq!(stored.used_credits, 7);
    }

    #[tokio::test]
    async fn expired_inactive_credits_are_refused() {
        let mut account = account(50, 0);
        account.plan_status = PlanStatus::Canceled;
        account.credits_expire_at = Some(Utc::now() - Duration::days(1));
        let user_id = account.user_id;
        let (service, _store) = service_with(account).await;

        let result = service.deduct_credits(&user_id, 1, None).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Credits expired"));
        assert!(!service.has_enough_credits(&user_id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn expired_but_active_credits_are_spendable() {
        let mut account = account(50, 0);
        account.credits_expire_at = Some(Utc::now() - Duration::hours(1));
        let user_id = account.user_id;
        let (service, _store) = service_with(account).await;

        assert!(service.has_enough_credits(&user_id, 50).await.unwrap());
        assert!(service.deduct_credits(&user_id, 50, None).await.unwrap().success);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_refused() {
        let account = account(50, 0);
        let user_id = account.user_id;
        let (service, store) = service_with(account).await;

        for amount in [0, -3] {
            let result = service.deduct_credits(&user_id, amount, None).await.unwrap();
            assert!(!result.success);
        }
        assert_eq!(store.get_account(&user_id).await.unwrap().unwrap().used_credits, 0);
    }

    #[tokio::test]
    async fn missing_account() {
        let store = Arc::new(MemoryStore::new());
        let service = CreditService::new(store, Arc::new(LogNotifier));
        let user_id = UserId::generate();

        assert!(service.get_credit_info(&user_id).await.unwrap().is_none());
        assert!(!service.has_enough_credits(&user_id, 1).await.unwrap());
        let result = service.deduct_credits(&user_id, 1, None).await.unwrap();
        assert!(result.error.unwrap().starts_with("No credit account"));
    }

    #[tokio::test]
    async fn signup_bonus_is_granted_once() {
        let store = Arc::new(MemoryStore::new());
        let user_id = UserId::generate();
        store
            .put_account(&CreditAccount::new(user_id, Utc::now()))
            .await
            .unwrap();
        let service = CreditService::new(store.clone(), Arc::new(LogNotifier));

        let granted = service.grant_signup_bonus(&user_id).await.unwrap().unwrap();
        assert_eq!(granted.available_credits(), SIGNUP_BONUS_CREDITS);
        assert!(service.grant_signup_bonus(&user_id).await.unwrap().is_none());

        let history = service.history(&user_id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::SignupBonus);
    }
}
