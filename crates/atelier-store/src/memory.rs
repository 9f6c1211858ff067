//! In-memory storage implementation.
//!
//! All state lives behind one async mutex, so every operation is trivially
//! atomic. Used by the service test-suite and for local runs without a
//! database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use atelier_core::{
    CreditAccount, CreditTransaction, DeductOutcome, SubscriptionUpdate, UserId, UserRecord,
};

use crate::error::{Result, StoreError};
use crate::{apply_subscription_to, is_due, page_offset, PeriodAllocation, Store, WebhookClaim};

#[derive(Default)]
struct Inner {
    accounts: HashMap<UserId, CreditAccount>,
    users: HashMap<UserId, UserRecord>,
    transactions: HashMap<UserId, Vec<CreditTransaction>>,
    webhook_events: HashMap<String, WebhookClaim>,
}

/// Memory-backed storage implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_account(&self, account: &CreditAccount) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.accounts.insert(account.user_id, account.clone());
        Ok(())
    }

    async fn create_account(&self, account: &CreditAccount) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.accounts.contains_key(&account.user_id) {
            return Ok(false);
        }
        inner.accounts.insert(account.user_id, account.clone());
        Ok(true)
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(user_id).cloned())
    }

    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .accounts
            .get_mut(user_id)
            .map_or(DeductOutcome::AccountNotFound, |account| {
                account.try_deduct(amount, now)
            }))
    }

    async fn grant_signup_bonus(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StoreError::account_not_found(user_id))?;

        Ok(account
            .grant_signup_bonus(amount, now)
            .then(|| account.clone()))
    }

    async fn apply_subscription(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
        allocation: Option<PeriodAllocation>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.get_mut(user_id) else {
            return Ok(false);
        };
        apply_subscription_to(account, update, allocation, now);
        Ok(true)
    }

    async fn list_due_for_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditAccount>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<CreditAccount> = inner
            .accounts
            .values()
            .filter(|account| is_due(account, cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|account| account.next_credit_reset_at);
        Ok(due)
    }

    async fn apply_reset(
        &self,
        user_id: &UserId,
        expected_reset_at: DateTime<Utc>,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.accounts.get_mut(user_id).and_then(|account| {
            account.apply_monthly_reset(expected_reset_at, monthly_credits, now)
        }))
    }

    async fn put_user(&self, user: &UserRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(user_id).cloned())
    }

    async fn list_users(&self, page: usize, per_page: usize) -> Result<Vec<UserRecord>> {
        let inner = self.inner.lock().await;
        let mut users: Vec<UserRecord> = inner.users.values().cloned().collect();
        users.sort_by_key(|user| (user.created_at, user.user_id));
        Ok(users
            .into_iter()
            .skip(page_offset(page, per_page))
            .take(per_page)
            .collect())
    }

    async fn put_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .transactions
            .entry(transaction.user_id)
            .or_default()
            .push(transaction.clone());
        Ok(())
    }

    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn claim_webhook_event(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if let Some(claim) = inner.webhook_events.get(key) {
            if !claim.is_reclaimable(now, stale_after) {
                return Ok(false);
            }
        }
        inner
            .webhook_events
            .insert(key.to_string(), WebhookClaim::new(now));
        Ok(true)
    }

    async fn complete_webhook_event(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .webhook_events
            .entry(key.to_string())
            .or_insert_with(|| WebhookClaim::new(now))
            .completed_at = Some(now);
        Ok(())
    }

    async fn release_webhook_event(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.webhook_events.remove(key);
        Ok(())
    }
}
