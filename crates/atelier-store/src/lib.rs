//! Credit ledger storage for atelier.
//!
//! This crate owns the per-user `CreditAccount` rows, the user directory,
//! credit history and webhook idempotency claims. Three backends implement
//! the same [`Store`] trait:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`; deductions and resets are single
//!   conditional `UPDATE ... RETURNING` statements.
//! - [`RocksStore`] (feature `rocksdb-backend`): `RocksDB` with column
//!   families and CBOR values; read-modify-write runs under a writer lock.
//! - [`MemoryStore`]: in-process maps for tests and local development.
//!
//! # Column families (`RocksDB`)
//!
//! - `accounts`: credit accounts, keyed by `user_id`
//! - `users`: user directory, keyed by `user_id`
//! - `transactions`: credit history, keyed by `transaction_id` (ULID)
//! - `transactions_by_user`: index for listing history by user
//! - `webhook_events`: webhook idempotency claims (`WebhookClaim`)
//!
//! # Example
//!
//! ```no_run
//! use atelier_core::{CreditAccount, UserId};
//! use atelier_store::{MemoryStore, Store};
//!
//! # async fn run() -> atelier_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//! store.put_account(&CreditAccount::new(user_id, chrono::Utc::now())).await?;
//! let account = store.get_account(&user_id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
pub mod postgres;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{
    CreditAccount, CreditTransaction, DeductOutcome, SubscriptionUpdate, UserId, UserRecord,
};

/// A new credit period to install alongside a subscription update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodAllocation {
    /// New period ceiling.
    pub total_credits: i64,
    /// End of the new period; also the next reset.
    pub period_end: DateTime<Utc>,
}

/// State of a webhook idempotency claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookClaim {
    /// When the current holder claimed the key.
    pub claimed_at: DateTime<Utc>,
    /// Set once the delivery was fully processed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookClaim {
    /// A fresh, in-progress claim.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            claimed_at: now,
            completed_at: None,
        }
    }

    /// Whether a new delivery may take this claim over.
    #[must_use]
    pub fn is_reclaimable(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.completed_at.is_none() && self.claimed_at <= now - stale_after
    }
}

/// The storage trait defining all ledger operations.
///
/// Every balance-changing method is a single atomic operation against one
/// row; callers never read-modify-write balances themselves.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Insert or replace an account record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_account(&self, account: &CreditAccount) -> Result<()>;

    /// Insert an account unless one already exists for the user.
    ///
    /// Returns `true` if the row was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn create_account(&self, account: &CreditAccount) -> Result<bool>;

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>>;

    /// Consume `amount` credits if `used + amount <= total` and the credits
    /// are not void.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails. Business failures
    /// (insufficient, expired, missing) are reported through `DeductOutcome`.
    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome>;

    /// Grant the one-time signup bonus.
    ///
    /// Returns the updated account, or `None` if the bonus was already given.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the account doesn't exist.
    async fn grant_signup_bonus(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>>;

    /// Overwrite subscription metadata, optionally starting a new credit period.
    ///
    /// Returns `false` when no row exists for the user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn apply_subscription(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
        allocation: Option<PeriodAllocation>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Active accounts whose next reset is at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_due_for_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditAccount>>;

    /// Run the monthly reset for one account if it is still anchored at
    /// `expected_reset_at`.
    ///
    /// Rollover is computed from the live row. Returns the new total, or
    /// `None` if the row moved on in the meantime.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn apply_reset(
        &self,
        user_id: &UserId,
        expected_reset_at: DateTime<Utc>,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    // =========================================================================
    // User Directory
    // =========================================================================

    /// Insert or replace a user record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_user(&self, user: &UserRecord) -> Result<()>;

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>>;

    /// One page of the directory, ordered by signup time. Pages start at 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_users(&self, page: usize, per_page: usize) -> Result<Vec<UserRecord>>;

    // =========================================================================
    // Credit History
    // =========================================================================

    /// Append a history entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_transaction(&self, transaction: &CreditTransaction) -> Result<()>;

    /// List history for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Webhook Idempotency
    // =========================================================================

    /// Claim a webhook idempotency key. Returns `false` if it is already
    /// done, or still being processed by a claim newer than `stale_after`.
    ///
    /// A claim that was never completed or released (the handler died
    /// mid-allocation) is taken over once it is `stale_after` old.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn claim_webhook_event(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool>;

    /// Mark a claimed key done. A done key is never claimed again.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn complete_webhook_event(&self, key: &str, now: DateTime<Utc>) -> Result<()>;

    /// Release a claim so a retried delivery can be processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn release_webhook_event(&self, key: &str) -> Result<()>;
}

/// Offset of the first record on a 1-based page.
#[must_use]
pub(crate) fn page_offset(page: usize, per_page: usize) -> usize {
    page.saturating_sub(1).saturating_mul(per_page)
}

/// Apply a subscription update (and optional new period) to a row in memory.
pub(crate) fn apply_subscription_to(
    account: &mut CreditAccount,
    update: &SubscriptionUpdate,
    allocation: Option<PeriodAllocation>,
    now: DateTime<Utc>,
) {
    account.apply_subscription(update, now);
    if let Some(allocation) = allocation {
        account.apply_allocation(allocation.total_credits, allocation.period_end, now);
    }
}

/// Candidate filter for the monthly reset: active with a reset at or before `cutoff`.
pub(crate) fn is_due(account: &CreditAccount, cutoff: DateTime<Utc>) -> bool {
    account.plan_status == atelier_core::PlanStatus::Active
        && account
            .next_credit_reset_at
            .is_some_and(|reset_at| reset_at <= cutoff)
}
