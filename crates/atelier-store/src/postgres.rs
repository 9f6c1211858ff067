//! `PostgreSQL` storage implementation.
//!
//! Balance changes are single conditional statements, so concurrent
//! requests against the same row are serialized by the database and no
//! application lock is needed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use atelier_core::{
    add_one_month, CreditAccount, CreditTransaction, DeductOutcome, SubscriptionUpdate, UserId,
    UserRecord,
};

use crate::error::{Result, StoreError};
use crate::{page_offset, PeriodAllocation, Store};

/// Maximum pooled connections.
const MAX_CONNECTIONS: u32 = 10;

const ACCOUNT_COLUMNS: &str = "user_id, plan_tier, plan_status, billing_period, total_credits, \
     used_credits, credits_expire_at, next_credit_reset_at, signup_bonus_given, \
     last_credits_allocated_at, external_subscription_id, external_customer_id, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, kind, available_after, description, metadata, created_at";

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1");
        sqlx::query(&sql)
            .bind(*user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| account_from_row(&row))
            .transpose()
    }
}

fn bind_account<'q>(
    query: Query<'q, Postgres, PgArguments>,
    account: &'q CreditAccount,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(*account.user_id.as_uuid())
        .bind(account.plan_tier.as_str())
        .bind(account.plan_status.as_str())
        .bind(account.billing_period.as_str())
        .bind(account.total_credits)
        .bind(account.used_credits)
        .bind(account.credits_expire_at)
        .bind(account.next_credit_reset_at)
        .bind(account.signup_bonus_given)
        .bind(account.last_credits_allocated_at)
        .bind(account.external_subscription_id.as_deref())
        .bind(account.external_customer_id.as_deref())
        .bind(account.created_at)
        .bind(account.updated_at)
}

fn account_from_row(row: &PgRow) -> Result<CreditAccount> {
    Ok(CreditAccount {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        plan_tier: row.try_get::<String, _>("plan_tier")?.parse()?,
        plan_status: row.try_get::<String, _>("plan_status")?.parse()?,
        billing_period: row.try_get::<String, _>("billing_period")?.parse()?,
        total_credits: row.try_get("total_credits")?,
        used_credits: row.try_get("used_credits")?,
        credits_expire_at: row.try_get("credits_expire_at")?,
        next_credit_reset_at: row.try_get("next_credit_reset_at")?,
        signup_bonus_given: row.try_get("signup_bonus_given")?,
        last_credits_allocated_at: row.try_get("last_credits_allocated_at")?,
        external_subscription_id: row.try_get("external_subscription_id")?,
        external_customer_id: row.try_get("external_customer_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<UserRecord> {
    Ok(UserRecord {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<CreditTransaction> {
    Ok(CreditTransaction {
        id: row
            .try_get::<String, _>("id")?
            .parse()
            .map_err(|e: atelier_core::IdError| StoreError::Serialization(e.to_string()))?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        amount: row.try_get("amount")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        available_after: row.try_get("available_after")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl Store for PgStore {
    async fn put_account(&self, account: &CreditAccount) -> Result<()> {
        let sql = format!(
            "INSERT INTO credit_accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 plan_tier = EXCLUDED.plan_tier, \
                 plan_status = EXCLUDED.plan_status, \
                 billing_period = EXCLUDED.billing_period, \
                 total_credits = EXCLUDED.total_credits, \
                 used_credits = EXCLUDED.used_credits, \
                 credits_expire_at = EXCLUDED.credits_expire_at, \
                 next_credit_reset_at = EXCLUDED.next_credit_reset_at, \
                 signup_bonus_given = EXCLUDED.signup_bonus_given, \
                 last_credits_allocated_at = EXCLUDED.last_credits_allocated_at, \
                 external_subscription_id = EXCLUDED.external_subscription_id, \
                 external_customer_id = EXCLUDED.external_customer_id, \
                 updated_at = EXCLUDED.updated_at"
        );
        bind_account(sqlx::query(&sql), account)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_account(&self, account: &CreditAccount) -> Result<bool> {
        let sql = format!(
            "INSERT INTO credit_accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (user_id) DO NOTHING"
        );
        let result = bind_account(sqlx::query(&sql), account)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.fetch_account(user_id).await
    }

    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome> {
        let applied = sqlx::query(
            "UPDATE credit_accounts \
             SET used_credits = used_credits + $2, updated_at = $3 \
             WHERE user_id = $1 \
               AND used_credits + $2 <= total_credits \
               AND NOT (credits_expire_at IS NOT NULL \
                        AND credits_expire_at < $3 \
                        AND plan_status <> 'active') \
             RETURNING total_credits - used_credits AS remaining",
        )
        .bind(*user_id.as_uuid())
        .bind(amount)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = applied {
            let remaining: i64 = row.try_get("remaining")?;
            return Ok(DeductOutcome::Applied {
                previous_remaining: remaining + amount,
                remaining,
            });
        }

        // Nothing was written; work out why for the caller.
        Ok(match self.fetch_account(user_id).await? {
            None => DeductOutcome::AccountNotFound,
            Some(account) if account.credits_void(now) => DeductOutcome::Expired,
            Some(account) => DeductOutcome::Insufficient {
                available: account.available_credits(),
            },
        })
    }

    async fn grant_signup_bonus(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        let period_end = add_one_month(now);
        let sql = format!(
            "UPDATE credit_accounts \
             SET total_credits = total_credits + $2, \
                 signup_bonus_given = TRUE, \
                 credits_expire_at = GREATEST(COALESCE(credits_expire_at, $3), $3), \
                 next_credit_reset_at = GREATEST(COALESCE(credits_expire_at, $3), $3), \
                 last_credits_allocated_at = $4, \
                 updated_at = $4 \
             WHERE user_id = $1 AND NOT signup_bonus_given \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let granted = sqlx::query(&sql)
            .bind(*user_id.as_uuid())
            .bind(amount)
            .bind(period_end)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match granted {
            Some(row) => account_from_row(&row).map(Some),
            None if self.fetch_account(user_id).await?.is_some() => Ok(None),
            None => Err(StoreError::account_not_found(user_id)),
        }
    }

    async fn apply_subscription(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
        allocation: Option<PeriodAllocation>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = match allocation {
            Some(allocation) => sqlx::query(
                "UPDATE credit_accounts \
                 SET plan_tier = $2, plan_status = $3, billing_period = $4, \
                     external_subscription_id = COALESCE($5, external_subscription_id), \
                     external_customer_id = COALESCE($6, external_customer_id), \
                     updated_at = $7, \
                     total_credits = $8, used_credits = 0, \
                     credits_expire_at = $9, next_credit_reset_at = $9, \
                     last_credits_allocated_at = $7 \
                 WHERE user_id = $1",
            )
            .bind(*user_id.as_uuid())
            .bind(update.plan_tier.as_str())
            .bind(update.plan_status.as_str())
            .bind(update.billing_period.as_str())
            .bind(update.external_subscription_id.as_deref())
            .bind(update.external_customer_id.as_deref())
            .bind(now)
            .bind(allocation.total_credits)
            .bind(allocation.period_end),
            None => sqlx::query(
                "UPDATE credit_accounts \
                 SET plan_tier = $2, plan_status = $3, billing_period = $4, \
                     external_subscription_id = COALESCE($5, external_subscription_id), \
                     external_customer_id = COALESCE($6, external_customer_id), \
                     updated_at = $7 \
                 WHERE user_id = $1",
            )
            .bind(*user_id.as_uuid())
            .bind(update.plan_tier.as_str())
            .bind(update.plan_status.as_str())
            .bind(update.billing_period.as_str())
            .bind(update.external_subscription_id.as_deref())
            .bind(update.external_customer_id.as_deref())
            .bind(now),
        };

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due_for_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditAccount>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts \
             WHERE plan_status = 'active' \
               AND next_credit_reset_at IS NOT NULL \
               AND next_credit_reset_at <= $1 \
             ORDER BY next_credit_reset_at"
        );
        sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(account_from_row)
            .collect()
    }

    async fn apply_reset(
        &self,
        user_id: &UserId,
        expected_reset_at: DateTime<Utc>,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let next_reset = add_one_month(expected_reset_at);
        let row = sqlx::query(
            "UPDATE credit_accounts \
             SET total_credits = $3 + GREATEST(total_credits - used_credits, 0), \
                 used_credits = 0, \
                 credits_expire_at = $4, \
                 next_credit_reset_at = $4, \
                 last_credits_allocated_at = $5, \
                 updated_at = $5 \
             WHERE user_id = $1 AND next_credit_reset_at = $2 \
             RETURNING total_credits",
        )
        .bind(*user_id.as_uuid())
        .bind(expected_reset_at)
        .bind(monthly_credits)
        .bind(next_reset)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.try_get::<i64, _>("total_credits"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn put_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, email, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id) DO UPDATE SET email = EXCLUDED.email",
        )
        .bind(*user.user_id.as_uuid())
        .bind(&user.email)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        sqlx::query("SELECT user_id, email, created_at FROM users WHERE user_id = $1")
            .bind(*user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn list_users(&self, page: usize, per_page: usize) -> Result<Vec<UserRecord>> {
        sqlx::query(
            "SELECT user_id, email, created_at FROM users \
             ORDER BY created_at, user_id LIMIT $1 OFFSET $2",
        )
        .bind(to_i64(per_page))
        .bind(to_i64(page_offset(page, per_page)))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(user_from_row)
        .collect()
    }

    async fn put_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        let sql = format!(
            "INSERT INTO credit_transactions ({TRANSACTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO NOTHING"
        );
        sqlx::query(&sql)
            .bind(transaction.id.to_string())
            .bind(*transaction.user_id.as_uuid())
            .bind(transaction.amount)
            .bind(transaction.kind.as_str())
            .bind(transaction.available_after)
            .bind(&transaction.description)
            .bind(&transaction.metadata)
            .bind(transaction.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        sqlx::query(&sql)
            .bind(*user_id.as_uuid())
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(transaction_from_row)
            .collect()
    }

    async fn claim_webhook_event(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        // Only an unfinished claim at least `stale_after` old is taken over.
        let result = sqlx::query(
            "INSERT INTO processed_webhook_events (event_key, claimed_at) VALUES ($1, $2) \
             ON CONFLICT (event_key) DO UPDATE SET claimed_at = EXCLUDED.claimed_at \
             WHERE processed_webhook_events.completed_at IS NULL \
               AND processed_webhook_events.claimed_at <= $3",
        )
        .bind(key)
        .bind(now)
        .bind(now - stale_after)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_webhook_event(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO processed_webhook_events (event_key, claimed_at, completed_at) \
             VALUES ($1, $2, $2) \
             ON CONFLICT (event_key) DO UPDATE SET completed_at = EXCLUDED.completed_at",
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_webhook_event(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! These run against a real database.
    //!
    //! Run with: `DATABASE_URL=postgres://... cargo test -p atelier-store -- --ignored`

    use super::*;
    use atelier_core::{PlanStatus, PlanTier};
    use std::sync::Arc;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn conditional_deduction_under_contention() {
        let store = Arc::new(store().await);
        let now = Utc::now();
        let mut account = CreditAccount::new(UserId::generate(), now);
        account.plan_tier = PlanTier::Basic;
        account.plan_status = PlanStatus::Active;
        account.total_credits = 10;
        account.credits_expire_at = Some(now + Duration::days(30));
        account.next_credit_reset_at = account.credits_expire_at;
        store.put_account(&account).await.unwrap();

        let user_id = account.user_id;
        let handles: Vec<_> = (0..25)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.try_deduct(&user_id, 1, Utc::now()).await })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), DeductOutcome::Applied { .. }) {
                applied += 1;
            }
        }

        assert_eq!(applied, 10);
        let stored = store.get_account(&user_id).await.unwrap().unwrap();
        assert_eq!(stored.used_credits, 10);
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn reset_rerun_is_noop() {
        let store = store().await;
        let now = Utc::now();
        let anchor = now - Duration::hours(1);
        let mut account = CreditAccount::new(UserId::generate(), now);
        account.plan_tier = PlanTier::Pro;
        account.plan_status = PlanStatus::Active;
        account.total_credits = 100;
        account.used_credits = 40;
        account.credits_expire_at = Some(anchor);
        account.next_credit_reset_at = Some(anchor);
        store.put_account(&account).await.unwrap();

        let first = store
            .apply_reset(&account.user_id, anchor, 360, now)
            .await
            .unwrap();
        let second = store
            .apply_reset(&account.user_id, anchor, 360, now)
            .await
            .unwrap();
        assert_eq!(first, Some(420));
        assert_eq!(second, None);
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn abandoned_webhook_claim_is_taken_over() {
        let store = store().await;
        let now = Utc::now();
        let stale = Duration::minutes(5);
        let key = format!("sub:{}:subscription_created:none", UserId::generate());

        assert!(store.claim_webhook_event(&key, now, stale).await.unwrap());
        assert!(!store
            .claim_webhook_event(&key, now + Duration::minutes(1), stale)
            .await
            .unwrap());
        let later = now + Duration::minutes(6);
        assert!(store.claim_webhook_event(&key, later, stale).await.unwrap());

        store.complete_webhook_event(&key, later).await.unwrap();
        assert!(!store
            .claim_webhook_event(&key, later + Duration::days(1), stale)
            .await
            .unwrap());
    }
}
