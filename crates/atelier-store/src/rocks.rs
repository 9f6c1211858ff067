//! `RocksDB` storage implementation.
//!
//! `RocksDB` has no conditional update, so every read-modify-write of an
//! account (and every idempotency claim) runs under `write_lock`. Plain
//! puts and reads go straight to the database.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tokio::sync::Mutex;

use atelier_core::{
    CreditAccount, CreditTransaction, DeductOutcome, SubscriptionUpdate, TransactionId, UserId,
    UserRecord,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{apply_subscription_to, is_due, page_offset, PeriodAllocation, Store, WebhookClaim};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write<T: serde::Serialize>(&self, family: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(family)?;
        let value = Self::serialize(value)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Decode every value in a column family.
    fn scan<T: serde::de::DeserializeOwned>(&self, family: &str) -> Result<Vec<T>> {
        let cf = self.cf(family)?;
        self.db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                Self::deserialize(&value)
            })
            .collect()
    }

    fn read_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.read(cf::ACCOUNTS, &keys::user_key(user_id))
    }

    fn write_account(&self, account: &CreditAccount) -> Result<()> {
        self.write(cf::ACCOUNTS, &keys::user_key(&account.user_id), account)
    }

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>> {
        self.read(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn put_account(&self, account: &CreditAccount) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_account(account)
    }

    async fn create_account(&self, account: &CreditAccount) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.read_account(&account.user_id)?.is_some() {
            return Ok(false);
        }
        self.write_account(account)?;
        Ok(true)
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.read_account(user_id)
    }

    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome> {
        let _guard = self.write_lock.lock().await;
        let Some(mut account) = self.read_account(user_id)? else {
            return Ok(DeductOutcome::AccountNotFound);
        };

        let outcome = account.try_deduct(amount, now);
        if matches!(outcome, DeductOutcome::Applied { .. }) {
            self.write_account(&account)?;
        }
        Ok(outcome)
    }

    async fn grant_signup_bonus(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        let _guard = self.write_lock.lock().await;
        let mut account = self
            .read_account(user_id)?
            .ok_or_else(|| StoreError::account_not_found(user_id))?;

        if !account.grant_signup_bonus(amount, now) {
            return Ok(None);
        }
        self.write_account(&account)?;
        Ok(Some(account))
    }

    async fn apply_subscription(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
        allocation: Option<PeriodAllocation>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut account) = self.read_account(user_id)? else {
            return Ok(false);
        };

        apply_subscription_to(&mut account, update, allocation, now);
        self.write_account(&account)?;
        Ok(true)
    }

    async fn list_due_for_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditAccount>> {
        let mut due: Vec<CreditAccount> = self
            .scan::<CreditAccount>(cf::ACCOUNTS)?
            .into_iter()
            .filter(|account| is_due(account, cutoff))
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
        let _guard = self.write_lock.lock().await;
        let Some(mut account) = self.read_account(user_id)? else {
            return Ok(None);
        };

        let new_total = account.apply_monthly_reset(expected_reset_at, monthly_credits, now);
        if new_total.is_some() {
            self.write_account(&account)?;
        }
        Ok(new_total)
    }

    // =========================================================================
    // User Directory
    // =========================================================================

    async fn put_user(&self, user: &UserRecord) -> Result<()> {
        self.write(cf::USERS, &keys::user_key(&user.user_id), user)
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        self.read(cf::USERS, &keys::user_key(user_id))
    }

    async fn list_users(&self, page: usize, per_page: usize) -> Result<Vec<UserRecord>> {
        let mut users: Vec<UserRecord> = self.scan(cf::USERS)?;
        users.sort_by_key(|user| (user.created_at, user.user_id));
        Ok(users
            .into_iter()
            .skip(page_offset(page, per_page))
            .take(per_page)
            .collect())
    }

    // =========================================================================
    // Credit History
    // =========================================================================

    async fn put_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;

        let tx_key = keys::transaction_key(&transaction.id);
        let user_tx_key = keys::user_transaction_key(&transaction.user_id, &transaction.id);
        let value = Self::serialize(transaction)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_tx, &tx_key, &value);
        batch.put_cf(&cf_by_user, &user_tx_key, []);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let prefix = keys::user_transactions_prefix(user_id);

        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(id) = keys::transaction_id_from_user_key(&key) {
                ids.push(id);
            }
        }

        let mut transactions = Vec::new();
        for id in ids.iter().rev().skip(offset).take(limit) {
            if let Some(tx) = self.get_transaction(id)? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    // =========================================================================
    // Webhook Idempotency
    // =========================================================================

    async fn claim_webhook_event(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = keys::webhook_event_key(key);
        if let Some(claim) = self.read::<WebhookClaim>(cf::WEBHOOK_EVENTS, &key)? {
            if !claim.is_reclaimable(now, stale_after) {
                return Ok(false);
            }
        }
        self.write(cf::WEBHOOK_EVENTS, &key, &WebhookClaim::new(now))?;
        Ok(true)
    }

    async fn complete_webhook_event(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = keys::webhook_event_key(key);
        let mut claim = self
            .read::<WebhookClaim>(cf::WEBHOOK_EVENTS, &key)?
            .unwrap_or_else(|| WebhookClaim::new(now));
        claim.completed_at = Some(now);
        self.write(cf::WEBHOOK_EVENTS, &key, &claim)
    }

    async fn release_webhook_event(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let cf = self.cf(cf::WEBHOOK_EVENTS)?;
        self.db
            .delete_cf(&cf, keys::webhook_event_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
