//! Common test utilities for atelier integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum_test::{TestRequest, TestServer};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;

use atelier_core::{
    CreditAccount, CreditTransaction, DeductOutcome, PlanStatus, PlanTier, SubscriptionUpdate,
    UserId, UserRecord, VariantConfig,
};
use atelier_service::auth::JwtClaims;
use atelier_service::crypto::hmac_sha256_hex;
use atelier_service::{create_router, AppState, Notification, Notifier, NotifyError, ServiceConfig};
use atelier_store::{MemoryStore, PeriodAllocation, Result as StoreResult, Store, StoreError};

pub const SERVICE_API_KEY: &str = "test-service-key";
pub const JWT_SECRET: &str = "test-jwt-secret";
pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

pub const BASIC_MONTHLY: &str = "101";
pub const BASIC_ANNUAL: &str = "102";
pub const PRO_MONTHLY: &str = "201";
pub const PRO_ANNUAL: &str = "202";
pub const AGENCY_MONTHLY: &str = "301";
pub const AGENCY_ANNUAL: &str = "302";

/// Notifier that remembers what it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Notification)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .await
            .push((recipient.to_string(), notification.clone()));
        Ok(())
    }
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().await.clone()
    }

    /// Wait for background deliveries to reach `count`.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, Notification)> {
        for _ in 0..100 {
            let sent = self.sent().await;
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent().await
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// State shared with the router, for calling jobs directly.
    pub state: AppState,
    /// The ledger behind the server.
    pub store: Arc<dyn Store>,
    /// Captured notifications.
    pub notifier: Arc<RecordingNotifier>,
    /// Temporary directory for RocksDB (kept alive for test duration).
    pub _temp_dir: Option<TempDir>,
}

/// In-memory ledger with injectable faults.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_next_allocation: AtomicBool,
    hang_next_allocation: AtomicBool,
    failing_resets: Mutex<Vec<UserId>>,
}

impl FaultyStore {
    /// The next allocating subscription write returns a database error.
    pub fn failing_next_allocation() -> Self {
        Self {
            fail_next_allocation: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// The next allocating subscription write never completes.
    pub fn hanging_next_allocation() -> Self {
        Self {
            hang_next_allocation: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Every reset of `user_id` returns a database error.
    pub async fn fail_resets_for(&self, user_id: UserId) {
        self.failing_resets.lock().await.push(user_id);
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn put_account(&self, account: &CreditAccount) -> StoreResult<()> {
        self.inner.put_account(account).await
    }
    async fn create_account(&self, account: &CreditAccount) -> StoreResult<bool> {
        self.inner.create_account(account).await
    }
    async fn get_account(&self, user_id: &UserId) -> StoreResult<Option<CreditAccount>> {
        self.inner.get_account(user_id).await
    }
    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<DeductOutcome> {
        self.inner.try_deduct(user_id, amount, now).await
    }
    async fn grant_signup_bonus(
        &self,
        user_id: &UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CreditAccount>> {
        self.inner.grant_signup_bonus(user_id, amount, now).await
    }
    async fn apply_subscription(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
        allocation: Option<PeriodAllocation>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if allocation.is_some() {
            if self.hang_next_allocation.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_next_allocation.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Database("connection reset".into()));
            }
        }
        self.inner
            .apply_subscription(user_id, update, allocation, now)
            .await
    }
    async fn list_due_for_reset(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<CreditAccount>> {
        self.inner.list_due_for_reset(cutoff).await
    }
    async fn apply_reset(
        &self,
        user_id: &UserId,
        expected_reset_at: DateTime<Utc>,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i64>> {
        if self.failing_resets.lock().await.contains(user_id) {
            return Err(StoreError::Database("deadlock detected".into()));
        }
        self.inner
            .apply_reset(user_id, expected_reset_at, monthly_credits, now)
            .await
    }
    async fn put_user(&self, user: &UserRecord) -> StoreResult<()> {
        self.inner.put_user(user).await
    }
    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<UserRecord>> {
        self.inner.get_user(user_id).await
    }
    async fn list_users(&self, page: usize, per_page: usize) -> StoreResult<Vec<UserRecord>> {
        self.inner.list_users(page, per_page).await
    }
    async fn put_transaction(&self, transaction: &CreditTransaction) -> StoreResult<()> {
        self.inner.put_transaction(transaction).await
    }
    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<CreditTransaction>> {
        self.inner
            .list_transactions_by_user(user_id, limit, offset)
            .await
    }
    async fn claim_webhook_event(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> StoreResult<bool> {
        self.inner.claim_webhook_event(key, now, stale_after).await
    }
    async fn complete_webhook_event(&self, key: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.inner.complete_webhook_event(key, now).await
    }
    async fn release_webhook_event(&self, key: &str) -> StoreResult<()> {
        self.inner.release_webhook_event(key).await
    }
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        service_api_key: Some(SERVICE_API_KEY.into()),
        jwt_secret: Some(JWT_SECRET.into()),
        webhook_secret: Some(WEBHOOK_SECRET.into()),
        variants: VariantConfig {
            basic_monthly: BASIC_MONTHLY.into(),
            basic_annual: BASIC_ANNUAL.into(),
            pro_monthly: PRO_MONTHLY.into(),
            pro_annual: PRO_ANNUAL.into(),
            agency_monthly: AGENCY_MONTHLY.into(),
            agency_annual: AGENCY_ANNUAL.into(),
        },
        ..ServiceConfig::default()
    }
}

impl TestHarness {
    /// Harness over an in-memory ledger.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Harness over an in-memory ledger with custom configuration.
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::build(Arc::new(MemoryStore::new()), config, None)
    }

    /// Harness over any ledger.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self::build(store, test_config(), None)
    }

    /// Harness over a fresh RocksDB ledger.
    #[cfg(feature = "rocksdb-backend")]
    pub fn with_rocksdb() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store =
            atelier_store::RocksStore::open(temp_dir.path()).expect("Failed to open store");
        Self::build(Arc::new(store), test_config(), Some(temp_dir))
    }

    fn build(store: Arc<dyn Store>, config: ServiceConfig, temp_dir: Option<TempDir>) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let state = AppState::with_notifier(store.clone(), config, notifier.clone());
        let server = TestServer::new(create_router(state.clone()))
            .expect("Failed to create test server");

        Self {
            server,
            state,
            store,
            notifier,
            _temp_dir: temp_dir,
        }
    }

    /// POST with the service API key.
    pub fn service_post(&self, path: &str) -> TestRequest {
        self.server
            .post(path)
            .add_header(header("x-api-key"), value(SERVICE_API_KEY))
    }

    /// GET with the service API key.
    pub fn service_get(&self, path: &str) -> TestRequest {
        self.server
            .get(path)
            .add_header(header("x-api-key"), value(SERVICE_API_KEY))
    }

    /// GET as an end user.
    pub fn user_get(&self, path: &str, user_id: UserId) -> TestRequest {
        self.server
            .get(path)
            .add_header(header("authorization"), value(&format!("Bearer {}", user_token(user_id))))
    }

    /// POST a signed billing webhook.
    pub fn webhook(&self, event_name: &str, body: &Value) -> TestRequest {
        let raw = body.to_string();
        let signature = hmac_sha256_hex(WEBHOOK_SECRET, raw.as_bytes()).unwrap();
        self.server
            .post("/webhooks/billing")
            .add_header(header("x-event-name"), value(event_name))
            .add_header(header("x-signature"), value(&signature))
            .text(raw)
    }

    /// Register a user through the API; they get the signup bonus.
    pub async fn register(&self, email: &str) -> UserId {
        let user_id = UserId::generate();
        self.service_post("/v1/accounts")
            .json(&json!({ "user_id": user_id.to_string(), "email": email }))
            .await
            .assert_status_ok();
        user_id
    }

    /// Put a user and a paid ledger row straight into the store.
    pub async fn seed_paid_account(
        &self,
        email: &str,
        tier: PlanTier,
        total: i64,
        used: i64,
        expires_at: DateTime<Utc>,
        signup_bonus_given: bool,
    ) -> UserId {
        let now = Utc::now();
        let user_id = UserId::generate();
        self.store
            .put_user(&UserRecord {
                user_id,
                email: email.to_string(),
                created_at: now,
            })
            .await
            .unwrap();

        let mut account = CreditAccount::new(user_id, now);
        account.plan_tier = tier;
        account.plan_status = PlanStatus::Active;
        account.total_credits = total;
        account.used_credits = used;
        account.credits_expire_at = Some(expires_at);
        account.next_credit_reset_at = Some(expires_at);
        account.signup_bonus_given = signup_bonus_given;
        self.store.put_account(&account).await.unwrap();
        user_id
    }

    pub async fn account(&self, user_id: UserId) -> CreditAccount {
        self.store
            .get_account(&user_id)
            .await
            .unwrap()
            .expect("account should exist")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn header(name: &'static str) -> HeaderName {
    HeaderName::from_static(name)
}

pub fn value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap()
}

/// A session JWT for `user_id`, valid for an hour.
pub fn user_token(user_id: UserId) -> String {
    let claims = JwtClaims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + 3600,
        iat: Some(Utc::now().timestamp()),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// A subscription webhook body.
pub fn subscription_event(
    subscription_id: &str,
    email: &str,
    variant_id: Option<&str>,
    product_name: Option<&str>,
    status: &str,
    renews_at: DateTime<Utc>,
) -> Value {
    json!({
        "meta": { "event_name": "ignored-when-header-present" },
        "data": {
            "id": subscription_id,
            "type": "subscriptions",
            "attributes": {
                "status": status,
                "renews_at": renews_at.to_rfc3339(),
                "user_email": email,
                "variant_id": variant_id,
                "product_name": product_name,
                "customer_id": 9001
            }
        }
    })
}
