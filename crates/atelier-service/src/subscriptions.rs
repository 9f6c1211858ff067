//! Billing provider subscription events.
//!
//! Every `subscription_*` event carries the subscription's current plan and
//! status, which are copied onto the user's ledger row. Only a new
//! subscription or a successful payment starts a new credit period; every
//! other event is metadata only and leaves balances alone.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use atelier_core::{
    compute_allocation, map_provider_status, AllocationInput, BillingError, CreditAccount,
    CreditTransaction, SubscriptionUpdate, UserId, UserRecord,
};
use atelier_store::{PeriodAllocation, Store};

use crate::credits::record_history;
use crate::error::ApiError;
use crate::notifier::{spawn_notification, Notification};
use crate::state::AppState;

/// Page size used when scanning the user directory by email.
pub const USER_PAGE_SIZE: usize = 1000;

/// Events that start a new credit period.
const ALLOCATING_EVENTS: [&str; 2] = ["subscription_created", "subscription_payment_success"];

/// Resource type carried by subscription events.
const SUBSCRIPTION_RESOURCE: &str = "subscriptions";

/// An id the provider may send as a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProviderId {
    /// String form.
    Text(String),
    /// Numeric form.
    Number(i64),
}

impl ProviderId {
    /// Canonical string form.
    #[must_use]
    pub fn to_id_string(&self) -> String {
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => n.to_string(),
        }
    }
}

/// Top-level webhook body.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    /// Delivery metadata.
    #[serde(default)]
    pub meta: Option<WebhookMeta>,
    /// The resource the event is about.
    #[serde(default)]
    pub data: Option<WebhookResource>,
    /// Side-loaded related resources.
    #[serde(default)]
    pub included: Vec<IncludedResource>,
}

/// Delivery metadata.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookMeta {
    /// Event name, used when the `x-event-name` header is absent.
    #[serde(default)]
    pub event_name: Option<String>,
}

/// The resource an event is about.
#[derive(Debug, Deserialize)]
pub struct WebhookResource {
    /// Provider subscription id.
    #[serde(default)]
    pub id: Option<ProviderId>,
    /// Resource type; subscription events use `subscriptions`.
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    /// Subscription attributes.
    #[serde(default)]
    pub attributes: SubscriptionAttributes,
    /// Links to the customer and variant.
    #[serde(default)]
    pub relationships: SubscriptionRelationships,
}

/// Subscription attributes used for plan and user resolution.
#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionAttributes {
    /// Provider status (active, on_trial, past_due, ...).
    #[serde(default)]
    pub status: Option<String>,
    /// Next renewal.
    #[serde(default)]
    pub renews_at: Option<DateTime<Utc>>,
    /// Subscriber email.
    #[serde(default)]
    pub user_email: Option<String>,
    /// Customer email, used when `user_email` is absent.
    #[serde(default)]
    pub customer_email: Option<String>,
    /// Purchased variant.
    #[serde(default)]
    pub variant_id: Option<ProviderId>,
    /// Human-readable product name.
    #[serde(default)]
    pub product_name: Option<String>,
    /// Provider customer id.
    #[serde(default)]
    pub customer_id: Option<ProviderId>,
}

/// Relationship links.
#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionRelationships {
    /// The subscribing customer.
    #[serde(default)]
    pub customer: Option<Relationship>,
    /// The purchased variant.
    #[serde(default)]
    pub variant: Option<Relationship>,
}

/// A single relationship link.
#[derive(Debug, Default, Deserialize)]
pub struct Relationship {
    /// Linked resource, if side-loaded or referenced.
    #[serde(default)]
    pub data: Option<ResourceRef>,
}

/// Type and id of a linked resource.
#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    /// Resource id.
    pub id: ProviderId,
}

/// A side-loaded resource.
#[derive(Debug, Deserialize)]
pub struct IncludedResource {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Raw attributes.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl WebhookResource {
    fn variant_id(&self) -> Option<String> {
        self.attributes
            .variant_id
            .as_ref()
            .or_else(|| {
                self.relationships
                    .variant
                    .as_ref()
                    .and_then(|r| r.data.as_ref())
                    .map(|d| &d.id)
            })
            .map(ProviderId::to_id_string)
    }

    fn customer_id(&self) -> Option<String> {
        self.attributes
            .customer_id
            .as_ref()
            .or_else(|| {
                self.relationships
                    .customer
                    .as_ref()
                    .and_then(|r| r.data.as_ref())
                    .map(|d| &d.id)
            })
            .map(ProviderId::to_id_string)
    }

    fn email(&self) -> Option<&str> {
        self.attributes
            .user_email
            .as_deref()
            .or(self.attributes.customer_email.as_deref())
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}

impl WebhookPayload {
    /// Product name from the attributes, or from a side-loaded product.
    fn product_name(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.attributes.product_name.as_deref())
            .or_else(|| {
                self.included
                    .iter()
                    .filter(|r| r.resource_type == "products")
                    .find_map(|r| r.attributes.get("name").and_then(|n| n.as_str()))
            })
    }
}

/// What happened to a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event was applied.
    Accepted,
    /// Not a subscription event; nothing to do.
    Ignored,
    /// This allocation was already processed.
    Duplicate,
}

impl WebhookOutcome {
    /// Status string returned to the provider.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Whether an event starts a new credit period.
#[must_use]
pub fn should_allocate_credits(event_name: &str) -> bool {
    ALLOCATING_EVENTS.contains(&event_name)
}

/// Idempotency key for an allocating delivery.
#[must_use]
pub fn idempotency_key(
    subscription_id: &str,
    event_name: &str,
    renews_at: Option<DateTime<Utc>>,
) -> String {
    let renews_at = renews_at.map_or_else(|| "none".to_string(), |at| at.to_rfc3339());
    format!("{subscription_id}:{event_name}:{renews_at}")
}

/// Find a user by email, paging through the directory.
pub async fn find_user_by_email(
    store: &dyn Store,
    email: &str,
) -> atelier_store::Result<Option<UserRecord>> {
    let wanted = email.trim().to_lowercase();
    let mut page = 1;
    loop {
        let users = store.list_users(page, USER_PAGE_SIZE).await?;
        if let Some(user) = users
            .iter()
            .find(|user| user.email.trim().to_lowercase() == wanted)
        {
            return Ok(Some(user.clone()));
        }
        if users.len() < USER_PAGE_SIZE {
            return Ok(None);
        }
        page += 1;
    }
}

/// Apply one subscription event to the ledger.
pub async fn process_event(
    state: &AppState,
    event_name: &str,
    payload: &WebhookPayload,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome, ApiError> {
    if !event_name.starts_with("subscription_") {
        tracing::debug!(event_name = %event_name, "Ignoring non-subscription event");
        return Ok(WebhookOutcome::Ignored);
    }

    let Some(data) = payload
        .data
        .as_ref()
        .filter(|d| d.resource_type.as_deref() == Some(SUBSCRIPTION_RESOURCE))
    else {
        tracing::debug!(event_name = %event_name, "Ignoring event without a subscription resource");
        return Ok(WebhookOutcome::Ignored);
    };

    let variants = &state.config.variants;
    variants.validate()?;

    let variant_id = data.variant_id();
    let product_name = payload.product_name();

    let plan_tier = variants
        .resolve_plan_tier(variant_id.as_deref(), product_name)
        .ok_or_else(|| {
            BillingError::UnknownPlan(format!(
                "variant {} / product {}",
                variant_id.as_deref().unwrap_or("-"),
                product_name.unwrap_or("-")
            ))
        })?;
    let billing_period = variants.resolve_billing_period(
        variant_id.as_deref(),
        product_name,
        data.attributes.renews_at,
        now,
    );

    let email = data
        .email()
        .ok_or_else(|| ApiError::BadRequest("Missing customer email".into()))?;
    let user = find_user_by_email(state.store.as_ref(), email)
        .await?
        .ok_or_else(|| BillingError::UserNotFound {
            email: email.to_string(),
        })?;

    let update = SubscriptionUpdate {
        plan_tier,
        plan_status: map_provider_status(data.attributes.status.as_deref().unwrap_or_default()),
        billing_period,
        external_subscription_id: data.id.as_ref().map(ProviderId::to_id_string),
        external_customer_id: data.customer_id(),
    };

    tracing::info!(
        event_name = %event_name,
        user_id = %user.user_id,
        plan_tier = %update.plan_tier,
        plan_status = %update.plan_status,
        billing_period = %update.billing_period,
        "Processing subscription event"
    );

    if !should_allocate_credits(event_name) {
        update_metadata(state.store.as_ref(), &user.user_id, &update, now).await?;
        return Ok(WebhookOutcome::Accepted);
    }

    let subscription_id = update
        .external_subscription_id
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Missing subscription id".into()))?;
    let key = idempotency_key(&subscription_id, event_name, data.attributes.renews_at);

    let stale_after = state.config.webhook_claim_stale_after();
    if !state
        .store
        .claim_webhook_event(&key, now, stale_after)
        .await?
    {
        tracing::info!(key = %key, "Duplicate allocation webhook, skipping");
        return Ok(WebhookOutcome::Duplicate);
    }

    match allocate(state, &user.user_id, &update, now).await {
        Ok(()) => {
            if let Err(complete_err) = state.store.complete_webhook_event(&key, now).await {
                tracing::error!(
                    key = %key,
                    error = %complete_err,
                    "Failed to mark webhook claim done; a late redelivery may allocate again"
                );
            }
            Ok(WebhookOutcome::Accepted)
        }
        Err(e) => {
            if let Err(release_err) = state.store.release_webhook_event(&key).await {
                tracing::error!(
                    key = %key,
                    error = %release_err,
                    "Failed to release webhook claim; retries wait until it goes stale"
                );
            }
            Err(e)
        }
    }
}

/// Copy plan metadata onto the row without touching balances.
async fn update_metadata(
    store: &dyn Store,
    user_id: &UserId,
    update: &SubscriptionUpdate,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    if store.apply_subscription(user_id, update, None, now).await? {
        return Ok(());
    }

    tracing::warn!(user_id = %user_id, "No ledger row for subscription update, creating one");
    let mut account = CreditAccount::new(*user_id, now);
    account.apply_subscription(update, now);
    if !store.create_account(&account).await? {
        store.apply_subscription(user_id, update, None, now).await?;
    }
    Ok(())
}

/// Start a new credit period for a paid event.
async fn allocate(
    state: &AppState,
    user_id: &UserId,
    update: &SubscriptionUpdate,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let store = state.store.as_ref();
    let monthly_credits = update
        .plan_tier
        .monthly_credits()
        .ok_or_else(|| BillingError::UnknownPlan(update.plan_tier.to_string()))?;

    let current = store.get_account(user_id).await?;
    let allocation = compute_allocation(&AllocationInput {
        previous_tier: current.as_ref().map(|a| a.plan_tier),
        incoming_tier: update.plan_tier,
        current_total: current.as_ref().map_or(0, |a| a.total_credits),
        current_used: current.as_ref().map_or(0, |a| a.used_credits),
        current_expiry: current.as_ref().and_then(|a| a.credits_expire_at),
        signup_bonus_given: current.as_ref().is_some_and(|a| a.signup_bonus_given),
        monthly_credits,
        now,
    });
    let period = PeriodAllocation {
        total_credits: allocation.total_credits,
        period_end: allocation.period_end,
    };

    if !store
        .apply_subscription(user_id, update, Some(period), now)
        .await?
    {
        tracing::warn!(user_id = %user_id, "No ledger row for allocation, creating one");
        let mut account = CreditAccount::new(*user_id, now);
        account.apply_subscription(update, now);
        account.apply_allocation(period.total_credits, period.period_end, now);
        if !store.create_account(&account).await? {
            store
                .apply_subscription(user_id, update, Some(period), now)
                .await?;
        }
    }

    tracing::info!(
        user_id = %user_id,
        transition = allocation.transition.as_str(),
        plan_tier = %update.plan_tier,
        carried_over = allocation.carried_over,
        total_credits = allocation.total_credits,
        period_end = %allocation.period_end,
        "Credits allocated"
    );

    record_history(
        store,
        CreditTransaction::allocation(*user_id, update.plan_tier, &allocation, now),
    )
    .await;

    spawn_notification(
        state.store.clone(),
        state.notifier.clone(),
        *user_id,
        Notification::PaymentConfirmation {
            plan_tier: update.plan_tier,
            billing_period: update.billing_period,
            total_credits: allocation.total_credits,
            carried_over: allocation.carried_over,
        },
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn allocating_events() {
        assert!(should_allocate_credits("subscription_created"));
        assert!(should_allocate_credits("subscription_payment_success"));
        assert!(!should_allocate_credits("subscription_updated"));
        assert!(!should_allocate_credits("subscription_cancelled"));
    }

    #[test]
    fn idempotency_key_includes_renewal() {
        let at = Utc.with_ymd_and_hms(2025, 6, 24, 14, 0, 0).unwrap();
        assert_eq!(
            idempotency_key("42", "subscription_payment_success", Some(at)),
            "42:subscription_payment_success:2025-06-24T14:00:00+00:00"
        );
        assert_eq!(
            idempotency_key("42", "subscription_created", None),
            "42:subscription_created:none"
        );
    }

    #[test]
    fn payload_ids_accept_strings_and_numbers() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "meta": { "event_name": "subscription_created" },
            "data": {
                "id": 1234,
                "type": "subscriptions",
                "attributes": {
                    "status": "active",
                    "renews_at": "2025-06-24T14:00:00.000000Z",
                    "customer_email": "Shopper@Example.com"
                },
                "relationships": {
                    "customer": { "data": { "type": "customers", "id": "77" } },
                    "variant": { "data": { "type": "variants", "id": 555 } }
                }
            }
        }))
        .unwrap();

        let data = payload.data.as_ref().unwrap();
        assert_eq!(data.id.as_ref().unwrap().to_id_string(), "1234");
        assert_eq!(data.variant_id().as_deref(), Some("555"));
        assert_eq!(data.customer_id().as_deref(), Some("77"));
        assert_eq!(data.email(), Some("Shopper@Example.com"));
    }

    #[test]
    fn product_name_falls_back_to_included_product() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "data": { "id": "1", "type": "subscriptions", "attributes": {} },
            "included": [
                { "type": "variants", "attributes": { "name": "Default" } },
                { "type": "products", "attributes": { "name": "Acme Agency Plan" } }
            ]
        }))
        .unwrap();

        assert_eq!(payload.product_name(), Some("Acme Agency Plan"));
    }

    #[tokio::test]
    async fn email_lookup_pages_and_ignores_case() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..(USER_PAGE_SIZE + 5) {
            store
                .put_user(&UserRecord {
                    user_id: UserId::generate(),
                    email: format!("user{i}@example.com"),
                    created_at: now + chrono::Duration::seconds(i64::try_from(i).unwrap()),
                })
                .await
                .unwrap();
        }

        let found = find_user_by_email(&store, "USER1003@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.email, "user1003@example.com");
        assert!(find_user_by_email(&store, "nobody@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn email_lookup_folds_non_ascii_case() {
        let store = MemoryStore::new();
        store
            .put_user(&UserRecord {
                user_id: UserId::generate(),
                email: "Ünal.Øster@example.com".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let found = find_user_by_email(&store, " ünal.øster@EXAMPLE.com ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.email, "Ünal.Øster@example.com");
    }
}
