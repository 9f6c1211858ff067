//! Credit account types for atelier.
//!
//! A `CreditAccount` is the single per-user ledger row. Every producer
//! (billing webhooks, the monthly reset job) and the consumer (feature usage)
//! converge on it, so the mutation helpers here are written to be applied
//! under whatever atomicity the storage backend provides.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allocation::{add_one_month, monthly_reset_total};
use crate::error::BillingError;
use crate::UserId;

// ============================================================================
// Constants
// ============================================================================

/// Monthly credit allowance of the basic plan.
pub const BASIC_PLAN_CREDITS: i64 = 175;

/// Monthly credit allowance of the pro plan.
pub const PRO_PLAN_CREDITS: i64 = 360;

/// Monthly credit allowance of the agency plan.
pub const AGENCY_PLAN_CREDITS: i64 = 550;

/// One-time credits granted at signup, and the most that survive a first
/// paid subscription or a plan change.
pub const SIGNUP_BONUS_CREDITS: i64 = 10;

/// Remaining-credit level below which the user is warned once.
pub const LOW_CREDITS_THRESHOLD: i64 = 20;

/// A user's credit ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// The user this ledger belongs to.
    pub user_id: UserId,

    /// Subscription tier.
    pub plan_tier: PlanTier,

    /// Subscription status as last reported by the billing provider.
    pub plan_status: PlanStatus,

    /// Billing cadence. Informational only: credits reset monthly for both.
    pub billing_period: BillingPeriod,

    /// Credit ceiling for the current period.
    pub total_credits: i64,

    /// Credits consumed in the current period.
    pub used_credits: i64,

    /// End of the current credit period.
    pub credits_expire_at: Option<DateTime<Utc>>,

    /// Next scheduled allocation. Always equal to `credits_expire_at`.
    pub next_credit_reset_at: Option<DateTime<Utc>>,

    /// Whether the one-time signup bonus was ever granted.
    pub signup_bonus_given: bool,

    /// When credits were last allocated (audit only).
    pub last_credits_allocated_at: Option<DateTime<Utc>>,

    /// Billing provider subscription id.
    pub external_subscription_id: Option<String>,

    /// Billing provider customer id.
    pub external_customer_id: Option<String>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the row was last changed.
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Create an empty free-tier account.
    #[must_use]
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            plan_tier: PlanTier::Free,
            plan_status: PlanStatus::Inactive,
            billing_period: BillingPeriod::Monthly,
            total_credits: 0,
            used_credits: 0,
            credits_expire_at: None,
            next_credit_reset_at: None,
            signup_bonus_given: false,
            last_credits_allocated_at: None,
            external_subscription_id: None,
            external_customer_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stored balance, ignoring expiry.
    #[must_use]
    pub fn available_credits(&self) -> i64 {
        (self.total_credits - self.used_credits).max(0)
    }

    /// Whether the current credit period has ended.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.credits_expire_at.is_some_and(|at| at < now)
    }

    /// Expired credits on a plan that is not active are void.
    #[must_use]
    pub fn credits_void(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) && self.plan_status != PlanStatus::Active
    }

    /// Balance usable right now.
    #[must_use]
    pub fn spendable_credits(&self, now: DateTime<Utc>) -> i64 {
        if self.credits_void(now) {
            0
        } else {
            self.available_credits()
        }
    }

    /// Snapshot for callers that only need the numbers.
    #[must_use]
    pub fn info(&self) -> CreditInfo {
        CreditInfo {
            total_credits: self.total_credits,
            used_credits: self.used_credits,
            available_credits: self.available_credits(),
            credits_expire_at: self.credits_expire_at,
            last_credits_allocated_at: self.last_credits_allocated_at,
        }
    }

    /// Consume `amount` credits if they are available.
    ///
    /// Only `used_credits` changes. Callers must hold the row exclusively.
    pub fn try_deduct(&mut self, amount: i64, now: DateTime<Utc>) -> DeductOutcome {
        if self.credits_void(now) {
            return DeductOutcome::Expired;
        }

        let available = self.available_credits();
        if amount > available {
            return DeductOutcome::Insufficient { available };
        }

        self.used_credits += amount;
        self.updated_at = now;

        DeductOutcome::Applied {
            previous_remaining: available,
            remaining: self.available_credits(),
        }
    }

    /// Grant the one-time signup bonus. Returns `false` if it was already given.
    pub fn grant_signup_bonus(&mut self, amount: i64, now: DateTime<Utc>) -> bool {
        if self.signup_bonus_given {
            return false;
        }

        let period_end = add_one_month(now);
        let period_end = self
            .credits_expire_at
            .map_or(period_end, |current| current.max(period_end));

        self.total_credits += amount;
        self.credits_expire_at = Some(period_end);
        self.next_credit_reset_at = Some(period_end);
        self.signup_bonus_given = true;
        self.last_credits_allocated_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Overwrite subscription metadata. Balances are untouched.
    pub fn apply_subscription(&mut self, update: &SubscriptionUpdate, now: DateTime<Utc>) {
        self.plan_tier = update.plan_tier;
        self.plan_status = update.plan_status;
        self.billing_period = update.billing_period;
        if let Some(id) = &update.external_subscription_id {
            self.external_subscription_id = Some(id.clone());
        }
        if let Some(id) = &update.external_customer_id {
            self.external_customer_id = Some(id.clone());
        }
        self.updated_at = now;
    }

    /// Start a new credit period with `total_credits` ending at `period_end`.
    pub fn apply_allocation(
        &mut self,
        total_credits: i64,
        period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.total_credits = total_credits;
        self.used_credits = 0;
        self.credits_expire_at = Some(period_end);
        self.next_credit_reset_at = Some(period_end);
        self.last_credits_allocated_at = Some(now);
        self.updated_at = now;
    }

    /// Run the scheduled monthly reset if the row is still at `expected_reset_at`.
    ///
    /// Returns the new total, or `None` when the row has already moved on
    /// (another run reset it, or a webhook re-anchored the period).
    pub fn apply_monthly_reset(
        &mut self,
        expected_reset_at: DateTime<Utc>,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        if self.next_credit_reset_at != Some(expected_reset_at) {
            return None;
        }

        let total = monthly_reset_total(self.total_credits, self.used_credits, monthly_credits);
        self.apply_allocation(total, add_one_month(expected_reset_at), now);
        Some(total)
    }
}

/// Read-only view of an account's credit numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditInfo {
    /// Credit ceiling for the current period.
    pub total_credits: i64,
    /// Credits consumed in the current period.
    pub used_credits: i64,
    /// `max(0, total - used)`.
    pub available_credits: i64,
    /// End of the current credit period.
    pub credits_expire_at: Option<DateTime<Utc>>,
    /// When credits were last allocated.
    pub last_credits_allocated_at: Option<DateTime<Utc>>,
}

/// Result of a conditional deduction against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    /// Credits were consumed.
    Applied {
        /// Remaining balance immediately before this deduction.
        previous_remaining: i64,
        /// Remaining balance after this deduction.
        remaining: i64,
    },
    /// Not enough credits; nothing was written.
    Insufficient {
        /// Credits that were available.
        available: i64,
    },
    /// The period lapsed and the plan is not active; nothing was written.
    Expired,
    /// No ledger row exists for the user.
    AccountNotFound,
}

/// Subscription metadata carried by every billing webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// Resolved plan tier.
    pub plan_tier: PlanTier,
    /// Mapped subscription status.
    pub plan_status: PlanStatus,
    /// Resolved billing period.
    pub billing_period: BillingPeriod,
    /// Provider subscription id, if present in the event.
    pub external_subscription_id: Option<String>,
    /// Provider customer id, if present in the event.
    pub external_customer_id: Option<String>,
}

/// An entry in the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// The user's id.
    pub user_id: UserId,
    /// Registered email address.
    pub email: String,
    /// When the user signed up.
    pub created_at: DateTime<Utc>,
}

/// Subscription tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// No subscription; signup bonus only.
    Free,
    /// Basic plan: 175 credits per month.
    Basic,
    /// Pro plan: 360 credits per month.
    Pro,
    /// Agency plan: 550 credits per month.
    Agency,
}

impl PlanTier {
    /// Monthly allowance, or `None` for tiers without an allocation.
    #[must_use]
    pub const fn monthly_credits(self) -> Option<i64> {
        match self {
            Self::Basic => Some(BASIC_PLAN_CREDITS),
            Self::Pro => Some(PRO_PLAN_CREDITS),
            Self::Agency => Some(AGENCY_PLAN_CREDITS),
            Self::Free => None,
        }
    }

    /// Whether this is a paid tier.
    #[must_use]
    pub const fn is_paid(self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Lowercase name as stored and sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Agency => "agency",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "agency" => Ok(Self::Agency),
            other => Err(BillingError::UnknownPlan(other.to_string())),
        }
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Never subscribed.
    Inactive,
    /// Subscription in good standing.
    Active,
    /// Payment failed; provider is retrying.
    PastDue,
    /// Subscription ended.
    Canceled,
}

impl PlanStatus {
    /// Lowercase name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            other => Err(BillingError::InvalidValue {
                field: "plan_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Billing cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    /// Billed every month.
    Monthly,
    /// Billed once a year; credits still arrive monthly.
    Annual,
}

impl BillingPeriod {
    /// Lowercase name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingPeriod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(Self::Monthly),
            "annual" => Ok(Self::Annual),
            other => Err(BillingError::InvalidValue {
                field: "billing_period",
                value: other.to_string(),
            }),
        }
    }
}
