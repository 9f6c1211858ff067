//! Credit history entries.
//!
//! Every change to a ledger row leaves one `CreditTransaction` behind. The
//! ledger row stays the source of truth; history is for display and audit.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::PlanTier;
use crate::allocation::{Allocation, PlanTransition};
use crate::error::BillingError;
use crate::ids::{TransactionId, UserId};

/// What produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// One-time signup bonus.
    SignupBonus,
    /// Webhook-driven allocation (new subscription, renewal, plan change).
    Allocation,
    /// Scheduled monthly reset.
    MonthlyReset,
    /// Credits spent on a feature.
    Usage,
}

impl TransactionKind {
    /// Lowercase name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignupBonus => "signup_bonus",
            Self::Allocation => "allocation",
            Self::MonthlyReset => "monthly_reset",
            Self::Usage => "usage",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup_bonus" => Ok(Self::SignupBonus),
            "allocation" => Ok(Self::Allocation),
            "monthly_reset" => Ok(Self::MonthlyReset),
            "usage" => Ok(Self::Usage),
            other => Err(BillingError::InvalidValue {
                field: "transaction_kind",
                value: other.to_string(),
            }),
        }
    }
}

/// A single credit history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Time-ordered id.
    pub id: TransactionId,
    /// Whose ledger changed.
    pub user_id: UserId,
    /// Signed change: positive for grants, negative for usage.
    ///
    /// For allocations this is the new period total, since the old
    /// period is replaced rather than topped up.
    pub amount: i64,
    /// What produced the entry.
    pub kind: TransactionKind,
    /// Spendable balance right after the change.
    pub available_after: i64,
    /// Human-readable description.
    pub description: String,
    /// Extra structured context (feature name, transition, carry-over).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the change happened.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    fn new(
        user_id: UserId,
        amount: i64,
        kind: TransactionKind,
        available_after: i64,
        description: String,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            kind,
            available_after,
            description,
            metadata,
            created_at: now,
        }
    }

    /// Entry for the signup bonus.
    #[must_use]
    pub fn signup_bonus(
        user_id: UserId,
        amount: i64,
        available_after: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            user_id,
            amount,
            TransactionKind::SignupBonus,
            available_after,
            format!("Signup bonus: {amount} credits"),
            serde_json::Value::Null,
            now,
        )
    }

    /// Entry for a webhook-driven allocation.
    #[must_use]
    pub fn allocation(
        user_id: UserId,
        tier: PlanTier,
        allocation: &Allocation,
        now: DateTime<Utc>,
    ) -> Self {
        let description = match allocation.transition {
            PlanTransition::FirstTimePaid => format!("Subscribed to {tier} plan"),
            PlanTransition::Renewal => format!("Renewed {tier} plan"),
            PlanTransition::PlanChange => format!("Switched to {tier} plan"),
        };

        Self::new(
            user_id,
            allocation.total_credits,
            TransactionKind::Allocation,
            allocation.total_credits,
            description,
            serde_json::json!({
                "plan_tier": tier.as_str(),
                "transition": allocation.transition.as_str(),
                "carried_over": allocation.carried_over,
                "period_end": allocation.period_end,
            }),
            now,
        )
    }

    /// Entry for a scheduled monthly reset.
    #[must_use]
    pub fn monthly_reset(
        user_id: UserId,
        tier: PlanTier,
        new_total: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            user_id,
            new_total,
            TransactionKind::MonthlyReset,
            new_total,
            format!("Monthly {tier} credits"),
            serde_json::json!({ "plan_tier": tier.as_str() }),
            now,
        )
    }

    /// Entry for credits spent on a feature.
    #[must_use]
    pub fn usage(
        user_id: UserId,
        amount: i64,
        available_after: i64,
        feature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let (description, metadata) = match feature {
            Some(feature) => (
                format!("Used {amount} credits on {feature}"),
                serde_json::json!({ "feature": feature }),
            ),
            None => (format!("Used {amount} credits"), serde_json::Value::Null),
        };

        Self::new(
            user_id,
            -amount,
            TransactionKind::Usage,
            available_after,
            description,
            metadata,
            now,
        )
    }
}
