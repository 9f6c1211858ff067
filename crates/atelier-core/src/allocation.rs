//! Credit allocation rules.
//!
//! Billing webhooks and the monthly reset both start a new credit period.
//! What carries over from the old period depends on how the plan changed:
//!
//! | Transition | Carried over |
//! |---|---|
//! | first paid plan (from free / no plan) | unused signup bonus, at most 10 |
//! | renewal of the same paid plan | every unused credit |
//! | switch between paid plans | unused signup bonus, at most 10 |
//!
//! Nothing carries over once the old period has ended. The scheduled
//! monthly reset always behaves like a renewal.

use chrono::{DateTime, Months, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{PlanTier, SIGNUP_BONUS_CREDITS};

/// How an incoming paid plan relates to the plan on record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTransition {
    /// No plan, or free, before this event.
    FirstTimePaid,
    /// Same paid tier as before.
    Renewal,
    /// A different paid tier than before.
    PlanChange,
}

impl PlanTransition {
    /// Lowercase name used in history metadata and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstTimePaid => "first_time_paid",
            Self::Renewal => "renewal",
            Self::PlanChange => "plan_change",
        }
    }
}

/// Classify a billing event for `incoming` against the tier on record.
#[must_use]
pub fn classify_transition(previous: Option<PlanTier>, incoming: PlanTier) -> PlanTransition {
    match previous {
        None | Some(PlanTier::Free) => PlanTransition::FirstTimePaid,
        Some(previous) if previous == incoming => PlanTransition::Renewal,
        Some(_) => PlanTransition::PlanChange,
    }
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInput {
    /// Tier on record before the event, if any row exists.
    pub previous_tier: Option<PlanTier>,
    /// Tier named by the event.
    pub incoming_tier: PlanTier,
    /// Current period ceiling.
    pub current_total: i64,
    /// Current period usage.
    pub current_used: i64,
    /// End of the current period.
    pub current_expiry: Option<DateTime<Utc>>,
    /// Whether the signup bonus was granted.
    pub signup_bonus_given: bool,
    /// Monthly allowance of the incoming tier.
    pub monthly_credits: i64,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Outcome of the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// How the event was classified.
    pub transition: PlanTransition,
    /// Credits carried over from the previous period.
    pub carried_over: i64,
    /// New period ceiling: monthly allowance plus carry-over.
    pub total_credits: i64,
    /// End of the new period (also the next reset).
    pub period_end: DateTime<Utc>,
}

/// Compute the new credit period for a webhook-driven allocation.
#[must_use]
pub fn compute_allocation(input: &AllocationInput) -> Allocation {
    let transition = classify_transition(input.previous_tier, input.incoming_tier);

    let still_valid = input.current_expiry.is_some_and(|expiry| input.now <= expiry);
    let unused = (input.current_total - input.current_used).max(0);

    let carried_over = match transition {
        PlanTransition::Renewal if still_valid => unused,
        PlanTransition::FirstTimePaid | PlanTransition::PlanChange
            if still_valid && input.signup_bonus_given =>
        {
            unused.min(SIGNUP_BONUS_CREDITS)
        }
        _ => 0,
    };

    Allocation {
        transition,
        carried_over,
        total_credits: input.monthly_credits + carried_over,
        period_end: add_one_month(input.now),
    }
}

/// New ceiling for a scheduled reset: full rollover, no cap.
#[must_use]
pub fn monthly_reset_total(total: i64, used: i64, monthly_credits: i64) -> i64 {
    monthly_credits + (total - used).max(0)
}

/// Same instant one calendar month later.
///
/// Days past the end of the target month clamp to its last day
/// (Jan 31 becomes Feb 28/29).
#[must_use]
pub fn add_one_month(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_add_months(Months::new(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Last representable instant of `now`'s UTC calendar day.
#[must_use]
pub fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
        .map_or(now, |time| Utc.from_utc_datetime(&now.date_naive().and_time(time)))
}
