//! Plan resolution for billing provider data.
//!
//! The provider identifies what was bought with an opaque variant id. Six
//! known ids map to a (tier, billing period) pair; anything else falls back
//! to reading the human-readable product name.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{BillingPeriod, PlanStatus, PlanTier};
use crate::error::{BillingError, Result};

/// Renewal gaps longer than this are treated as annual billing.
const ANNUAL_INFERENCE_DAYS: i64 = 30;

/// Provider variant ids for each paid plan and billing period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantConfig {
    /// Basic plan, billed monthly.
    pub basic_monthly: String,
    /// Basic plan, billed annually.
    pub basic_annual: String,
    /// Pro plan, billed monthly.
    pub pro_monthly: String,
    /// Pro plan, billed annually.
    pub pro_annual: String,
    /// Agency plan, billed monthly.
    pub agency_monthly: String,
    /// Agency plan, billed annually.
    pub agency_annual: String,
}

impl VariantConfig {
    fn entries(&self) -> [(&str, &'static str, PlanTier, BillingPeriod); 6] {
        [
            (&self.basic_monthly, "basic_monthly", PlanTier::Basic, BillingPeriod::Monthly),
            (&self.basic_annual, "basic_annual", PlanTier::Basic, BillingPeriod::Annual),
            (&self.pro_monthly, "pro_monthly", PlanTier::Pro, BillingPeriod::Monthly),
            (&self.pro_annual, "pro_annual", PlanTier::Pro, BillingPeriod::Annual),
            (&self.agency_monthly, "agency_monthly", PlanTier::Agency, BillingPeriod::Monthly),
            (&self.agency_annual, "agency_annual", PlanTier::Agency, BillingPeriod::Annual),
        ]
    }

    /// Fail unless all six ids are configured.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Configuration` naming the missing entries.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .entries()
            .iter()
            .filter(|(id, ..)| id.trim().is_empty())
            .map(|(_, name, ..)| *name)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BillingError::Configuration(format!(
                "missing variant ids: {}",
                missing.join(", ")
            )))
        }
    }

    /// Exact (trimmed) lookup of a variant id.
    #[must_use]
    pub fn lookup(&self, variant_id: &str) -> Option<(PlanTier, BillingPeriod)> {
        let variant_id = variant_id.trim();
        if variant_id.is_empty() {
            return None;
        }

        self.entries()
            .into_iter()
            .find(|(id, ..)| id.trim() == variant_id)
            .map(|(_, _, tier, period)| (tier, period))
    }

    /// Resolve the plan tier from a variant id, falling back to the product name.
    #[must_use]
    pub fn resolve_plan_tier(
        &self,
        variant_id: Option<&str>,
        product_name: Option<&str>,
    ) -> Option<PlanTier> {
        variant_id
            .and_then(|id| self.lookup(id))
            .map(|(tier, _)| tier)
            .or_else(|| product_name.and_then(tier_from_product_name))
    }

    /// Resolve the billing period: variant id, then product name, then the
    /// distance to the next renewal.
    #[must_use]
    pub fn resolve_billing_period(
        &self,
        variant_id: Option<&str>,
        product_name: Option<&str>,
        renews_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingPeriod {
        if let Some((_, period)) = variant_id.and_then(|id| self.lookup(id)) {
            return period;
        }

        if product_name.is_some_and(|name| name.to_ascii_lowercase().contains("annual")) {
            return BillingPeriod::Annual;
        }

        match renews_at {
            Some(renews_at) if renews_at - now > Duration::days(ANNUAL_INFERENCE_DAYS) => {
                BillingPeriod::Annual
            }
            _ => BillingPeriod::Monthly,
        }
    }
}

/// Find a tier name inside a product name.
///
/// "agency" is checked before "pro" and "pro" before "basic", so a name that
/// happens to contain a shorter token still resolves to the larger plan.
#[must_use]
pub fn tier_from_product_name(product_name: &str) -> Option<PlanTier> {
    let name = product_name.to_ascii_lowercase();
    [PlanTier::Agency, PlanTier::Pro, PlanTier::Basic]
        .into_iter()
        .find(|tier| name.contains(tier.as_str()))
}

/// Map the provider's subscription status onto ours.
#[must_use]
pub fn map_provider_status(status: &str) -> PlanStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "active" | "on_trial" | "paused" => PlanStatus::Active,
        "past_due" => PlanStatus::PastDue,
        _ => PlanStatus::Canceled,
    }
}
