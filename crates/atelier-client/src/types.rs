//! Request and response types for the credits client.

use serde::{Deserialize, Serialize};

use atelier_core::UserId;

pub use atelier_core::CreditInfo;

/// Deduction request.
#[derive(Debug, Clone, Serialize)]
pub struct DeductCreditsRequest {
    /// User to charge.
    pub user_id: UserId,
    /// Credits to spend.
    pub amount: i64,
    /// Feature the credits are spent on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

/// Outcome of a deduction.
///
/// A refusal (insufficient or expired credits) is `success: false`, not an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeductionResult {
    /// Whether credits were consumed.
    pub success: bool,
    /// Credits left after the call; 0 on refusal.
    pub remaining_credits: i64,
    /// Why the deduction was refused.
    #[serde(default)]
    pub error: Option<String>,
}

/// Affordability check request.
#[derive(Debug, Clone, Serialize)]
pub struct CheckCreditsRequest {
    /// User to check.
    pub user_id: UserId,
    /// Credits the operation needs.
    pub required_credits: i64,
}

/// Affordability check response.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckCreditsResponse {
    /// Whether the user can afford it right now.
    pub has_enough: bool,
}

/// Account registration request.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterAccountRequest {
    /// User ID from the auth provider.
    pub user_id: UserId,
    /// Email used to match billing webhooks.
    pub email: String,
}

/// Account registration response.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAccountResponse {
    /// User ID.
    pub user_id: String,
    /// Stored email.
    pub email: String,
    /// Whether a ledger row was created by this call.
    pub created: bool,
    /// Whether this call granted the signup bonus.
    pub signup_bonus_granted: bool,
    /// Credit numbers after registration.
    pub credits: CreditInfo,
}

/// API error response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
