//! Error types for atelier.

use crate::ids::IdError;

/// Result type for atelier core operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in credit and subscription handling.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Insufficient credits for the operation.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Credits currently available.
        available: i64,
        /// Credits required.
        required: i64,
    },

    /// The current credit period has lapsed on an inactive plan.
    #[error("credits expired")]
    CreditsExpired,

    /// Credit account not found.
    #[error("credit account not found: {user_id}")]
    AccountNotFound {
        /// The user ID that was not found.
        user_id: String,
    },

    /// No user in the directory matched the given email.
    #[error("no user found for email {email}")]
    UserNotFound {
        /// The email that was searched for.
        email: String,
    },

    /// A plan tier could not be resolved from billing data.
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    /// A stored or submitted enum value was not recognised.
    #[error("invalid {field}: {value}")]
    InvalidValue {
        /// Which field held the value.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// Invalid credit amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}
