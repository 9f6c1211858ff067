//! Error types for atelier storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed, or a stored value is malformed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },
}

impl StoreError {
    /// Shorthand for a missing credit account.
    #[must_use]
    pub fn account_not_found(user_id: &atelier_core::UserId) -> Self {
        Self::NotFound {
            entity: "credit account",
            id: user_id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {err}"))
    }
}

impl From<atelier_core::BillingError> for StoreError {
    fn from(err: atelier_core::BillingError) -> Self {
        Self::Serialization(err.to_string())
    }
}
