//! Client error types.

/// Errors that can occur when using the credits client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// No credit account exists for the user.
    #[error("account not found: {user_id}")]
    AccountNotFound {
        /// The user ID.
        user_id: String,
    },

    /// The service rejected the API key.
    #[error("unauthorized")]
    Unauthorized,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
