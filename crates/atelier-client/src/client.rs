//! Credits service HTTP client implementation.

use reqwest::{Client, StatusCode};
use std::time::Duration;

use atelier_core::UserId;

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, CheckCreditsRequest, CheckCreditsResponse, CreditInfo,
    DeductCreditsRequest, DeductionResult, RegisterAccountRequest, RegisterAccountResponse,
};

/// Atelier credits API client.
///
/// Service calls authenticate with the `x-api-key` header.
#[derive(Debug, Clone)]
pub struct CreditsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CreditsClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the credits service (e.g., `"http://atelier-credits:8080"`)
    /// * `api_key` - Service API key for authentication
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a new client with custom options.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Credit numbers for a user.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AccountNotFound`] if the user has no ledger row.
    pub async fn get_credit_info(&self, user_id: &UserId) -> Result<CreditInfo, ClientError> {
        let url = format!("{}/v1/credits/{user_id}", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Whether a user can spend `required_credits` right now.
    ///
    /// Unknown users are reported as `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn has_enough_credits(
        &self,
        user_id: &UserId,
        required_credits: i64,
    ) -> Result<bool, ClientError> {
        let url = format!("{}/v1/credits/check", self.base_url);
        let request = CheckCreditsRequest {
            user_id: *user_id,
            required_credits,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let body: CheckCreditsResponse = self.handle_response(response).await?;
        Ok(body.has_enough)
    }

    /// Spend credits on a feature.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    /// A refused deduction is an `Ok` result with `success: false`.
    pub async fn deduct_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        feature: Option<&str>,
    ) -> Result<DeductionResult, ClientError> {
        let url = format!("{}/v1/credits/deduct", self.base_url);
        let request = DeductCreditsRequest {
            user_id: *user_id,
            amount,
            feature: feature.map(str::to_string),
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let result: DeductionResult = self.handle_response(response).await?;
        if !result.success {
            tracing::debug!(
                user_id = %user_id,
                amount = amount,
                reason = result.error.as_deref().unwrap_or("unknown"),
                "Deduction refused"
            );
        }
        Ok(result)
    }

    /// Register a user and grant the signup bonus. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn register_account(
        &self,
        user_id: &UserId,
        email: impl Into<String>,
    ) -> Result<RegisterAccountResponse, ClientError> {
        let url = format!("{}/v1/accounts", self.base_url);
        let request = RegisterAccountRequest {
            user_id: *user_id,
            email: email.into(),
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }

        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        match error_body {
            Ok(api_error) => {
                let code = api_error.error.code;
                let message = api_error.error.message;

                if code == "not_found" && message.starts_with("credit account not found") {
                    return Err(ClientError::AccountNotFound {
                        user_id: message
                            .rsplit(": ")
                            .next()
                            .unwrap_or_default()
                            .to_string(),
                    });
                }

                Err(ClientError::Api {
                    code,
                    message,
                    status: status.as_u16(),
                })
            }
            Err(_) => Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 10).
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { timeout_seconds: 10 }
    }
}
