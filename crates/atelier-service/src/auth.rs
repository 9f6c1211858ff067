//! Authentication extractors.
//!
//! - `AuthUser` - End-user authentication via an HS256 session JWT
//! - `ServiceAuth` - Feature code calling the credit API with an API key
//! - `ResetAuth` - The scheduler calling the reset job endpoint

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use atelier_core::UserId;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// An authenticated end user.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let token = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or(ApiError::Unauthorized)?;

            // Gated so the bypass can never ship in a release build.
            #[cfg(any(test, feature = "test-auth"))]
            if let Some(user_id_str) = token.strip_prefix("test-token:") {
                let user_id = user_id_str
                    .parse::<UserId>()
                    .map_err(|_| ApiError::Unauthorized)?;
                return Ok(AuthUser { user_id });
            }

            let secret = state.config.jwt_secret.as_deref().ok_or_else(|| {
                tracing::warn!("JWT secret not configured - rejecting user request");
                ApiError::Unauthorized
            })?;

            let claims = validate_jwt(token, secret)?;
            let user_id = claims
                .sub
                .parse::<UserId>()
                .map_err(|_| ApiError::Unauthorized)?;

            Ok(AuthUser { user_id })
        })
    }
}

/// Service authentication via API key.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The calling service, from `x-service-name`.
    pub service_name: String,
}

impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let api_key = parts
                .headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let expected_key = state
                .config
                .service_api_key
                .as_ref()
                .ok_or(ApiError::Unauthorized)?;

            if !constant_time_eq(api_key, expected_key) {
                return Err(ApiError::Unauthorized);
            }

            let service_name = parts
                .headers
                .get("x-service-name")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();

            Ok(ServiceAuth { service_name })
        })
    }
}

/// Authorization for the reset job endpoint.
///
/// When a reset secret is configured, `x-reset-secret` must match it.
/// Without one the endpoint is open (development mode).
#[derive(Debug, Clone, Copy)]
pub struct ResetAuth;

impl FromRequestParts<Arc<AppState>> for ResetAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let Some(expected) = state.config.reset_secret.as_deref() else {
                tracing::warn!("Reset secret not configured - skipping reset job authorization");
                return Ok(ResetAuth);
            };

            let provided = parts
                .headers
                .get("x-reset-secret")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            if constant_time_eq(provided, expected) {
                Ok(ResetAuth)
            } else {
                tracing::warn!("Reset job called with wrong secret");
                Err(ApiError::Unauthorized)
            }
        })
    }
}

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: Option<i64>,
}

fn validate_jwt(token: &str, secret: &str) -> Result<JwtClaims, ApiError> {
    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        ApiError::Unauthorized
    })?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp: i64) -> String {
        let claims = JwtClaims {
            sub: sub.to_string(),
            exp,
            iat: None,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn valid_token_yields_claims() {
        let user_id = UserId::generate().to_string();
        let claims = validate_jwt(&token("s3cret", &user_id, in_one_hour()), "s3cret").unwrap();
        assert_eq!(claims.sub, user_id);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let jwt = token("s3cret", "someone", in_one_hour());
        assert!(matches!(
            validate_jwt(&jwt, "other"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let exp = chrono::Utc::now().timestamp() - 3600;
        let jwt = token("s3cret", "someone", exp);
        assert!(validate_jwt(&jwt, "s3cret").is_err());
    }
}
