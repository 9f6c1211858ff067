//! Account registration handler.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use atelier_core::{CreditAccount, CreditInfo, UserId, UserRecord};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Register account request.
#[derive(Debug, Deserialize)]
pub struct RegisterAccountRequest {
    /// The new user's id from the auth provider.
    pub user_id: UserId,
    /// The user's email, used to match billing webhooks.
    pub email: String,
}

/// Register account response.
#[derive(Debug, Serialize)]
pub struct RegisterAccountResponse {
    /// User ID.
    pub user_id: String,
    /// Registered email.
    pub email: String,
    /// Whether a new ledger row was created.
    pub created: bool,
    /// Whether this call granted the signup bonus.
    pub signup_bonus_granted: bool,
    /// Current credit numbers.
    pub credits: CreditInfo,
}

/// Register a user: directory entry, ledger row and signup bonus.
///
/// Safe to call again for the same user; nothing is granted twice.
pub async fn register_account(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<RegisterAccountRequest>,
) -> Result<Json<RegisterAccountResponse>, ApiError> {
    let email = body.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest("A valid email is required".into()));
    }

    let now = Utc::now();
    let user_id = body.user_id;

    let created_at = state
        .store
        .get_user(&user_id)
        .await?
        .map_or(now, |existing| existing.created_at);
    state
        .store
        .put_user(&UserRecord {
            user_id,
            email: email.to_string(),
            created_at,
        })
        .await?;

    let created = state
        .store
        .create_account(&CreditAccount::new(user_id, now))
        .await?;
    let bonus = state.credits.grant_signup_bonus(&user_id).await?;
    let signup_bonus_granted = bonus.is_some();

    let credits = match bonus {
        Some(account) => account.info(),
        None => state
            .credits
            .get_credit_info(&user_id)
            .await?
            .ok_or_else(|| ApiError::Internal(format!("ledger row missing for {user_id}")))?,
    };

    tracing::info!(
        user_id = %user_id,
        service = %auth.service_name,
        created = created,
        signup_bonus_granted = signup_bonus_granted,
        "Account registered"
    );

    Ok(Json(RegisterAccountResponse {
        user_id: user_id.to_string(),
        email: email.to_string(),
        created,
        signup_bonus_granted,
        credits,
    }))
}
