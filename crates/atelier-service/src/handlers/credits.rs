//! Credit query and deduction handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{CreditInfo, CreditTransaction, UserId};

use crate::auth::{AuthUser, ServiceAuth};
use crate::credits::DeductionResult;
use crate::error::ApiError;
use crate::state::AppState;

/// Default page size for history.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest page size for history.
const MAX_HISTORY_LIMIT: usize = 100;

/// Credit check request.
#[derive(Debug, Deserialize)]
pub struct CheckCreditsRequest {
    /// User to check.
    pub user_id: UserId,
    /// Credits the feature is about to spend.
    pub required_credits: i64,
}

/// Credit check response.
#[derive(Debug, Serialize)]
pub struct CheckCreditsResponse {
    /// Whether the user can afford it right now.
    pub has_enough: bool,
}

/// Deduction request.
#[derive(Debug, Deserialize)]
pub struct DeductCreditsRequest {
    /// User to charge.
    pub user_id: UserId,
    /// Credits to spend.
    pub amount: i64,
    /// Feature the credits were spent on.
    #[serde(default)]
    pub feature: Option<String>,
}

/// History query parameters.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Page size.
    pub limit: Option<usize>,
    /// Entries to skip.
    pub offset: Option<usize>,
}

/// A history entry as returned by the API.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Entry ID.
    pub id: String,
    /// Signed credit change.
    pub amount: i64,
    /// Entry kind.
    pub kind: String,
    /// Balance after the change.
    pub available_after: i64,
    /// Description.
    pub description: String,
    /// Extra context.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransaction> for TransactionResponse {
    fn from(tx: CreditTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            amount: tx.amount,
            kind: tx.kind.as_str().to_string(),
            available_after: tx.available_after,
            description: tx.description,
            metadata: tx.metadata,
            created_at: tx.created_at,
        }
    }
}

/// History response.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    /// Entries, newest first.
    pub transactions: Vec<TransactionResponse>,
    /// Whether more entries may exist.
    pub has_more: bool,
}

/// Credit info for any user (service key).
pub async fn get_user_credits(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<CreditInfo>, ApiError> {
    let user_id = user_id
        .parse::<UserId>()
        .map_err(|_| ApiError::BadRequest("Invalid user id".into()))?;

    credit_info(&state, &user_id).await.map(Json)
}

/// Credit info for the calling user.
pub async fn get_my_credits(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<CreditInfo>, ApiError> {
    credit_info(&state, &auth.user_id).await.map(Json)
}

/// Whether a user can afford an operation.
pub async fn check_credits(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(body): Json<CheckCreditsRequest>,
) -> Result<Json<CheckCreditsResponse>, ApiError> {
    let has_enough = state
        .credits
        .has_enough_credits(&body.user_id, body.required_credits)
        .await?;

    Ok(Json(CheckCreditsResponse { has_enough }))
}

/// Spend credits. Refusals are returned as `success: false` with 200.
pub async fn deduct_credits(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<DeductCreditsRequest>,
) -> Result<Json<DeductionResult>, ApiError> {
    tracing::debug!(
        user_id = %body.user_id,
        amount = body.amount,
        service = %auth.service_name,
        "Deduction requested"
    );

    let result = state
        .credits
        .deduct_credits(&body.user_id, body.amount, body.feature.as_deref())
        .await?;

    Ok(Json(result))
}

/// Credit history for the calling user.
pub async fn get_my_history(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let transactions = state
        .credits
        .history(&auth.user_id, limit, offset)
        .await?;
    let has_more = transactions.len() == limit;

    Ok(Json(HistoryResponse {
        transactions: transactions.into_iter().map(Into::into).collect(),
        has_more,
    }))
}

async fn credit_info(state: &AppState, user_id: &UserId) -> Result<CreditInfo, ApiError> {
    state
        .credits
        .get_credit_info(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("credit account not found: {user_id}")))
}
