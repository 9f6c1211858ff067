//! Monthly reset job trigger.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::auth::ResetAuth;
use crate::error::ApiError;
use crate::reset::run_monthly_reset;
use crate::state::AppState;

/// Reset job response.
#[derive(Debug, Serialize)]
pub struct ResetResponse {
    /// Human-readable summary.
    pub message: String,
    /// Accounts reset.
    pub reset: usize,
    /// Accounts that were due.
    pub total: usize,
    /// Per-account failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Run the monthly reset now.
///
/// Per-account failures still return 200 with a non-empty `errors` list.
pub async fn reset_credits(
    State(state): State<Arc<AppState>>,
    _auth: ResetAuth,
) -> Result<Json<ResetResponse>, ApiError> {
    let summary = run_monthly_reset(&state, Utc::now()).await?;

    Ok(Json(ResetResponse {
        message: format!(
            "Reset credits for {} of {} accounts",
            summary.reset_count, summary.total_candidates
        ),
        reset: summary.reset_count,
        total: summary.total_candidates,
        errors: summary.errors,
    }))
}
