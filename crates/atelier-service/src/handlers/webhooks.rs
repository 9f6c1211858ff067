//! Billing provider webhook handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::state::AppState;
use crate::subscriptions::{process_event, WebhookPayload};

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Always true once the body was understood.
    pub received: bool,
    /// `accepted`, `ignored` or `duplicate`.
    pub status: &'static str,
}

/// Handle billing provider webhooks.
pub async fn billing_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(secret) = &state.config.webhook_secret {
        let signature = headers
            .get("x-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::warn!("Billing webhook without signature");
                ApiError::Unauthorized
            })?;

        if !verify_signature(secret, body.as_bytes(), signature) {
            tracing::warn!("Invalid billing webhook signature");
            return Err(ApiError::Unauthorized);
        }
    } else {
        // No webhook_secret configured - skip verification (development mode)
        tracing::warn!("Billing webhook secret not configured - skipping signature verification");
    }

    let payload: WebhookPayload =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let event_name = headers
        .get("x-event-name")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| payload.meta.as_ref().and_then(|m| m.event_name.clone()))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing event name".into()))?;

    tracing::info!(event_name = %event_name, "Received billing webhook");

    let outcome = process_event(&state, &event_name, &payload, Utc::now()).await?;

    Ok(Json(WebhookResponse {
        received: true,
        status: outcome.as_str(),
    }))
}
