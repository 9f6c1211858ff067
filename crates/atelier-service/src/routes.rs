//! Router configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, credits, health, reset, webhooks};
use crate::state::AppState;

/// Maximum concurrent requests for credit endpoints.
/// Deductions arrive on every generation, so this is the busy path.
const CREDITS_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for other API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/billing` - Billing provider subscription events
///
/// ## Jobs (optional reset secret)
/// - `POST /jobs/reset-credits` - Run the monthly credit reset
///
/// ## Service API key
/// - `POST /v1/accounts` - Register a user and grant the signup bonus
/// - `GET /v1/credits/:user_id` - Credit info for a user
/// - `POST /v1/credits/check` - Check whether a user can afford an operation
/// - `POST /v1/credits/deduct` - Spend credits
///
/// ## User JWT
/// - `GET /v1/credits/me` - Own credit info
/// - `GET /v1/credits/me/history` - Own credit history
pub fn create_router(state: AppState) -> Router {
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let credit_routes = Router::new()
        .route("/me", get(credits::get_my_credits))
        .route("/me/history", get(credits::get_my_history))
        .route("/check", post(credits::check_credits))
        .route("/deduct", post(credits::deduct_credits))
        .route("/:user_id", get(credits::get_user_credits))
        .layer(ConcurrencyLimitLayer::new(CREDITS_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        .route("/accounts", post(accounts::register_account))
        .nest("/credits", credit_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        // Webhooks and jobs are driven by the provider and the scheduler
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .route("/jobs/reset-credits", post(reset::reset_credits))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
