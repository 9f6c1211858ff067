//! Atelier credits HTTP service.
//!
//! This crate runs the credit engine behind an HTTP API:
//!
//! - Credit queries and atomic deductions for feature code
//! - Billing webhook ingestion (plan resolution, allocation, idempotency)
//! - The monthly credit reset job and its in-process scheduler
//! - Best-effort user notifications through a pluggable [`Notifier`]
//!
//! # Authentication
//!
//! 1. **Service API keys** (`x-api-key`) - feature code and account registration
//! 2. **Session JWTs** (HS256) - end users reading their own credits
//! 3. **Webhook signatures** (`x-signature`, HMAC-SHA256 of the body)
//! 4. **Reset secret** (`x-reset-secret`) - the external cron trigger

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for axum

pub mod auth;
pub mod config;
pub mod credits;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod notifier;
pub mod reset;
pub mod routes;
pub mod state;
pub mod subscriptions;

pub use config::ServiceConfig;
pub use credits::{CreditService, DeductionResult};
pub use error::ApiError;
pub use notifier::{HttpNotifier, LogNotifier, Notification, Notifier, NotifyError};
pub use reset::{run_monthly_reset, spawn_reset_scheduler, ResetSummary};
pub use routes::create_router;
pub use state::AppState;
