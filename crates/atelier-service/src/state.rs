//! Application state.

use std::sync::Arc;

use atelier_store::Store;

use crate::config::ServiceConfig;
use crate::credits::CreditService;
use crate::notifier::{HttpNotifier, LogNotifier, Notifier};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The ledger store.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Outbound notification port.
    pub notifier: Arc<dyn Notifier>,

    /// Credit queries and deductions.
    pub credits: CreditService,
}

impl AppState {
    /// Create a new application state.
    ///
    /// Notifications go to the configured email service, or to the log when
    /// none is configured.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let notifier: Arc<dyn Notifier> = match config.notifier_url.as_ref() {
            Some(url) => match HttpNotifier::new(url, config.notifier_api_key.clone()) {
                Ok(notifier) => {
                    tracing::info!(notifier_url = %url, "Email notifications enabled");
                    Arc::new(notifier)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create email notifier");
                    Arc::new(LogNotifier)
                }
            },
            None => {
                tracing::warn!("Email service not configured - notifications will only be logged");
                Arc::new(LogNotifier)
            }
        };

        Self::with_notifier(store, config, notifier)
    }

    /// Create application state with an explicit notifier.
    #[must_use]
    pub fn with_notifier(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        if let Err(e) = config.variants.validate() {
            tracing::warn!(error = %e, "Billing webhooks will be rejected until variants are configured");
        }

        let credits = CreditService::new(store.clone(), notifier.clone());

        Self {
            store,
            config,
            notifier,
            credits,
        }
    }
}
