//! Outbound user notifications.
//!
//! Ledger changes never wait on email. Callers hand a [`Notification`] to
//! [`spawn_notification`], which looks up the recipient in the user
//! directory and delivers through the configured [`Notifier`] on a
//! background task, retrying transient failures a few times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;

use atelier_core::{BillingPeriod, PlanTier, UserId};
use atelier_store::Store;

/// Maximum number of delivery attempts.
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay in milliseconds.
const MAX_BACKOFF_MS: u64 = 5000;

/// Timeout for a single delivery request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A message for a user about their credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A payment allocated a new credit period.
    PaymentConfirmation {
        /// Plan that was paid for.
        plan_tier: PlanTier,
        /// Billing cadence of the plan.
        billing_period: BillingPeriod,
        /// Credits in the new period.
        total_credits: i64,
        /// Credits carried over from the previous period.
        carried_over: i64,
    },
    /// The scheduled monthly reset refreshed the balance.
    MonthlyReset {
        /// Current plan.
        plan_tier: PlanTier,
        /// Credits in the new period.
        total_credits: i64,
        /// When the next reset is due.
        next_reset_at: DateTime<Utc>,
    },
    /// The balance just dropped below the low-credit threshold.
    LowCredits {
        /// Credits left.
        remaining_credits: i64,
    },
}

impl Notification {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PaymentConfirmation { .. } => "payment_confirmation",
            Self::MonthlyReset { .. } => "monthly_reset",
            Self::LowCredits { .. } => "low_credits",
        }
    }
}

/// Error type for notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The email service rejected the request.
    #[error("email service error: {status} - {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Delivery port for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification to `recipient` (an email address).
    async fn send(&self, recipient: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to an email service.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    notification: &'a Notification,
}

impl HttpNotifier {
    /// Create a notifier posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, recipient: &str, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(&SendRequest {
            to: recipient,
            notification,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %recipient,
            kind = notification.kind(),
            notification = ?notification,
            "Notification (not delivered, no email service configured)"
        );
        Ok(())
    }
}

/// Notify a user in the background.
///
/// The returned handle may be dropped; the caller never needs to await it.
pub fn spawn_notification(
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    user_id: UserId,
    notification: Notification,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let recipient = match store.get_user(&user_id).await {
            Ok(Some(user)) => user.email,
            Ok(None) => {
                tracing::warn!(
                    user_id = %user_id,
                    kind = notification.kind(),
                    "No user record, skipping notification"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to look up notification recipient"
                );
                return;
            }
        };

        if let Err(e) = send_with_retry(notifier.as_ref(), &recipient, &notification).await {
            tracing::error!(
                user_id = %user_id,
                kind = notification.kind(),
                error = %e,
                "Failed to deliver notification after all retries"
            );
        }
    })
}

/// Deliver with exponential backoff.
async fn send_with_retry(
    notifier: &dyn Notifier,
    recipient: &str,
    notification: &Notification,
) -> Result<(), NotifyError> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match notifier.send(recipient, notification).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;

                if attempt >= MAX_RETRIES {
                    tracing::warn!(
                        kind = notification.kind(),
                        attempt = %attempt,
                        error = %e,
                        "Notification failed after max retries"
                    );
                    return Err(e);
                }

                tracing::debug!(
                    kind = notification.kind(),
                    attempt = %attempt,
                    backoff_ms = %backoff_ms,
                    error = %e,
                    "Notification failed, retrying"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyNotifier {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, _: &str, _: &Notification) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(NotifyError::Api {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let notifier = FlakyNotifier {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let notification = Notification::LowCredits {
            remaining_credits: 19,
        };

        send_with_retry(&notifier, "a@example.com", &notification)
            .await
            .unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let notifier = FlakyNotifier {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let notification = Notification::LowCredits {
            remaining_credits: 5,
        };

        let result = send_with_retry(&notifier, "a@example.com", &notification).await;
        assert!(result.is_err());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), MAX_RETRIES);
    }

    #[test]
    fn notifications_serialize_with_type_tag() {
        let json = serde_json::to_value(Notification::PaymentConfirmation {
            plan_tier: PlanTier::Pro,
            billing_period: BillingPeriod::Annual,
            total_credits: 370,
            carried_over: 10,
        })
        .unwrap();

        assert_eq!(json["type"], "payment_confirmation");
        assert_eq!(json["plan_tier"], "pro");
        assert_eq!(json["billing_period"], "annual");
        assert_eq!(json["total_credits"], 370);
    }
}
