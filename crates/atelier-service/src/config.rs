//! Service configuration.

use serde::Deserialize;
use std::path::Path;

use atelier_core::VariantConfig;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// `PostgreSQL` connection string. Takes precedence over `data_dir`.
    pub database_url: Option<String>,

    /// Path to the `RocksDB` data directory (default: "/data/atelier").
    pub data_dir: String,

    /// Service API key for feature code calling the credit endpoints.
    pub service_api_key: Option<String>,

    /// HS256 secret for end-user session tokens.
    pub jwt_secret: Option<String>,

    /// Shared secret for billing webhook signatures.
    pub webhook_secret: Option<String>,

    /// Shared secret required by the reset job endpoint, if set.
    pub reset_secret: Option<String>,

    /// Provider variant ids for each plan.
    pub variants: VariantConfig,

    /// Email service endpoint. Notifications are only logged when unset.
    pub notifier_url: Option<String>,

    /// Email service API key.
    pub notifier_api_key: Option<String>,

    /// Run the monthly reset in-process at start-up and every UTC midnight.
    pub reset_scheduler_enabled: bool,

    /// How many accounts the reset job processes at once.
    pub reset_concurrency: usize,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Age after which an unfinished webhook claim may be taken over by a
    /// redelivery.
    pub webhook_claim_stale_seconds: u64,
}

/// Secrets file structure.
#[derive(Debug, Default, Deserialize)]
struct BillingSecrets {
    #[serde(default)]
    service_api_key: Option<String>,
    #[serde(default)]
    jwt_secret: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    reset_secret: Option<String>,
    #[serde(default)]
    notifier_api_key: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and the secrets file.
    #[must_use]
    pub fn from_env() -> Self {
        let secrets = load_billing_secrets();
        let defaults = Self::default();

        Self {
            listen_addr: env_or("LISTEN_ADDR", defaults.listen_addr),
            database_url: secrets.database_url.or_else(|| env_opt("DATABASE_URL")),
            data_dir: env_or("DATA_DIR", defaults.data_dir),
            service_api_key: secrets
                .service_api_key
                .or_else(|| env_opt("SERVICE_API_KEY")),
            jwt_secret: secrets.jwt_secret.or_else(|| env_opt("JWT_SECRET")),
            webhook_secret: secrets
                .webhook_secret
                .or_else(|| env_opt("BILLING_WEBHOOK_SECRET")),
            reset_secret: secrets.reset_secret.or_else(|| env_opt("RESET_SECRET")),
            variants: VariantConfig {
                basic_monthly: env_or("VARIANT_BASIC_MONTHLY", String::new()),
                basic_annual: env_or("VARIANT_BASIC_ANNUAL", String::new()),
                pro_monthly: env_or("VARIANT_PRO_MONTHLY", String::new()),
                pro_annual: env_or("VARIANT_PRO_ANNUAL", String::new()),
                agency_monthly: env_or("VARIANT_AGENCY_MONTHLY", String::new()),
                agency_annual: env_or("VARIANT_AGENCY_ANNUAL", String::new()),
            },
            notifier_url: env_opt("NOTIFIER_URL"),
            notifier_api_key: secrets
                .notifier_api_key
                .or_else(|| env_opt("NOTIFIER_API_KEY")),
            reset_scheduler_enabled: env_parse("RESET_SCHEDULER_ENABLED")
                .unwrap_or(defaults.reset_scheduler_enabled),
            reset_concurrency: env_parse("RESET_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.reset_concurrency),
            cors_origins: env_or("CORS_ORIGINS", "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
            webhook_claim_stale_seconds: env_parse("WEBHOOK_CLAIM_STALE_SECONDS")
                .unwrap_or(defaults.webhook_claim_stale_seconds),
        }
    }

    /// Stale window for webhook claims.
    ///
    /// Never shorter than the request timeout, so a claim is not taken over
    /// while the request holding it may still be running.
    #[must_use]
    pub fn webhook_claim_stale_after(&self) -> chrono::Duration {
        let seconds = self
            .webhook_claim_stale_seconds
            .max(self.request_timeout_seconds);
        chrono::Duration::seconds(i64::from(u32::try_from(seconds).unwrap_or(u32::MAX)))
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: String) -> String {
    env_opt(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|value| value.parse().ok())
}

/// Load secrets from file, falling back to an empty set.
fn load_billing_secrets() -> BillingSecrets {
    let secret_paths = [
        ".secrets/billing.json",
        "atelier/.secrets/billing.json",
        "../.secrets/billing.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<BillingSecrets>(path) {
            tracing::info!(path = %path, "Loaded billing secrets from file");
            return secrets;
        }
    }

    tracing::debug!("Billing secrets file not found, using environment variables");
    BillingSecrets::default()
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: None,
            data_dir: "/data/atelier".into(),
            service_api_key: None,
            jwt_secret: None,
            webhook_secret: None,
            reset_secret: None,
            variants: VariantConfig::default(),
            notifier_url: None,
            notifier_api_key: None,
            reset_scheduler_enabled: false,
            reset_concurrency: 8,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            webhook_claim_stale_seconds: 300,
        }
    }
}
