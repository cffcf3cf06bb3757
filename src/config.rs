use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "GBP";
const DEFAULT_DESTINATION_COUNTRY: &str = "GB";
const DEFAULT_QUEUE_PUBLISH_DELAY_SECS: u64 = 10;
const DEFAULT_QUEUE_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUEUE_MAX_DELIVERIES: u32 = 5;
const DEFAULT_CONSUMER_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_RECONCILIATION_INTERVAL_SECS: u64 = 300;
const DEFAULT_RECONCILIATION_STALE_AFTER_SECS: u64 = 900;

/// Outbound HTTP resilience settings shared by the quote, payment, and
/// fulfillment clients.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum attempts per call (first try + retries)
    #[serde(default = "default_retry_max_attempts")]
    #[validate(custom = "validate_max_attempts")]
    pub retry_max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Cooldown window (seconds) before a half-open probe is allowed
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Successful half-open probes required to close the circuit again
    #[serde(default = "default_breaker_success_threshold")]
    pub breaker_success_threshold: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            breaker_success_threshold: default_breaker_success_threshold(),
        }
    }
}

/// Application configuration, constructed once at startup and passed by
/// injection into every component. Business logic never reads ambient state.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Storefront currency (single-currency pathway)
    #[serde(default = "default_currency")]
    pub currency_code: String,

    /// Destination country used for quote requests
    #[serde(default = "default_destination_country")]
    pub destination_country_code: String,

    /// Quote API base URI (trailing slash included), e.g. "https://api.example.com/v1/"
    pub quote_api_uri: String,

    /// Quote API key sent as X-API-Key
    pub quote_api_key: String,

    /// Payment provider base URI
    pub payment_api_uri: String,

    /// Payment provider secret key
    pub payment_api_key: String,

    /// Shared secret for verifying inbound payment webhooks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Hosted checkout redirect targets
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,

    /// Comma-separated ISO country codes allowed at checkout
    #[serde(default = "default_checkout_allowed_countries")]
    pub checkout_allowed_countries: String,

    /// Fulfillment provider base URI (trailing slash included)
    pub fulfillment_api_uri: String,

    /// Fulfillment provider API key sent as X-API-Key
    pub fulfillment_api_key: String,

    /// Base URI the fulfillment provider calls back on,
    /// e.g. "https://orders.example.com"
    pub fulfillment_callback_base_uri: String,

    /// Delay before a published order-approved message becomes visible,
    /// letting the producing write settle
    #[serde(default = "default_queue_publish_delay_secs")]
    pub queue_publish_delay_secs: u64,

    /// Redelivery window for received-but-uncompleted messages
    #[serde(default = "default_queue_visibility_timeout_secs")]
    pub queue_visibility_timeout_secs: u64,

    /// Deliveries before a message is dead-lettered
    #[serde(default = "default_queue_max_deliveries")]
    pub queue_max_deliveries: u32,

    /// Consumer idle poll interval (seconds)
    #[serde(default = "default_consumer_poll_interval_secs")]
    pub consumer_poll_interval_secs: u64,

    /// Re-emit approved events for stuck in-progress orders
    #[serde(default = "default_true_bool")]
    pub reconciliation_enabled: bool,

    /// Sweep interval (seconds)
    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,

    /// Age before an in-progress order with no fulfillment response is
    /// considered stuck (seconds)
    #[serde(default = "default_reconciliation_stale_after_secs")]
    pub reconciliation_stale_after_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Outbound HTTP resilience settings
    #[serde(default)]
    #[validate]
    pub http: HttpClientConfig,
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Allowed checkout countries as a trimmed list.
    pub fn allowed_countries(&self) -> Vec<String> {
        self.checkout_allowed_countries
            .split(',')
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_destination_country() -> String {
    DEFAULT_DESTINATION_COUNTRY.to_string()
}
fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}
fn default_checkout_allowed_countries() -> String {
    "GB".to_string()
}
fn default_queue_publish_delay_secs() -> u64 {
    DEFAULT_QUEUE_PUBLISH_DELAY_SECS
}
fn default_queue_visibility_timeout_secs() -> u64 {
    DEFAULT_QUEUE_VISIBILITY_TIMEOUT_SECS
}
fn default_queue_max_deliveries() -> u32 {
    DEFAULT_QUEUE_MAX_DELIVERIES
}
fn default_consumer_poll_interval_secs() -> u64 {
    DEFAULT_CONSUMER_POLL_INTERVAL_SECS
}
fn default_reconciliation_interval_secs() -> u64 {
    DEFAULT_RECONCILIATION_INTERVAL_SECS
}
fn default_reconciliation_stale_after_secs() -> u64 {
    DEFAULT_RECONCILIATION_STALE_AFTER_SECS
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_true_bool() -> bool {
    true
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_initial_delay_ms() -> u64 {
    200
}
fn default_retry_max_delay_ms() -> u64 {
    5_000
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    60
}
fn default_breaker_success_threshold() -> u32 {
    2
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_max_attempts(attempts: u32) -> Result<(), ValidationError> {
    if attempts == 0 {
        let mut err = ValidationError::new("retry_max_attempts");
        err.message = Some("retry_max_attempts must be at least 1".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("printworks_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://printworks.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    Ok(app_config)
}
