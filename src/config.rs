use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "UAH";
const DEFAULT_GATEWAY_CHECKOUT_URL: &str = "https://www.liqpay.ua/api/3/checkout";
const DEFAULT_PROMOTION_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port (1024-65535)
    #[serde(default = "default_port")]
    #[validate(range(min = 1024))]
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
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// CORS: comma-separated list of allowed origins; permissive when unset in development
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Secret used to verify bearer tokens issued by the session service
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Payment gateway public key
    #[serde(default)]
    pub gateway_public_key: Option<String>,

    /// Payment gateway private key, used for request and callback signatures
    #[serde(default)]
    pub gateway_private_key: Option<String>,

    /// Gateway checkout page the customer is redirected to
    #[serde(default = "default_gateway_checkout_url")]
    #[validate(custom = "validate_http_url")]
    pub gateway_checkout_url: String,

    /// Public base URL of this service, used for gateway result/server URLs
    #[validate(custom = "validate_http_url")]
    pub public_base_url: String,

    /// Currency code sent to the gateway
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Courier delivery is free from this subtotal upwards
    #[serde(default = "default_courier_free_delivery_threshold")]
    #[validate(custom = "validate_non_negative")]
    pub courier_free_delivery_threshold: Decimal,

    /// Courier delivery fee below the free threshold
    #[serde(default = "default_courier_delivery_fee")]
    #[validate(custom = "validate_non_negative")]
    pub courier_delivery_fee: Decimal,

    /// Interval between promotion expiry sweeps
    #[serde(default = "default_promotion_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub promotion_sweep_interval_secs: u64,

    /// Whether admins may move an order out of `Cancelled`
    #[serde(default)]
    pub allow_reopen_cancelled_orders: bool,
}

/// Credentials for the redirect-based card gateway
#[derive(Clone, Debug)]
pub struct GatewayCredentials {
    pub public_key: String,
    pub private_key: String,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything except the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        public_base_url: String,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            cors_allowed_origins: None,
            jwt_secret,
            gateway_public_key: None,
            gateway_private_key: None,
            gateway_checkout_url: default_gateway_checkout_url(),
            public_base_url,
            currency: default_currency(),
            courier_free_delivery_threshold: default_courier_free_delivery_threshold(),
            courier_delivery_fee: default_courier_delivery_fee(),
            promotion_sweep_interval_secs: default_promotion_sweep_interval_secs(),
            allow_reopen_cancelled_orders: false,
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gateway keys, present only when both are configured and non-blank
    pub fn gateway_credentials(&self) -> Option<GatewayCredentials> {
        match (&self.gateway_public_key, &self.gateway_private_key) {
            (Some(public_key), Some(private_key))
                if !public_key.trim().is_empty() && !private_key.trim().is_empty() =>
            {
                Some(GatewayCredentials {
                    public_key: public_key.trim().to_string(),
                    private_key: private_key.trim().to_string(),
                })
            }
            _ => None,
        }
    }

    pub fn promotion_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.promotion_sweep_interval_secs)
    }

    /// Allowed CORS origins, empty when none are configured
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_gateway_checkout_url() -> String {
    DEFAULT_GATEWAY_CHECKOUT_URL.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_courier_free_delivery_threshold() -> Decimal {
    Decimal::from(1000)
}

fn default_courier_delivery_fee() -> Decimal {
    Decimal::from(100)
}

fn default_promotion_sweep_interval_secs() -> u64 {
    DEFAULT_PROMOTION_SWEEP_INTERVAL_SECS
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

fn validate_http_url(value: &str) -> Result<(), ValidationError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => {
            let mut err = ValidationError::new("url");
            err.message = Some("Must be an absolute http(s) URL".into());
            Err(err)
        }
    }
}

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("Must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let builder = fmt().with_env_filter(EnvFilter::new(filter_directive));
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing subscriber already initialized: {}", err);
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
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

    // NOTE: jwt_secret has no default - it MUST be provided via environment variable
    // or config file.
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("public_base_url", "http://localhost:8080")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (minimum 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    if app_config.gateway_credentials().is_none() {
        warn!("Payment gateway keys are not configured; online card payment is disabled");
    }

    info!("Configuration loaded successfully");
    Ok(app_config)
}
