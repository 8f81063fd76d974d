use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Application configuration with validation.
///
/// Values are layered: `config/default.toml`, then `config/{environment}.toml`,
/// then `APP_*` environment variables, each overriding the previous.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// ISO currency code quoted to the payment gateway
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Default tax rate (as decimal, e.g., 0.08 for 8%)
    #[serde(default = "default_tax_rate")]
    pub default_tax_rate: f64,

    /// Flat shipping fee applied below the free-shipping threshold
    #[serde(default = "default_shipping_flat_rate")]
    pub shipping_flat_rate: f64,

    /// Subtotal at or above which shipping is waived
    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: f64,

    /// Age after which a held cart lock is considered abandoned
    #[serde(default = "default_cart_lock_staleness_secs")]
    pub cart_lock_staleness_secs: u64,

    /// Maximum quantity per cart line
    #[serde(default = "default_cart_line_quantity_cap")]
    #[validate(range(min = 1))]
    pub cart_line_quantity_cap: i32,

    /// Shared secret used to verify payment confirmation signatures
    #[validate(length(min = 16))]
    pub payment_signature_secret: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
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
fn default_currency() -> String {
    "USD".to_string()
}
fn default_tax_rate() -> f64 {
    0.08
}
fn default_shipping_flat_rate() -> f64 {
    10.0
}
fn default_free_shipping_threshold() -> f64 {
    50.0
}
fn default_cart_lock_staleness_secs() -> u64 {
    300
}
fn default_cart_line_quantity_cap() -> i32 {
    10
}

impl AppConfig {
    /// Loads configuration from files and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder();

        let default_path = Path::new(CONFIG_DIR).join("default.toml");
        if default_path.exists() {
            builder = builder.add_source(File::from(default_path));
        }
        let env_path = Path::new(CONFIG_DIR).join(format!("{environment}.toml"));
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        }

        let config: AppConfig = builder
            .add_source(Environment::with_prefix("APP"))
            .build()?
            .try_deserialize()?;

        config
            .validate()
            .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

        Ok(config)
    }

    /// Minimal constructor used by tests and tooling.
    pub fn for_testing(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            host: default_host(),
            port: default_port(),
            environment: "test".to_string(),
            log_level: default_log_level(),
            db_max_connections: 1,
            db_min_connections: 1,
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            currency: default_currency(),
            default_tax_rate: default_tax_rate(),
            shipping_flat_rate: default_shipping_flat_rate(),
            free_shipping_threshold: default_free_shipping_threshold(),
            cart_lock_staleness_secs: default_cart_lock_staleness_secs(),
            cart_line_quantity_cap: default_cart_line_quantity_cap(),
            payment_signature_secret: "test_signature_secret_32_characters".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::for_testing("sqlite::memory:");
        assert_eq!(cfg.cart_lock_staleness_secs, 300);
        assert_eq!(cfg.cart_line_quantity_cap, 10);
        assert_eq!(cfg.currency, "USD");
        assert!(cfg.default_tax_rate > 0.0);
    }

    #[test]
    fn test_validation_rejects_short_secret() {
        let mut cfg = AppConfig::for_testing("sqlite::memory:");
        cfg.payment_signature_secret = "short".to_string();
        assert!(cfg.validate().is_err());
    }
}
