use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://stock_ledger.db?mode=rwc";
/// Hard ceiling on items per bulk call; configuration may lower it, never raise it.
pub const MAX_BULK_ITEMS: usize = 100;

/// Tuning for the ledger, reservation and reconciliation services.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct InventorySettings {
    /// Maximum number of items accepted by a single bulk call
    #[validate(range(min = 1, max = 100))]
    pub bulk_max_items: usize,

    /// Threshold used by low-stock reports when the caller passes none
    pub default_low_stock_threshold: i32,

    /// TTL for cached read projections (status, low-stock pages)
    pub cache_ttl_secs: u64,

    /// Unpaid orders older than this are released by the expiry sweep
    #[validate(range(min = 1))]
    pub reservation_ttl_minutes: i64,

    /// Orders processed per sweep pass
    #[validate(range(min = 1, max = 10000))]
    pub sweep_batch_size: u64,

    /// TTL of the reconciliation lock
    #[validate(range(min = 1))]
    pub reconcile_lock_ttl_secs: u64,

    /// Bounded retry for acquiring the reconciliation lock
    pub lock_retry_attempts: u32,
    pub lock_retry_delay_ms: u64,

    /// Retry policy used by background callers on `ConcurrencyConflict`
    pub conflict_retry_attempts: u32,
    pub conflict_retry_base_delay_ms: u64,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            bulk_max_items: MAX_BULK_ITEMS,
            default_low_stock_threshold: 5,
            cache_ttl_secs: 30,
            reservation_ttl_minutes: 30,
            sweep_batch_size: 100,
            reconcile_lock_ttl_secs: 30,
            lock_retry_attempts: 5,
            lock_retry_delay_ms: 100,
            conflict_retry_attempts: 3,
            conflict_retry_base_delay_ms: 50,
        }
    }
}

impl InventorySettings {
    pub fn cache_ttl(&self) -> Option<Duration> {
        match self.cache_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reservation_ttl_minutes)
    }
}

/// Outbox poller configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct OutboxSettings {
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u64,
    #[validate(range(min = 1))]
    pub max_attempts: i32,
    pub base_backoff_secs: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            max_attempts: 8,
            base_backoff_secs: 2,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Redis connection URL; when absent the reconciliation lock is process-local
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Application environment
    #[validate(length(min = 1))]
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
    #[validate(range(min = 1))]
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

    #[serde(default)]
    #[validate]
    pub inventory: InventorySettings,

    #[serde(default)]
    #[validate]
    pub outbox: OutboxSettings,
}

impl AppConfig {
    /// Builds a configuration for the given database with every other field defaulted.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            redis_url: None,
            environment: DEFAULT_ENV.to_string(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            inventory: InventorySettings::default(),
            outbox: OutboxSettings::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
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

impl From<AppConfigError> for crate::errors::ServiceError {
    fn from(err: AppConfigError) -> Self {
        crate::errors::ServiceError::ConfigError(err.to_string())
    }
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
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

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

/// Installs the global tracing subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stock_ledger={},audit=info,sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads configuration in order of precedence (lowest first):
/// 1. Built-in defaults
/// 2. `config/default.*`
/// 3. `config/<RUN_ENV>.*`
/// 4. Environment variables (`APP__*`, nested keys separated by `__`)
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
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::for_database("sqlite::memory:");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.inventory.bulk_max_items, MAX_BULK_ITEMS);
        assert_eq!(cfg.inventory.cache_ttl(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.outbox.max_attempts, 8);
    }

    #[test]
    fn bulk_ceiling_cannot_be_raised() {
        let mut cfg = AppConfig::for_database("sqlite::memory:");
        cfg.inventory.bulk_max_items = 500;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.errors().contains_key("inventory"));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut cfg = AppConfig::for_database("sqlite::memory:");
        cfg.log_level = "loud".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_cache_ttl_disables_caching() {
        let settings = InventorySettings {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.cache_ttl(), None);
    }
}
