//! Configuration management for the stockroom backend
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (development.toml, production.toml)
//! 3. Environment variable overrides with STOCKROOM_ prefix

use config::{ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use shared::{AlertThresholds, RetentionPolicy};
use uuid::Uuid;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Current environment (development, production)
    pub environment: String,

    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Stock alert thresholds and watcher
    pub alerts: AlertsConfig,

    /// Outbound alert notifications
    pub notifications: NotificationsConfig,

    /// Archive and purge job
    pub archival: ArchivalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server port
    pub port: u16,

    /// Server host
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL, or `memory:` for the in-process store
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertsConfig {
    pub min_stock: Decimal,
    pub min_coverage_days: u32,
    pub lookback_days: u32,

    /// Products checked by the background watcher
    #[serde(default)]
    pub watch_products: Vec<Uuid>,

    pub check_interval_secs: u64,
}

impl AlertsConfig {
    pub fn thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            min_stock: self.min_stock,
            min_coverage_days: self.min_coverage_days,
            lookback_days: self.lookback_days,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    /// Incoming webhook URL; notifications are disabled when unset
    pub webhook_url: Option<String>,

    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchivalConfig {
    pub batch_size: u32,

    /// Name of the maintenance lease row
    pub lease_name: String,

    pub lease_ttl_secs: i64,

    /// Cap on residual-children passes before batches are left for the next run
    pub max_child_passes: u32,

    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    pub reservation_days: u32,
    pub movement_days: u32,
    pub serial_days: u32,
    pub batch_days: u32,
    pub audit_log_days: u32,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(r: &RetentionConfig) -> Self {
        RetentionPolicy {
            reservation_days: r.reservation_days,
            movement_days: r.movement_days,
            serial_days: r.serial_days,
            batch_days: r.batch_days,
            audit_log_days: r.audit_log_days,
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("STOCKROOM_ENVIRONMENT").unwrap_or_else(|_| "development".into());
        let retention = RetentionPolicy::default();

        let config = config::Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("database.url", "memory:")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("alerts.min_stock", "10")?
            .set_default("alerts.min_coverage_days", 7)?
            .set_default("alerts.lookback_days", 30)?
            .set_default("alerts.watch_products", Vec::<String>::new())?
            .set_default("alerts.check_interval_secs", 900)?
            .set_default("notifications.timeout_secs", 10)?
            .set_default("archival.batch_size", 100)?
            .set_default("archival.lease_name", "archive_and_purge")?
            .set_default("archival.lease_ttl_secs", 3600)?
            .set_default("archival.max_child_passes", 3)?
            .set_default("archival.retention.reservation_days", retention.reservation_days)?
            .set_default("archival.retention.movement_days", retention.movement_days)?
            .set_default("archival.retention.serial_days", retention.serial_days)?
            .set_default("archival.retention.batch_days", retention.batch_days)?
            .set_default("archival.retention.audit_log_days", retention.audit_log_days)?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (STOCKROOM_ prefix)
            .add_source(
                Environment::with_prefix("STOCKROOM")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("alerts.watch_products")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
