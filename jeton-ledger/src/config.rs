//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Emit JSON logs
    pub json_logs: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Unit-of-work configuration
    pub transactions: TransactionConfig,

    /// Conflict retry configuration
    pub retry: RetryConfig,

    /// Tombola configuration
    pub tombola: TombolaConfig,

    /// Stand configuration
    pub stands: StandConfig,

    /// Notification configuration
    pub notifications: NotificationConfig,

    /// Token payment configuration
    pub payments: PaymentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/jetons"),
            service_name: "jeton-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            json_logs: false,
            rocksdb: RocksDBConfig::default(),
            transactions: TransactionConfig::default(),
            retry: RetryConfig::default(),
            tombola: TombolaConfig::default(),
            stands: StandConfig::default(),
            notifications: NotificationConfig::default(),
            payments: PaymentConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Unit-of-work configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Max wait for a row lock (milliseconds)
    pub lock_timeout_ms: i64,

    /// Unit of work expiration, commit fails afterwards (milliseconds)
    pub unit_of_work_timeout_ms: i64,

    /// Enable deadlock detection
    pub deadlock_detect: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1_000,
            unit_of_work_timeout_ms: 5_000,
            deadlock_detect: true,
        }
    }
}

/// Retry configuration for concurrency conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, first one included
    pub max_attempts: u32,

    /// First backoff delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 500,
        }
    }
}

/// Tombola configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TombolaConfig {
    /// Fixed ticket price in tokens
    pub ticket_price_tokens: i64,
}

impl Default for TombolaConfig {
    fn default() -> Self {
        Self {
            ticket_price_tokens: 2,
        }
    }
}

/// Which stock line a purchase draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockSelection {
    /// Always the stand's first stock line
    FirstLine,
    /// The line named in the request, first line when none is named
    ByProduct,
}

/// Stand configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandConfig {
    /// Loyalty points per unit bought at an activity stand
    pub points_per_activity_unit: i64,

    /// Stock line selection policy
    pub stock_selection: StockSelection,
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            points_per_activity_unit: 10,
            stock_selection: StockSelection::FirstLine,
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Deliver notifications after commits
    pub enabled: bool,

    /// Per-connection buffer, notifications are dropped when full
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 64,
        }
    }
}

/// Token payment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Currency charged by the provider
    pub currency: String,

    /// Lifetime of an unconfirmed token order (seconds)
    pub order_ttl_secs: u64,

    /// Interval between expiry sweeps in the server (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            currency: "eur".to_string(),
            order_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
        }
    }
}

/// Longest accepted order lifetime
const MAX_ORDER_TTL_SECS: u64 = 30 * 24 * 60 * 60;

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("JETON_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("JETON_JSON_LOGS") {
            config.json_logs = parse_env("JETON_JSON_LOGS", &value)?;
        }

        if let Ok(value) = std::env::var("JETON_LOCK_TIMEOUT_MS") {
            config.transactions.lock_timeout_ms = parse_env("JETON_LOCK_TIMEOUT_MS", &value)?;
        }

        if let Ok(value) = std::env::var("JETON_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env("JETON_RETRY_MAX_ATTEMPTS", &value)?;
        }

        if let Ok(value) = std::env::var("JETON_TICKET_PRICE") {
            config.tombola.ticket_price_tokens = parse_env("JETON_TICKET_PRICE", &value)?;
        }

        if let Ok(currency) = std::env::var("JETON_PAYMENT_CURRENCY") {
            config.payments.currency = currency;
        }

        if let Ok(value) = std::env::var("JETON_ORDER_TTL_SECS") {
            config.payments.order_ttl_secs = parse_env("JETON_ORDER_TTL_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("JETON_STOCK_SELECTION") {
            config.stands.stock_selection = match value.as_str() {
                "first_line" => StockSelection::FirstLine,
                "by_product" => StockSelection::ByProduct,
                other => {
                    return Err(crate::Error::Config(format!(
                        "JETON_STOCK_SELECTION: unknown policy {}",
                        other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.tombola.ticket_price_tokens <= 0 {
            return Err(crate::Error::Config(
                "tombola.ticket_price_tokens must be positive".to_string(),
            ));
        }
        if self.stands.points_per_activity_unit < 0 {
            return Err(crate::Error::Config(
                "stands.points_per_activity_unit must not be negative".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.transactions.lock_timeout_ms <= 0 || self.transactions.unit_of_work_timeout_ms <= 0 {
            return Err(crate::Error::Config(
                "transaction timeouts must be positive".to_string(),
            ));
        }
        if self.payments.currency.trim().is_empty() {
            return Err(crate::Error::Config("payments.currency is required".to_string()));
        }
        if self.payments.order_ttl_secs == 0 || self.payments.order_ttl_secs > MAX_ORDER_TTL_SECS {
            return Err(crate::Error::Config(format!(
                "payments.order_ttl_secs must be between 1 and {}",
                MAX_ORDER_TTL_SECS
            )));
        }
        if self.payments.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "payments.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{}: invalid value {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "jeton-ledger");
        assert_eq!(config.tombola.ticket_price_tokens, 2);
        assert_eq!(config.stands.points_per_activity_unit, 10);
        assert_eq!(config.stands.stock_selection, StockSelection::FirstLine);
        assert_eq!(config.payments.order_ttl_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/jetons"

            [stands]
            stock_selection = "by_product"

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/jetons"));
        assert_eq!(config.stands.stock_selection, StockSelection::ByProduct);
        assert_eq!(config.stands.points_per_activity_unit, 10);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.tombola.ticket_price_tokens, 2);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "[tombola]\nticket_price_tokens = 3\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.tombola.ticket_price_tokens, 3);
    }

    #[test]
    fn test_validate_rejects_free_tickets() {
        let mut config = Config::default();
        config.tombola.ticket_price_tokens = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validate_bounds_order_ttl() {
        let mut config = Config::default();
        config.payments.order_ttl_secs = 0;
        assert!(config.validate().is_err());

        config.payments.order_ttl_secs = MAX_ORDER_TTL_SECS + 1;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }
}
