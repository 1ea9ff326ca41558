//! # Fiscal Queue Configuration
//!
//! Configuration for the worker pool, retry policies and shift automation.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     VENDFISC_DB_PATH=/var/lib/vendfisc/fiscal.db                       │
//! │     VENDFISC_WORKERS=8                                                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fiscald/fiscald.toml (Linux)                             │
//! │     ~/Library/Application Support/com.vendfisc.fiscald/fiscald.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # fiscald.toml
//! [database]
//! path = "/var/lib/vendfisc/fiscal.db"
//! max_connections = 8
//!
//! [worker]
//! pool_size = 4
//! poll_interval_ms = 500
//! provider_timeout_secs = 30
//!
//! [retry.receipts]
//! max_retries = 10
//! base_delay_ms = 5000
//! max_delay_secs = 900
//!
//! [shifts]
//! max_shift_hours = 24
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vendfisc_core::{OperationKind, DEFAULT_MAX_SHIFT_HOURS, MAX_RETRIES_LIMIT};
use vendfisc_db::DbConfig;

use crate::error::{QueueError, QueueResult};
use crate::retry::{RetryPolicies, RetryPolicy};

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("com", "vendfisc", "fiscald")
        .map(|dirs| dirs.data_dir().join("fiscal.db"))
        .unwrap_or_else(|| PathBuf::from("fiscal.db"))
}

fn default_max_connections() -> u32 {
    8
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.path).max_connections(self.max_connections)
    }
}

// =============================================================================
// Worker Settings
// =============================================================================

/// Provider calls one claimed item can make: a receipt on an auto-open
/// device opens the shift first, then fiscalizes.
pub const MAX_PROVIDER_CALLS_PER_ITEM: u64 = 2;

/// Worker pool behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Number of worker tasks. Each drains one device at a time.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Pause between drain cycles when there is no ready work (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Items processed per device before the lease is handed back.
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,

    /// Lifetime of a device lease (seconds). Renewed after every item.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// A PROCESSING claim older than this is treated as abandoned (seconds).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Upper bound of one provider call (seconds). Exceeding it is a
    /// transient failure.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Lease holder prefix. Auto-generated on first run if not provided.
    #[serde(default = "default_holder_id")]
    pub holder_id: String,
}

fn default_pool_size() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_drain_batch() -> usize {
    20
}
fn default_lease_ttl_secs() -> u64 {
    90
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_holder_id() -> String {
    format!("fiscald-{}", Uuid::new_v4())
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            pool_size: default_pool_size(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_batch: default_drain_batch(),
            lease_ttl_secs: default_lease_ttl_secs(),
            stale_after_secs: default_stale_after_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
            holder_id: default_holder_id(),
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    /// Longest time one item can spend inside provider calls (seconds).
    pub fn max_item_secs(&self) -> u64 {
        self.provider_timeout_secs
            .saturating_mul(MAX_PROVIDER_CALLS_PER_ITEM)
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Backoff parameters for one family of operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts before an item is FAILED.
    pub max_retries: u32,

    /// First transient backoff (milliseconds). Doubles per attempt.
    pub base_delay_ms: u64,

    /// Backoff cap (seconds).
    pub max_delay_secs: u64,

    /// Randomization factor applied to every delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Short delay used for precondition failures (milliseconds).
    #[serde(default = "default_precondition_delay_ms")]
    pub precondition_delay_ms: u64,
}

fn default_jitter() -> f64 {
    0.2
}

fn default_precondition_delay_ms() -> u64 {
    2_000
}

impl RetrySettings {
    pub fn receipts() -> Self {
        RetrySettings {
            max_retries: 10,
            base_delay_ms: 5_000,
            max_delay_secs: 900,
            jitter: default_jitter(),
            precondition_delay_ms: default_precondition_delay_ms(),
        }
    }

    pub fn shifts() -> Self {
        RetrySettings {
            max_retries: 20,
            base_delay_ms: 10_000,
            max_delay_secs: 300,
            jitter: default_jitter(),
            precondition_delay_ms: default_precondition_delay_ms(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            jitter: self.jitter,
            precondition_delay: Duration::from_millis(self.precondition_delay_ms),
        }
    }

    fn validate(&self, section: &str) -> QueueResult<()> {
        if self.max_retries == 0 || self.max_retries > MAX_RETRIES_LIMIT {
            return Err(QueueError::InvalidConfig(format!(
                "retry.{section}.max_retries must be between 1 and {MAX_RETRIES_LIMIT}"
            )));
        }
        if self.base_delay_ms == 0 {
            return Err(QueueError::InvalidConfig(format!(
                "retry.{section}.base_delay_ms must be greater than 0"
            )));
        }
        if Duration::from_millis(self.base_delay_ms) > Duration::from_secs(self.max_delay_secs) {
            return Err(QueueError::InvalidConfig(format!(
                "retry.{section}.base_delay_ms exceeds max_delay_secs"
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(QueueError::InvalidConfig(format!(
                "retry.{section}.jitter must be between 0.0 and 1.0"
            )));
        }
        Ok(())
    }
}

/// Retry settings per operation family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// `receipt_sale` and `receipt_refund`.
    #[serde(default = "RetrySettings::receipts")]
    pub receipts: RetrySettings,

    /// `shift_open`, `shift_close` and `x_report`.
    #[serde(default = "RetrySettings::shifts")]
    pub shifts: RetrySettings,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            receipts: RetrySettings::receipts(),
            shifts: RetrySettings::shifts(),
        }
    }
}

impl RetryConfig {
    pub fn policies(&self) -> RetryPolicies {
        RetryPolicies {
            receipts: self.receipts.policy(),
            shifts: self.shifts.policy(),
        }
    }
}

// =============================================================================
// Shift Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftSettings {
    /// How often the scheduler checks device schedules (seconds).
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,

    /// Legal maximum shift duration (hours).
    #[serde(default = "default_max_shift_hours")]
    pub max_shift_hours: i64,
}

fn default_scheduler_interval_secs() -> u64 {
    60
}

fn default_max_shift_hours() -> i64 {
    DEFAULT_MAX_SHIFT_HOURS
}

impl Default for ShiftSettings {
    fn default() -> Self {
        ShiftSettings {
            scheduler_interval_secs: default_scheduler_interval_secs(),
            max_shift_hours: default_max_shift_hours(),
        }
    }
}

impl ShiftSettings {
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn max_shift_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_shift_hours)
    }
}

// =============================================================================
// Priorities
// =============================================================================

/// Dispatch priority per operation (higher is sooner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritySettings {
    #[serde(default = "default_shift_open_priority")]
    pub shift_open: i32,
    #[serde(default = "default_receipt_priority")]
    pub receipt: i32,
    #[serde(default = "default_x_report_priority")]
    pub x_report: i32,
    #[serde(default = "default_shift_close_priority")]
    pub shift_close: i32,
}

fn default_shift_open_priority() -> i32 {
    OperationKind::ShiftOpen.default_priority()
}
fn default_receipt_priority() -> i32 {
    OperationKind::ReceiptSale.default_priority()
}
fn default_x_report_priority() -> i32 {
    OperationKind::XReport.default_priority()
}
fn default_shift_close_priority() -> i32 {
    OperationKind::ShiftClose.default_priority()
}

impl Default for PrioritySettings {
    fn default() -> Self {
        PrioritySettings {
            shift_open: default_shift_open_priority(),
            receipt: default_receipt_priority(),
            x_report: default_x_report_priority(),
            shift_close: default_shift_close_priority(),
        }
    }
}

impl PrioritySettings {
    pub fn for_operation(&self, kind: OperationKind) -> i32 {
        match kind {
            OperationKind::ShiftOpen => self.shift_open,
            OperationKind::ReceiptSale | OperationKind::ReceiptRefund => self.receipt,
            OperationKind::XReport => self.x_report,
            OperationKind::ShiftClose => self.shift_close,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete daemon configuration.
///
/// ## Example Config File
/// ```toml
/// [database]
/// path = "/var/lib/vendfisc/fiscal.db"
///
/// [worker]
/// pool_size = 4
/// lease_ttl_secs = 90
/// stale_after_secs = 300
/// holder_id = "fiscald-eu-1"
///
/// [retry.receipts]
/// max_retries = 10
/// base_delay_ms = 5000
/// max_delay_secs = 900
/// jitter = 0.2
///
/// [retry.shifts]
/// max_retries = 20
/// base_delay_ms = 10000
/// max_delay_secs = 300
///
/// [shifts]
/// scheduler_interval_secs = 60
/// max_shift_hours = 24
///
/// [priorities]
/// shift_open = 10
/// receipt = 5
/// x_report = 3
/// shift_close = 1
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiscalConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub shifts: ShiftSettings,

    #[serde(default)]
    pub priorities: PrioritySettings,
}

impl FiscalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fiscald.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> QueueResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading fiscal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load fiscal config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> QueueResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| QueueError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Fiscal config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> QueueResult<()> {
        if self.database.max_connections == 0 {
            return Err(QueueError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        let worker = &self.worker;
        if worker.pool_size == 0 {
            return Err(QueueError::InvalidConfig(
                "worker.pool_size must be greater than 0".into(),
            ));
        }
        if worker.drain_batch == 0 {
            return Err(QueueError::InvalidConfig(
                "worker.drain_batch must be greater than 0".into(),
            ));
        }
        if worker.provider_timeout_secs == 0 {
            return Err(QueueError::InvalidConfig(
                "worker.provider_timeout_secs must be greater than 0".into(),
            ));
        }
        // Neither the claim nor the device lease may lapse while an item is
        // still inside its provider calls
        if worker.stale_after_secs <= worker.max_item_secs() {
            return Err(QueueError::InvalidConfig(format!(
                "worker.stale_after_secs must exceed {MAX_PROVIDER_CALLS_PER_ITEM} x worker.provider_timeout_secs ({})",
                worker.max_item_secs()
            )));
        }
        if worker.lease_ttl_secs <= worker.max_item_secs() {
            return Err(QueueError::InvalidConfig(format!(
                "worker.lease_ttl_secs must exceed {MAX_PROVIDER_CALLS_PER_ITEM} x worker.provider_timeout_secs ({})",
                worker.max_item_secs()
            )));
        }
        if worker.holder_id.trim().is_empty() {
            return Err(QueueError::InvalidConfig("worker.holder_id must not be empty".into()));
        }

        self.retry.receipts.validate("receipts")?;
        self.retry.shifts.validate("shifts")?;

        if self.shifts.max_shift_hours <= 0 {
            return Err(QueueError::InvalidConfig(
                "shifts.max_shift_hours must be greater than 0".into(),
            ));
        }
        if self.shifts.scheduler_interval_secs == 0 {
            return Err(QueueError::InvalidConfig(
                "shifts.scheduler_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("VENDFISC_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(workers) = std::env::var("VENDFISC_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) => self.worker.pool_size = n,
                Err(_) => warn!(value = %workers, "Ignoring invalid VENDFISC_WORKERS"),
            }
        }

        if let Ok(timeout) = std::env::var("VENDFISC_PROVIDER_TIMEOUT_SECS") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.worker.provider_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "Ignoring invalid VENDFISC_PROVIDER_TIMEOUT_SECS"),
            }
        }

        if let Ok(poll) = std::env::var("VENDFISC_POLL_MS") {
            match poll.parse::<u64>() {
                Ok(ms) => self.worker.poll_interval_ms = ms,
                Err(_) => warn!(value = %poll, "Ignoring invalid VENDFISC_POLL_MS"),
            }
        }

        if let Ok(holder) = std::env::var("VENDFISC_HOLDER_ID") {
            debug!(holder = %holder, "Overriding lease holder from environment");
            self.worker.holder_id = holder;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "vendfisc", "fiscald")
            .map(|dirs| dirs.config_dir().join("fiscald.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FiscalConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker.holder_id.starts_with("fiscald-"));
        assert_eq!(config.retry.receipts.max_retries, 10);
        assert_eq!(config.retry.shifts.max_retries, 20);
        assert_eq!(config.shifts.max_shift_hours, 24);
        assert_eq!(config.priorities.for_operation(OperationKind::ShiftOpen), 10);
        assert_eq!(config.priorities.for_operation(OperationKind::ReceiptRefund), 5);
        assert_eq!(config.priorities.for_operation(OperationKind::ShiftClose), 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = FiscalConfig::default();
        config.worker.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = FiscalConfig::default();
        config.worker.stale_after_secs = config.worker.provider_timeout_secs;
        assert!(config.validate().is_err());

        let mut config = FiscalConfig::default();
        config.retry.receipts.max_retries = MAX_RETRIES_LIMIT + 1;
        assert!(config.validate().is_err());

        let mut config = FiscalConfig::default();
        config.retry.shifts.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thresholds_cover_two_provider_calls() {
        // Auto-open receipt: two 29 s calls under one claim
        let mut config = FiscalConfig::default();
        config.worker.provider_timeout_secs = 30;
        config.worker.lease_ttl_secs = 31;
        config.worker.stale_after_secs = 300;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));

        config.worker.lease_ttl_secs = 60;
        assert!(config.validate().is_err());
        config.worker.lease_ttl_secs = 61;
        assert!(config.validate().is_ok());

        config.worker.stale_after_secs = 31;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_after_secs"));
        config.worker.stale_after_secs = 61;
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.max_item_secs(), 60);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: FiscalConfig = toml::from_str(
            r#"
            [worker]
            pool_size = 2
            holder_id = "fiscald-test"

            [retry.receipts]
            max_retries = 3
            base_delay_ms = 100
            max_delay_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.worker.holder_id, "fiscald-test");
        assert_eq!(config.worker.provider_timeout_secs, 30);
        assert_eq!(config.retry.receipts.max_retries, 3);
        assert_eq!(config.retry.receipts.precondition_delay_ms, 2_000);
        assert_eq!(config.retry.shifts.max_retries, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_serialization() {
        let config = FiscalConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[worker]"));
        assert!(toml_str.contains("[retry.receipts]"));
        assert!(toml_str.contains("[priorities]"));
    }
}
