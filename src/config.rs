use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::db::retry::RetryPolicy;
use crate::error::EngineError;

/// Application-level constants
pub const APP_NAME: &str = "Mediwatch";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compartment count of a freshly created pillbox (one per day of week).
pub const DEFAULT_COMPARTMENTS: u8 = 7;

/// Upper bound on compartments per pillbox.
pub const MAX_COMPARTMENTS: u8 = 64;

/// Default grace window on either side of a due time: 30 minutes.
const DEFAULT_GRACE_SECS: u64 = 30 * 60;

/// Default missed-dose scan cadence: every 5 minutes.
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 5 * 60;

/// Default number of (caregiver, occurrence) keys remembered by the dispatcher.
const DEFAULT_DEDUP_WINDOW: usize = 4096;

/// Get the application data directory
/// ~/Mediwatch/ on all platforms. Falls back to the working directory
/// when no home directory can be determined (service accounts).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the directory holding one ledger database per user
pub fn partitions_dir() -> PathBuf {
    app_data_dir().join("partitions")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "mediwatch=info"
}

/// Where per-user ledgers live.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    /// Each partition is a private in-memory database (tests, demos).
    Memory,
    /// Each partition is `<dir>/<user_id>/ledger.db`.
    Directory(PathBuf),
}

impl Default for StorageLocation {
    fn default() -> Self {
        Self::Directory(partitions_dir())
    }
}

/// Tolerance around a due timestamp.
///
/// A report may arrive up to `before` ahead of the due time or up to
/// `after` behind it and still count for that occurrence. Past
/// `due + after` the occurrence becomes eligible for the missed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceWindow {
    pub before: chrono::Duration,
    pub after: chrono::Duration,
}

impl GraceWindow {
    pub fn symmetric(minutes: i64) -> Self {
        Self {
            before: chrono::Duration::minutes(minutes),
            after: chrono::Duration::minutes(minutes),
        }
    }
}

impl Default for GraceWindow {
    fn default() -> Self {
        Self {
            before: chrono::Duration::seconds(DEFAULT_GRACE_SECS as i64),
            after: chrono::Duration::seconds(DEFAULT_GRACE_SECS as i64),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub grace: GraceWindow,
    /// Cadence of the background missed-dose scan.
    pub scan_interval: Duration,
    pub default_compartments: u8,
    /// Capacity of the dispatcher's in-memory dedup window.
    pub dedup_window: usize,
    pub retry: RetryPolicy,
    pub storage: StorageLocation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace: GraceWindow::default(),
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            default_compartments: DEFAULT_COMPARTMENTS,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            retry: RetryPolicy::default(),
            storage: StorageLocation::default(),
        }
    }
}

impl EngineConfig {
    /// In-memory configuration with default policy values.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageLocation::Memory,
            ..Self::default()
        }
    }

    /// Load from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let raw: RawEngineConfig = serde_json::from_str(json)
            .map_err(|e| EngineError::Validation(format!("invalid engine config: {e}")))?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.grace.before < chrono::Duration::zero() || self.grace.after < chrono::Duration::zero() {
            return Err(EngineError::Validation("grace windows must not be negative".into()));
        }
        if self.scan_interval.is_zero() {
            return Err(EngineError::Validation("scan interval must be positive".into()));
        }
        if self.default_compartments == 0 || self.default_compartments > MAX_COMPARTMENTS {
            return Err(EngineError::Validation(format!(
                "default compartments must be within 1..={MAX_COMPARTMENTS}"
            )));
        }
        if self.dedup_window == 0 {
            return Err(EngineError::Validation("dedup window must hold at least one key".into()));
        }
        Ok(())
    }
}

/// On-disk shape of [`EngineConfig`]: plain seconds, all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawEngineConfig {
    grace_before_secs: Option<i64>,
    grace_after_secs: Option<i64>,
    scan_interval_secs: Option<u64>,
    default_compartments: Option<u8>,
    dedup_window: Option<usize>,
    retry: Option<RetryPolicy>,
    storage: Option<StorageLocation>,
}

impl RawEngineConfig {
    fn into_config(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            grace: GraceWindow {
                before: self
                    .grace_before_secs
                    .map(chrono::Duration::seconds)
                    .unwrap_or(defaults.grace.before),
                after: self
                    .grace_after_secs
                    .map(chrono::Duration::seconds)
                    .unwrap_or(defaults.grace.after),
            },
            scan_interval: self
                .scan_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_interval),
            default_compartments: self.default_compartments.unwrap_or(defaults.default_compartments),
            dedup_window: self.dedup_window.unwrap_or(defaults.dedup_window),
            retry: self.retry.unwrap_or(defaults.retry),
            storage: self.storage.unwrap_or(defaults.storage),
        }
    }
}
