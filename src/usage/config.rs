//! Configuration and storage directory discovery

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::usage::models::BackendOutcome;

/// Environment variable overriding the OpenCode data directory
pub const DATA_DIR_ENV: &str = "OPENCODE_DATA_DIR";

/// Result Cache time-to-live
pub const CACHE_TTL_MS: u64 = 2_000;
/// Aggregate Cache entry bound
pub const SESSION_AGGREGATE_CACHE_MAX: usize = 10_000;
/// Forced full reconciliation interval (10 minutes)
pub const RECONCILIATION_INTERVAL_MS: u64 = 10 * 60 * 1000;
/// Database handle recycle interval (5 minutes)
pub const DB_RECYCLE_INTERVAL_MS: u64 = 5 * 60 * 1000;
/// Activity polling interval for the database backend
pub const ACTIVITY_POLL_INTERVAL_MS: u64 = 1_000;
/// Delay before a new part file is read
pub const PART_DEBOUNCE_MS: u64 = 50;

/// When the flat-file backend is consulted after the database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackPolicy {
    /// Fall back whenever the database yields no rows, including a genuinely empty database
    #[default]
    OnEmpty,
    /// Fall back only when the database is absent or its query failed
    OnUnavailable,
}

impl FallbackPolicy {
    /// Whether the database outcome should be replaced by the flat-file backend
    pub fn should_fall_back(&self, outcome: &BackendOutcome) -> bool {
        match (self, outcome) {
            (_, BackendOutcome::Rows(_)) => false,
            (_, BackendOutcome::Unavailable) => true,
            (FallbackPolicy::OnEmpty, BackendOutcome::Empty) => true,
            (FallbackPolicy::OnUnavailable, BackendOutcome::Empty) => false,
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// OpenCode data root; `None` resolves to the platform data dir
    #[serde(default)]
    pub data_dir: Option<String>,
    /// How long a list result may be served from the result cache
    #[serde(default = "default_ttl")]
    pub result_cache_ttl_ms: u64,
    /// Aggregate cache entries kept after eviction
    #[serde(default = "default_aggregate_max")]
    pub aggregate_cache_max: usize,
    /// Period of the forced full walk of the session tree
    #[serde(default = "default_reconciliation")]
    pub reconciliation_interval_ms: u64,
    /// Age after which the read-only database connection is reopened
    #[serde(default = "default_recycle")]
    pub db_recycle_interval_ms: u64,
    #[serde(default = "default_poll")]
    pub activity_poll_interval_ms: u64,
    /// Delay between a part file notification and reading it
    #[serde(default = "default_debounce")]
    pub part_debounce_ms: u64,
    /// When the database backend gives way to the flat files
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

fn default_ttl() -> u64 {
    CACHE_TTL_MS
}

fn default_aggregate_max() -> usize {
    SESSION_AGGREGATE_CACHE_MAX
}

fn default_reconciliation() -> u64 {
    RECONCILIATION_INTERVAL_MS
}

fn default_recycle() -> u64 {
    DB_RECYCLE_INTERVAL_MS
}

fn default_poll() -> u64 {
    ACTIVITY_POLL_INTERVAL_MS
}

fn default_debounce() -> u64 {
    PART_DEBOUNCE_MS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            result_cache_ttl_ms: CACHE_TTL_MS,
            aggregate_cache_max: SESSION_AGGREGATE_CACHE_MAX,
            reconciliation_interval_ms: RECONCILIATION_INTERVAL_MS,
            db_recycle_interval_ms: DB_RECYCLE_INTERVAL_MS,
            activity_poll_interval_ms: ACTIVITY_POLL_INTERVAL_MS,
            part_debounce_ms: PART_DEBOUNCE_MS,
            fallback: FallbackPolicy::OnEmpty,
        }
    }
}

impl StoreConfig {
    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn paths(&self) -> StoragePaths {
        StoragePaths::new(get_data_dir(self.data_dir.as_deref()))
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    pub fn db_recycle_interval(&self) -> Duration {
        Duration::from_millis(self.db_recycle_interval_ms)
    }

    pub fn activity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.activity_poll_interval_ms)
    }

    pub fn part_debounce(&self) -> Duration {
        Duration::from_millis(self.part_debounce_ms)
    }
}

/// Resolved on-disk locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub messages_dir: PathBuf,
    pub parts_dir: PathBuf,
    pub db_path: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: PathBuf) -> Self {
        let storage_dir = data_dir.join("storage");
        Self {
            sessions_dir: storage_dir.join("session"),
            messages_dir: storage_dir.join("message"),
            parts_dir: storage_dir.join("part"),
            db_path: data_dir.join("opencode.db"),
            storage_dir,
            data_dir,
        }
    }
}

/// Get the OpenCode data directory
/// Priority: 1. Custom path from config, 2. OPENCODE_DATA_DIR env var, 3. Default ~/.local/share/opencode
pub fn get_data_dir(custom_path: Option<&str>) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = env::var(DATA_DIR_ENV) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("share").join("opencode");
    }

    // Fallback for edge cases
    PathBuf::from(".opencode")
}
