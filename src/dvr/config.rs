//! Static configuration
//!
//! Loaded once at startup from a JSON file. Every field has a default so a
//! missing file or a partial file both work. Runtime-adjustable settings
//! (storage path, quotas) live in the database instead, see `DvrSettings`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable pointing at the configuration file
pub const CONFIG_ENV: &str = "RECSCHED_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DvrConfig {
    /// Base URL of the tuner backend service
    pub backend_url: String,
    pub database_path: PathBuf,
    /// Used when `dvr_settings.storage_path` is empty
    pub recording_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub debug_logging: bool,
    pub timings: RecorderTimings,
}

impl Default for DvrConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recsched");
        let recording_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Videos")
            .join("Recorded");

        Self {
            backend_url: "http://127.0.0.1:40772".to_string(),
            database_path: data_dir.join("recsched.db"),
            recording_dir,
            log_dir: None,
            debug_logging: false,
            timings: RecorderTimings::default(),
        }
    }
}

/// Timing and retry knobs for recorders, the acquirer and the allocator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderTimings {
    /// Lead time before start during which acquisition is attempted
    pub prep_lead_ms: u64,
    pub max_prep_retries: u32,
    pub retry_backoff_ms: u64,
    pub first_chunk_timeout_ms: u64,
    pub cancel_ack_timeout_ms: u64,
    pub time_specified_start_margin_ms: u64,
    pub time_specified_end_margin_ms: u64,
    pub rec_priority: i32,
    pub conflict_priority: i32,
    pub sync_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub stale_lease_hours: i64,
}

impl Default for RecorderTimings {
    fn default() -> Self {
        Self {
            prep_lead_ms: 15_000,
            max_prep_retries: 3,
            retry_backoff_ms: 5_000,
            first_chunk_timeout_ms: 5_000,
            cancel_ack_timeout_ms: 60_000,
            time_specified_start_margin_ms: 1_000,
            time_specified_end_margin_ms: 1_000,
            rec_priority: 2,
            conflict_priority: 3,
            sync_interval_secs: 30,
            sweep_interval_secs: 30 * 60,
            stale_lease_hours: 12,
        }
    }
}

impl RecorderTimings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.first_chunk_timeout_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }

    /// Backend priority for a reservation; acknowledged conflicts get the higher one
    pub fn priority_for(&self, is_conflict: bool) -> i32 {
        if is_conflict {
            self.conflict_priority.max(self.rec_priority)
        } else {
            self.rec_priority
        }
    }
}

impl DvrConfig {
    /// Resolve the configuration file path from the environment or the user config dir
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("recsched").join("config.json"))
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: DvrConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {:?}", path))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}
