//! Application configuration
//!
//! Stored as `config.json` in the XDG data directory. Missing files and
//! missing fields fall back to defaults; out-of-range values are clamped on
//! load so a hand-edited file cannot stall the worker pool.

use crate::utils::{get_data_dir, write_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry policy for transient application failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per task, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// External program that receives rendered nftables JSON on stdin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// How long a worker may hold a firewall before others can take over
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Upper bound on a single target call
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Delay before retrying a task whose firewall is leased by someone else
    #[serde(default = "default_lease_retry_delay_ms")]
    pub lease_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub target: TargetConfig,
    /// JSON store location; defaults to `store.json` in the data directory
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            lease_ttl_secs: default_lease_ttl_secs(),
            apply_timeout_secs: default_apply_timeout_secs(),
            workers: default_workers(),
            lease_retry_delay_ms: default_lease_retry_delay_ms(),
            enable_audit_log: true,
            log_level: default_log_level(),
            target: TargetConfig::default(),
            store_path: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_lease_ttl_secs() -> u64 {
    90
}

fn default_apply_timeout_secs() -> u64 {
    30
}

fn default_workers() -> usize {
    4
}

fn default_lease_retry_delay_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_program() -> String {
    "nft".to_string()
}

fn default_args() -> Vec<String> {
    vec!["--json".to_string(), "-f".to_string(), "-".to_string()]
}

impl AppConfig {
    /// Clamps values into workable ranges.
    ///
    /// - at least one attempt and one worker (at most 64 workers)
    /// - `max_backoff_ms >= initial_backoff_ms`
    /// - the lease outlives two target calls (an attempt and its rollback)
    pub fn clamped(mut self) -> Self {
        self.retry.max_attempts = self.retry.max_attempts.clamp(1, 100);
        self.retry.initial_backoff_ms = self.retry.initial_backoff_ms.clamp(1, 3_600_000);
        self.retry.max_backoff_ms = self
            .retry
            .max_backoff_ms
            .clamp(self.retry.initial_backoff_ms, 3_600_000);
        self.apply_timeout_secs = self.apply_timeout_secs.clamp(1, 3600);
        let lease_floor = 2 * self.apply_timeout_secs + 1;
        self.lease_ttl_secs = self
            .lease_ttl_secs
            .clamp(lease_floor, lease_floor.max(7200));
        self.workers = self.workers.clamp(1, 64);
        self.lease_retry_delay_ms = self.lease_retry_delay_ms.clamp(10, 600_000);
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn lease_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lease_retry_delay_ms)
    }

    /// Store path from the config, or `store.json` in the data directory.
    pub fn resolved_store_path(&self) -> Option<PathBuf> {
        self.store_path
            .clone()
            .or_else(|| get_data_dir().map(|d| d.join("store.json")))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|d| d.join("config.json"))
}

/// Loads the config from `path`, or returns defaults if it is missing or unreadable.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => config.clamped(),
            Err(e) => {
                tracing::warn!("Ignoring invalid config {}: {e}", path.display());
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}

/// Loads the config from the data directory.
pub async fn load_config() -> AppConfig {
    match default_config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    }
}

/// Saves the config with the atomic temp-file + rename pattern (mode 0o600).
pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(config)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &json))
        .await
        .map_err(std::io::Error::other)?
}

pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(path) = default_config_path() {
        save_config_to(config, &path).await?;
    }
    Ok(())
}
