//! Configuration loading and management.
//!
//! Everything is defaulted so the daemon can start with no config file at
//! all; a TOML file overrides individual sections.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Attack record store configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Log ingestion configuration.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Slow brute-force detector configuration.
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Jail metadata (bantime fallback table).
    #[serde(default)]
    pub jails: JailsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to built-in defaults when the file
    /// does not exist. Parse errors are still fatal.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

/// Attack record store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path of the persisted JSON document.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Log ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Current fail2ban log file. Rotated siblings are discovered by
    /// globbing `<log_path>*`.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Seconds between ingestion polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds between danger-score / stats recalculation passes.
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,
    /// fail2ban findtime used by per-record pattern analysis.
    #[serde(default = "default_findtime")]
    pub findtime_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            poll_interval_secs: default_poll_interval(),
            analysis_interval_secs: default_analysis_interval(),
            findtime_secs: default_findtime(),
        }
    }
}

/// Slow brute-force detector configuration.
///
/// Thresholds are configuration constants, not CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Where the `--json` ranked candidate cache is written. Consumed by
    /// the display layer as a pseudo-jail.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    /// Trailing analysis window in seconds (default 7 days).
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Minimum Found events for an IP to be considered.
    #[serde(default = "default_min_attempts")]
    pub min_attempts: usize,
    /// Minimum mean inter-attempt interval in seconds. IPs below this are
    /// ordinary fast brute-forcers already caught by rate limiting.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            window_secs: default_window(),
            min_attempts: default_min_attempts(),
            min_interval_secs: default_min_interval(),
        }
    }
}

/// Jail metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct JailsConfig {
    /// Fallback bantime per jail, used when no authoritative duration is
    /// available from the logs.
    #[serde(default = "default_bantimes")]
    pub bantimes: BTreeMap<String, u64>,
}

impl Default for JailsConfig {
    fn default() -> Self {
        Self {
            bantimes: default_bantimes(),
        }
    }
}

impl JailsConfig {
    /// Bantime heuristic for a jail (default 10 minutes).
    pub fn bantime_for(&self, jail: &str) -> u64 {
        self.bantimes.get(jail).copied().unwrap_or(600)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/attacks.db.json")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/fail2ban.log")
}

fn default_poll_interval() -> u64 {
    60
}

fn default_analysis_interval() -> u64 {
    300
}

fn default_findtime() -> u64 {
    600
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("cache/suspicious_ips.json")
}

fn default_window() -> u64 {
    86400 * 7
}

fn default_min_attempts() -> usize {
    3
}

fn default_min_interval() -> u64 {
    600
}

fn default_bantimes() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("recidive".to_string(), 604800),
        ("sshd".to_string(), 600),
        ("traefik-auth".to_string(), 3600),
        ("traefik-botsearch".to_string(), 86400),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Config = toml::from_str("").expect("empty config parses");
        assert_eq!(config.ingest.poll_interval_secs, 60);
        assert_eq!(config.detector.window_secs, 86400 * 7);
        assert_eq!(config.detector.min_attempts, 3);
        assert_eq!(config.detector.min_interval_secs, 600);
        assert_eq!(config.jails.bantime_for("recidive"), 604800);
        assert_eq!(config.jails.bantime_for("nginx-http-auth"), 600);
    }

    #[test]
    fn test_partial_override() {
        let toml = r#"
            [detector]
            min_attempts = 5

            [jails.bantimes]
            sshd = 1200
        "#;
        let config: Config = toml::from_str(toml).expect("partial config parses");
        assert_eq!(config.detector.min_attempts, 5);
        assert_eq!(config.detector.min_interval_secs, 600);
        assert_eq!(config.jails.bantime_for("sshd"), 1200);
        // Override replaces the whole table
        assert_eq!(config.jails.bantime_for("recidive"), 600);
    }
}
