//! Orchestrator configuration, loaded from TOML.
//!
//! Every section is optional; missing keys fall back to their defaults.
//!
//! ```toml
//! [repository]
//! domains_dir = "/srv/berth/domains"
//!
//! [watcher]
//! poll_interval_ms = 2000
//! mode = "parallel"
//!
//! [cleanup]
//! max_attempts = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BerthConfig {
    /// Artifact directories
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Directory watcher
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Lifecycle step bounds
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Filesystem cleanup retries
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BerthConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: BerthConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `home` instead of the working directory.
    pub fn with_home(home: impl AsRef<Path>) -> Self {
        Self {
            repository: RepositoryConfig::under(home),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watcher.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.watcher.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "watcher.max_parallel must be greater than zero".into(),
            ));
        }
        if self.lifecycle.step_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.step_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.cleanup.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "cleanup.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Artifact directories and the orchestrator's private work area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_domains_dir")]
    pub domains_dir: PathBuf,

    #[serde(default = "default_policies_dir")]
    pub policies_dir: PathBuf,

    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,

    /// Native library extraction and per-artifact data folders live here
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl RepositoryConfig {
    pub fn under(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref();
        Self {
            domains_dir: home.join("domains"),
            policies_dir: home.join("policies"),
            apps_dir: home.join("apps"),
            work_dir: home.join("work"),
        }
    }

    /// Folder holding extracted native libraries of one artifact
    pub fn native_dir(&self, artifact: &str) -> PathBuf {
        self.work_dir.join("native").join(artifact)
    }

    /// Persistent data folder of one artifact
    pub fn data_dir(&self, artifact: &str) -> PathBuf {
        self.work_dir.join("data").join(artifact)
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            domains_dir: default_domains_dir(),
            policies_dir: default_policies_dir(),
            apps_dir: default_apps_dir(),
            work_dir: default_work_dir(),
        }
    }
}

/// How a scan pass runs the deployments it decides on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherMode {
    #[default]
    Sequential,
    Parallel,
}

/// Directory watcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub mode: WatcherMode,

    /// Upper bound on concurrent deployments in parallel mode
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Deploy only these applications once at start and do not monitor
    #[serde(default)]
    pub fixed_artifacts: Option<Vec<String>>,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            mode: WatcherMode::default(),
            max_parallel: default_max_parallel(),
            fixed_artifacts: None,
        }
    }
}

/// Lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Bound on each of init/start/stop/dispose
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Version checked against descriptors' `min_runtime_version`
    #[serde(default = "default_runtime_version")]
    pub runtime_version: Version,
}

impl LifecycleConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            runtime_version: default_runtime_version(),
        }
    }
}

/// Bounded retry for filesystem cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl CleanupConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Newline-delimited JSON output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_domains_dir() -> PathBuf {
    PathBuf::from("berth/domains")
}

fn default_policies_dir() -> PathBuf {
    PathBuf::from("berth/policies")
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("berth/apps")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("berth/work")
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_parallel() -> usize {
    4
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_runtime_version() -> Version {
    Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0))
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}
