/// Configuration management for repsnap

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main repsnap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Topology discovery configuration
    pub discovery: DiscoveryConfig,
    /// Backup target selection
    #[serde(default)]
    pub selection: SelectionConfig,
    /// External snapshot collaborator
    pub snapshot: SnapshotConfig,
    /// Run guard configuration
    #[serde(default)]
    pub guard: GuardConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Topology discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Upper bound on waiting for a primary to become known, in milliseconds
    pub timeout_ms: u64,
    /// First delay between primary probes, in milliseconds
    pub poll_interval_ms: u64,
    /// Backoff cap between primary probes, in milliseconds
    pub max_poll_interval_ms: u64,
    /// Driver connect timeout, in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name reported to the server
    pub app_name: String,
}

/// Order in which secondaries are offered to the selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionOrder {
    /// Order reported by the server's member enumeration
    #[default]
    Discovery,
    /// Priority ascending, then host string
    Priority,
}

/// Backup target selection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SelectionConfig {
    pub order: SelectionOrder,
}

/// External snapshot collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Executable invoked with the target host:port as its only argument
    pub command: PathBuf,
}

/// Run guard configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardConfig {
    /// Directory holding per-target lock files (system temp dir if unset)
    pub lock_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            selection: SelectionConfig::default(),
            snapshot: SnapshotConfig {
                command: PathBuf::from("/usr/local/bin/mongo-volume-snapshot"),
            },
            guard: GuardConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            poll_interval_ms: 250,
            max_poll_interval_ms: 2_000,
            connect_timeout_ms: 10_000,
            app_name: "repsnap".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl GuardConfig {
    /// Directory the run guard places its lock files in
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "discovery timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.discovery.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "discovery poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.discovery.max_poll_interval_ms < self.discovery.poll_interval_ms {
            return Err(ConfigError::ValidationError(
                "discovery max_poll_interval_ms must not be less than poll_interval_ms".to_string(),
            ));
        }

        if self.discovery.poll_interval_ms >= self.discovery.timeout_ms {
            return Err(ConfigError::ValidationError(
                "discovery poll_interval_ms must be less than timeout_ms".to_string(),
            ));
        }

        if self.discovery.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "discovery connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.snapshot.command.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "snapshot command cannot be empty".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }
}
