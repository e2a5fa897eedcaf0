//! Configuration management for panehost.
//!
//! This module provides TOML configuration file loading from
//! `~/.panehost/config.toml`. Every table is optional; missing keys take
//! their defaults.
//!
//! # Configuration File
//!
//! ```toml
//! # Default shell (optional, otherwise detected)
//! shell = "/bin/zsh"
//! # Shell used once if the default one dies right after launch
//! fallback_shell = "/bin/sh"
//!
//! # Where pane scrollback is persisted
//! history_dir = "/home/me/.panehost/history"
//!
//! # Init wrappers written by the shell-hook installer
//! shell_wrapper_dir = "/home/me/.panehost/shell"
//!
//! # Local port exported to shells for lifecycle notifications
//! notify_port = 51741
//!
//! [terminal]
//! default_cols = 80
//! default_rows = 24
//!
//! [scrollback]
//! max_bytes = 1048576
//!
//! [timing]
//! batch_interval_ms = 16
//! crash_threshold_ms = 1000
//! exit_grace_ms = 5000
//! terminate_timeout_ms = 2000
//! force_kill_timeout_ms = 500
//! cleanup_timeout_ms = 5000
//! exit_drain_ms = 200
//!
//! [input]
//! chunk_size = 4096
//! queue_capacity = 256
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port handed to child shells as `PANEHOST_PORT`
pub const DEFAULT_NOTIFY_PORT: u16 = 51741;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not determine config path")]
    NoHome,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Default shell command
    pub shell: Option<String>,
    /// Crash-recovery shell
    pub fallback_shell: Option<String>,
    /// Root directory for pane history artifacts
    pub history_dir: Option<PathBuf>,
    /// Directory holding shell init wrappers
    pub shell_wrapper_dir: Option<PathBuf>,
    /// Lifecycle notification port
    pub notify_port: u16,
    /// Terminal geometry defaults
    pub terminal: TerminalConfig,
    /// Scrollback bounds
    pub scrollback: ScrollbackConfig,
    /// Timers and timeouts
    pub timing: TimingConfig,
    /// Input queue settings
    pub input: InputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            fallback_shell: None,
            history_dir: None,
            shell_wrapper_dir: None,
            notify_port: DEFAULT_NOTIFY_PORT,
            terminal: TerminalConfig::default(),
            scrollback: ScrollbackConfig::default(),
            timing: TimingConfig::default(),
            input: InputConfig::default(),
        }
    }
}

/// Terminal geometry used when a caller does not pass one
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TerminalConfig {
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_cols: 80,
            default_rows: 24,
        }
    }
}

/// In-memory and replayed scrollback bound
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScrollbackConfig {
    pub max_bytes: usize,
}

impl Default for ScrollbackConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

/// Timers, all in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    /// Data batch cadence (~60Hz)
    pub batch_interval_ms: u64,
    /// Exit this soon after spawn with a nonzero code counts as a launch failure
    pub crash_threshold_ms: u64,
    /// How long a dead session stays attachable
    pub exit_grace_ms: u64,
    /// Wait after SIGTERM before escalating
    pub terminate_timeout_ms: u64,
    /// Wait after SIGKILL before force-clearing
    pub force_kill_timeout_ms: u64,
    /// Overall bound for `cleanup()`
    pub cleanup_timeout_ms: u64,
    /// How long to wait for trailing output after the child exits
    pub exit_drain_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 16,
            crash_threshold_ms: 1000,
            exit_grace_ms: 5000,
            terminate_timeout_ms: 2000,
            force_kill_timeout_ms: 500,
            cleanup_timeout_ms: 5000,
            exit_drain_ms: 200,
        }
    }
}

impl TimingConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn crash_threshold(&self) -> Duration {
        Duration::from_millis(self.crash_threshold_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn exit_drain(&self) -> Duration {
        Duration::from_millis(self.exit_drain_ms)
    }
}

/// Input Writer settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputConfig {
    /// Payloads up to this size are written in one call
    pub chunk_size: usize,
    /// Maximum queued writes per session
    pub queue_capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            queue_capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::get_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::get_config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        let dir = app_dir()?;
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir.join("config.toml"))
    }

    /// Resolved history root
    pub fn history_root(&self) -> PathBuf {
        self.history_dir
            .clone()
            .or_else(|| app_dir().map(|d| d.join("history")))
            .unwrap_or_else(|| std::env::temp_dir().join("panehost-history"))
    }
}

/// `~/.panehost`
pub fn app_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".panehost"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
