//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/dossier/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/dossier/` (~/.config/dossier/)
//! - Data: `$XDG_DATA_HOME/dossier/` (~/.local/share/dossier/)
//! - State/Logs: `$XDG_STATE_HOME/dossier/` (~/.local/state/dossier/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Step execution loop and worker pool
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Live projector limits
    #[serde(default)]
    pub projector: ProjectorConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Step execution configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Steps running at the same time
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Upper bound on turns per step, the last one being the finalizing turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Characters kept from a single retrieved block
    #[serde(default = "default_max_chars_per_item")]
    pub max_chars_per_item: usize,

    /// Characters appended to a step context per follow-up round
    #[serde(default = "default_max_total_context_chars")]
    pub max_total_context_chars: usize,

    /// Keyword overlap at which a finding counts as already reported
    #[serde(default = "default_novelty_keyword_threshold")]
    pub novelty_keyword_threshold: f64,

    /// Text units kept per step in the novelty digest
    #[serde(default = "default_digest_max_entries")]
    pub digest_max_entries: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            max_iterations: default_max_iterations(),
            max_chars_per_item: default_max_chars_per_item(),
            max_total_context_chars: default_max_total_context_chars(),
            novelty_keyword_threshold: default_novelty_keyword_threshold(),
            digest_max_entries: default_digest_max_entries(),
        }
    }
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_max_iterations() -> usize {
    4
}

fn default_max_chars_per_item() -> usize {
    4000
}

fn default_max_total_context_chars() -> usize {
    20000
}

fn default_novelty_keyword_threshold() -> f64 {
    0.7
}

fn default_digest_max_entries() -> usize {
    128
}

/// Live projector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectorConfig {
    /// Conversation messages kept before the oldest are evicted
    #[serde(default = "default_conversation_cap")]
    pub conversation_cap: usize,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            conversation_cap: default_conversation_cap(),
        }
    }
}

fn default_conversation_cap() -> usize {
    200
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if exec.max_parallel_steps == 0 {
            return Err(Error::Config(
                "execution.max_parallel_steps must be at least 1".to_string(),
            ));
        }
        if exec.max_iterations < 2 {
            return Err(Error::Config(
                "execution.max_iterations must be at least 2".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&exec.novelty_keyword_threshold) {
            return Err(Error::Config(
                "execution.novelty_keyword_threshold must be between 0 and 1".to_string(),
            ));
        }
        if self.projector.conversation_cap == 0 {
            return Err(Error::Config(
                "projector.conversation_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/dossier/config.toml` (~/.config/dossier/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("dossier").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/dossier/` (~/.local/share/dossier/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("dossier")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/dossier/` (~/.local/state/dossier/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("dossier")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/dossier/sessions.db` (~/.local/share/dossier/sessions.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("sessions.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/dossier/dossier.log` (~/.local/state/dossier/dossier.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("dossier.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
