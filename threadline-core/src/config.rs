//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/threadline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/threadline/` (~/.config/threadline/)
//! - State/Logs: `$XDG_STATE_HOME/threadline/` (~/.local/state/threadline/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Log file name parts shared with the rolling appender.
pub(crate) const LOG_FILE_PREFIX: &str = "threadline";
pub(crate) const LOG_FILE_SUFFIX: &str = "log";

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

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Analysis pipeline settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the graph and mapping passes
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Upper bound on families analysed in parallel (0 = one per CPU)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Accept parents that appear later in the same file instead of
    /// reclassifying the child as a synthetic root
    #[serde(default)]
    pub allow_forward_parents: bool,

    /// Tool names whose invocations spawn subagents
    #[serde(default = "default_task_tool_names")]
    pub task_tool_names: Vec<String>,

    /// Infix for synthetic child session ids of inline side-chains
    #[serde(default = "default_sidechain_prefix")]
    pub sidechain_prefix: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            allow_forward_parents: false,
            task_tool_names: default_task_tool_names(),
            sidechain_prefix: default_sidechain_prefix(),
        }
    }
}

impl AnalysisConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.task_tool_names.iter().all(|n| n.trim().is_empty()) {
            return Err(Error::Config(
                "analysis.task_tool_names must name at least one tool".to_string(),
            ));
        }
        if self.sidechain_prefix.is_empty() {
            return Err(Error::Config(
                "analysis.sidechain_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `name` is one of the configured task tools.
    pub fn is_task_tool(&self, name: &str) -> bool {
        self.task_tool_names.iter().any(|n| n == name)
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_task_tool_names() -> Vec<String> {
    vec!["Task".to_string(), "Agent".to_string()]
}

fn default_sidechain_prefix() -> String {
    "_sidechain_".to_string()
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
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/threadline/config.toml` (~/.config/threadline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("threadline").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/threadline/` (~/.local/state/threadline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("threadline")
    }

    /// Returns today's log file path
    ///
    /// `$XDG_STATE_HOME/threadline/threadline.YYYY-MM-DD.log`; the appender
    /// rolls over daily (UTC).
    pub fn log_path() -> PathBuf {
        let today = chrono::Utc::now().format("%Y-%m-%d");
        Self::state_dir().join(format!("{}.{}.{}", LOG_FILE_PREFIX, today, LOG_FILE_SUFFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.analysis.max_workers, 4);
        assert!(!config.analysis.allow_forward_parents);
        assert!(config.analysis.is_task_tool("Task"));
        assert!(config.analysis.is_task_tool("Agent"));
        assert!(!config.analysis.is_task_tool("Bash"));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[analysis]
max_workers = 2
allow_forward_parents = true
task_tool_names = ["Dispatch"]

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.analysis.max_workers, 2);
        assert!(config.analysis.allow_forward_parents);
        assert!(config.analysis.is_task_tool("Dispatch"));
        assert!(!config.analysis.is_task_tool("Task"));
        assert_eq!(config.analysis.sidechain_prefix, "_sidechain_");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.max_files, 5);
    }

    #[test]
    fn test_validation_rejects_empty_tool_list() {
        let config = AnalysisConfig {
            task_tool_names: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            sidechain_prefix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[analysis]\nmax_workers = 1\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.analysis.max_workers, 1);

        std::fs::write(&path, "[analysis]\ntask_tool_names = []\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_xdg_paths() {
        assert!(Config::config_path().ends_with("threadline/config.toml"));
        assert!(Config::state_dir().ends_with("threadline"));
    }

    #[test]
    fn test_log_path_is_dated_under_state_dir() {
        let path = Config::log_path();
        assert!(path.starts_with(Config::state_dir()));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("threadline."));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "threadline.2025-01-01.log".len());
    }
}
