//! Engine configuration and its on-disk location.
//!
//! The configuration file is JSON:
//!
//! ```json
//! {
//!   "control_node": "admin",
//!   "inventory": "~/runbook/inventory.yaml",
//!   "max_concurrency": 8
//! }
//! ```

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use dirs_next::{config_dir, home_dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::DEFAULT_MAX_CONCURRENCY;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "RUNBOOK_CONFIG_PATH";

/// Node id used for `self` when no configuration says otherwise.
pub const DEFAULT_CONTROL_NODE: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Node addressed by `self`; runner calls execute here.
    pub control_node: String,
    /// Default inventory file when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<PathBuf>,
    /// Upper bound on concurrent per-node calls within one state step.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_node: DEFAULT_CONTROL_NODE.to_string(),
            inventory: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Returns the default path for the engine configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("runbook").join("config.json")
}

/// Loads configuration from the default path.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from `path`; a missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: EngineConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.inventory = config.inventory.map(|inventory| expand_tilde(&inventory.to_string_lossy()));
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.control_node.trim().is_empty() {
        return Err(ConfigError::Invalid("control_node must not be empty".into()));
    }
    if config.control_node.chars().any(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!(
            "control_node '{}' must not contain whitespace",
            config.control_node
        )));
    }
    if config.max_concurrency == 0 {
        return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
    }
    Ok(())
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
