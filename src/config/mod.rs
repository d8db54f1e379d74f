use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::plugins::SharedPrefixes;

/// Host configuration, read from `~/.plughost/config.yaml` by default
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    /// Directory searched (recursively) for plugin modules
    #[serde(default = "default_plugin_directory")]
    pub directory: PathBuf,

    /// Load each module into its own collectible boundary
    #[serde(default = "default_true")]
    pub use_isolation: bool,

    /// Load and initialize plugins when the host starts
    #[serde(default = "default_true")]
    pub auto_load_on_startup: bool,

    /// Module file pattern; the platform library suffix when unset
    #[serde(default)]
    pub search_pattern: Option<String>,

    /// Plugin names to load. Empty loads everything.
    #[serde(default)]
    pub include: Vec<String>,

    /// Plugin names never to load
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Name prefixes always resolved against the host
    #[serde(default = "default_shared_prefixes")]
    pub shared_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_plugin_directory() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_true() -> bool {
    true
}

fn default_shared_prefixes() -> Vec<String> {
    SharedPrefixes::DEFAULT.iter().map(|p| (*p).to_string()).collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_directory(),
            use_isolation: true,
            auto_load_on_startup: true,
            search_pattern: None,
            include: Vec::new(),
            exclude: Vec::new(),
            shared_prefixes: default_shared_prefixes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".plughost").join("config.yaml"))
    }
}
