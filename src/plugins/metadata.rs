use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use super::api::Plugin;
use super::loader::LoadedPlugin;

/// Registry entry for one plugin, owned and mutated by the plugin manager
#[derive(Debug)]
pub struct PluginMetadata {
    plugin: LoadedPlugin,
    module_path: PathBuf,
    loaded_at: DateTime<Utc>,
    pub(crate) sequence: u64,
    pub(crate) is_initialized: bool,
    pub(crate) is_enabled: bool,
    pub(crate) error_message: Option<String>,
}

impl PluginMetadata {
    pub(crate) fn new(module_path: PathBuf, plugin: LoadedPlugin, sequence: u64) -> Self {
        Self {
            plugin,
            module_path,
            loaded_at: Utc::now(),
            sequence,
            is_initialized: false,
            is_enabled: true,
            error_message: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.plugin.plugin().name()
    }

    #[must_use]
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.plugin()
    }

    pub(crate) fn plugin_mut(&mut self) -> &mut dyn Plugin {
        self.plugin.plugin_mut()
    }

    #[must_use]
    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.plugin.type_name()
    }

    /// Detached copy of this entry for status reporting
    #[must_use]
    pub fn info(&self) -> PluginInfo {
        let plugin = self.plugin();
        PluginInfo {
            name: plugin.name().to_string(),
            version: plugin.version().to_string(),
            description: plugin.description().to_string(),
            author: plugin.author().to_string(),
            dependencies: plugin.dependencies(),
            module_path: self.module_path.clone(),
            loaded_at: self.loaded_at,
            is_initialized: self.is_initialized,
            is_enabled: self.is_enabled,
            error_message: self.error_message.clone(),
            type_name: self.type_name().to_string(),
        }
    }
}

impl fmt::Display for PluginMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_status_line(
            f,
            self.name(),
            self.plugin().version(),
            self.is_initialized,
            self.is_enabled,
            self.error_message.as_deref(),
        )
    }
}

/// Snapshot of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<String>,
    pub module_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
    pub is_initialized: bool,
    pub is_enabled: bool,
    pub error_message: Option<String>,
    pub type_name: String,
}

impl fmt::Display for PluginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_status_line(
            f,
            &self.name,
            &self.version,
            self.is_initialized,
            self.is_enabled,
            self.error_message.as_deref(),
        )
    }
}

fn write_status_line(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    version: &str,
    is_initialized: bool,
    is_enabled: bool,
    error_message: Option<&str>,
) -> fmt::Result {
    match (error_message, is_enabled, is_initialized) {
        (Some(error), _, _) => write!(f, "{name} v{version} (Error: {error})"),
        (None, false, _) => write!(f, "{name} v{version} (Disabled)"),
        (None, true, true) => write!(f, "{name} v{version} (Initialized)"),
        (None, true, false) => write!(f, "{name} v{version} (Not Initialized)"),
    }
}
