use std::path::PathBuf;

/// Errors produced while discovering, loading and driving plugins
///
/// Only [`PluginError::InvalidArgument`] ever leaves the manager's public
/// surface. Every other variant is logged and recorded in the affected
/// plugin's metadata.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Failed to discover plugins in {}: {message}", .directory.display())]
    Discovery { directory: PathBuf, message: String },

    #[error("Failed to load plugin module {}: {message}", .path.display())]
    Load { path: PathBuf, message: String },

    #[error("Plugin {name} rejected by validation: {reason}")]
    ValidationRejected { name: String, reason: String },

    #[error("Plugin {name} failed to initialize: {message}")]
    Initialization { name: String, message: String },

    #[error("Plugin {name} failed to shut down: {message}")]
    Shutdown { name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl PluginError {
    pub(crate) fn load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Extract a printable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic reason".to_string()
    }
}
