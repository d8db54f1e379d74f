//! Plugin system: discovery, isolated loading, dependency ordering and
//! lifecycle management.
//!
//! - [`loader`] finds module files and opens each in its own
//!   [`boundary::IsolationBoundary`]
//! - [`resolver`] orders plugins by their declared dependencies
//! - [`manager`] owns the registry and drives initialize/shutdown
//!
//! Plugin crates implement [`api::Plugin`] and export their types with
//! [`declare_plugin!`](crate::declare_plugin).

pub mod api;
pub mod boundary;
pub mod error;
pub mod guard;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod native;
pub mod resolver;

pub use api::{HostServices, Plugin, PluginRegistrar, PLUGIN_API_VERSION};
pub use boundary::{IsolationBoundary, ModuleBackend, Resolution, SharedPrefixes, StaticBackend};
pub use error::PluginError;
pub use guard::PanicGuard;
pub use loader::{LoadedPlugin, PluginLoader};
pub use manager::PluginManager;
pub use metadata::{PluginInfo, PluginMetadata};
pub use native::NativeBackend;
