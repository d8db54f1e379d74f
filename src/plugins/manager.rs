use futures::FutureExt;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Dispatch};

use super::api::{HostServices, Plugin};
use super::boundary::{ModuleBackend, SharedPrefixes};
use super::error::{panic_message, PluginError};
use super::loader::{LoadedPlugin, PluginLoader};
use super::metadata::{PluginInfo, PluginMetadata};
use super::resolver;
use crate::config::PluginConfig;

/// Owns the plugin registry and drives every plugin through its lifecycle
///
/// All registry mutations and lifecycle calls are serialized by a single
/// mutex. Failures of individual plugins are recorded in their metadata and
/// never abort a batch.
pub struct PluginManager {
    loader: Arc<PluginLoader>,
    host: Arc<HostServices>,
    use_isolation: bool,
    directory: Option<PathBuf>,
    include: Vec<String>,
    exclude: Vec<String>,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, PluginMetadata>,
    /// Names in the order they finished initializing
    init_order: Vec<String>,
    next_sequence: u64,
}

impl Registry {
    /// Add an entry, returning the entry it displaced under the same name
    fn register(&mut self, path: PathBuf, plugin: LoadedPlugin) -> Option<PluginMetadata> {
        let name = plugin.plugin().name().to_string();
        let metadata = PluginMetadata::new(path, plugin, self.next_sequence);
        self.next_sequence += 1;

        match self.entries.entry(name) {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(metadata);
                warn!(
                    plugin = %slot.key(),
                    previous = %previous.module_path().display(),
                    "Duplicate plugin name, replacing previous entry"
                );
                let name = slot.key();
                self.init_order.retain(|n| n != name);
                Some(previous)
            }
            Entry::Vacant(slot) => {
                slot.insert(metadata);
                None
            }
        }
    }

    fn mark_initialized(&mut self, name: &str) {
        self.init_order.retain(|n| n != name);
        self.init_order.push(name.to_string());
    }

    fn mark_shut_down(&mut self, name: &str) {
        self.init_order.retain(|n| n != name);
    }

    /// Entries in registration order
    fn ordered_mut(&mut self) -> Vec<&mut PluginMetadata> {
        let mut entries: Vec<_> = self.entries.values_mut().collect();
        entries.sort_by_key(|m| m.sequence);
        entries
    }
}

impl PluginManager {
    /// Create a manager.
    ///
    /// Unless `host` already carries one, the calling thread's current
    /// `tracing` dispatcher is added to it so plugin modules log through the
    /// host's subscriber.
    pub fn new(loader: PluginLoader, mut host: HostServices) -> Self {
        if !host.contains::<Dispatch>() {
            host.insert(tracing::dispatcher::get_default(Dispatch::clone));
        }
        Self {
            loader: Arc::new(loader),
            host: Arc::new(host),
            use_isolation: true,
            directory: None,
            include: Vec::new(),
            exclude: Vec::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Build a manager for dynamic-library plugins from configuration
    pub fn from_config(config: &PluginConfig, host: HostServices) -> Self {
        Self::from_config_with_backend(config, host, Arc::new(super::native::NativeBackend))
    }

    /// Build a manager from configuration using a specific module backend
    pub fn from_config_with_backend(
        config: &PluginConfig,
        host: HostServices,
        backend: Arc<dyn ModuleBackend>,
    ) -> Self {
        let mut loader = PluginLoader::with_backend(backend)
            .with_shared_prefixes(SharedPrefixes::new(&config.shared_prefixes));
        if let Some(pattern) = &config.search_pattern {
            loader = loader.with_search_pattern(pattern.clone());
        }

        let mut manager = Self::new(loader, host)
            .with_isolation(config.use_isolation)
            .with_filter(config.include.clone(), config.exclude.clone());
        manager.directory = Some(config.directory.clone());
        manager
    }

    #[must_use]
    pub fn with_isolation(mut self, use_isolation: bool) -> Self {
        self.use_isolation = use_isolation;
        self
    }

    /// Restrict which plugins get registered, by name.
    ///
    /// A non-empty `include` list admits only the named plugins; `exclude`
    /// always wins.
    #[must_use]
    pub fn with_filter(mut self, include: Vec<String>, exclude: Vec<String>) -> Self {
        self.include = include;
        self.exclude = exclude;
        self
    }

    #[must_use]
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    #[must_use]
    pub fn host_services(&self) -> &HostServices {
        &self.host
    }

    fn admits(&self, name: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|n| n == name);
        included && !self.exclude.iter().any(|n| n == name)
    }

    /// Load and initialize plugins from the configured directory
    pub async fn load_configured(&self, cancel: &CancellationToken) -> Result<usize, PluginError> {
        let directory = self
            .directory
            .clone()
            .ok_or(PluginError::InvalidArgument("no plugin directory configured"))?;
        self.load_and_initialize(&directory, cancel).await
    }

    /// Load every plugin under `directory`, validate it, and initialize the
    /// enabled ones in dependency order.
    ///
    /// Returns how many plugins reached the initialized state. Cancellation is
    /// checked before each plugin; plugins already initialized stay so.
    pub async fn load_and_initialize(
        &self,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize, PluginError> {
        if directory.as_os_str().is_empty() {
            return Err(PluginError::InvalidArgument("plugin directory cannot be empty"));
        }

        info!(directory = %directory.display(), "Loading plugins");
        let loaded = self.load_modules(directory).await;

        let mut registry = self.registry.lock().await;
        for (path, plugin) in loaded {
            let name = plugin.plugin().name().to_string();
            if !self.admits(&name) {
                info!(plugin = %name, "Plugin filtered out by configuration");
                drop(plugin);
                self.loader.unload(&path);
                continue;
            }

            if let Some(displaced) = registry.register(path.clone(), plugin) {
                self.retire(displaced, &path, cancel).await;
            }
            let Some(metadata) = registry.entries.get_mut(&name) else {
                continue;
            };
            if let Some(reason) = validate(metadata.plugin()) {
                let rejection = PluginError::ValidationRejected {
                    name: name.clone(),
                    reason: reason.clone(),
                };
                error!("{}", rejection);
                metadata.is_enabled = false;
                metadata.error_message = Some(reason);
            }
        }

        let count = self.initialize_pending(&mut registry, cancel).await;
        info!(count, "Loaded and initialized plugins");
        Ok(count)
    }

    /// Open every module under `directory` on the blocking pool.
    ///
    /// Opening a library runs its initializers and reads from disk, which must
    /// not stall the runtime's worker threads.
    async fn load_modules(&self, directory: &Path) -> BTreeMap<PathBuf, LoadedPlugin> {
        let loader = Arc::clone(&self.loader);
        let directory = directory.to_path_buf();
        let use_isolation = self.use_isolation;
        tokio::task::spawn_blocking(move || loader.load_all(&directory, use_isolation))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "Plugin loading task failed");
                BTreeMap::new()
            })
    }

    /// Shut down an entry replaced by a later plugin of the same name. Its
    /// module is released unless the replacement was loaded from the same path.
    async fn retire(&self, mut displaced: PluginMetadata, replacement: &Path, cancel: &CancellationToken) {
        let name = displaced.name().to_string();
        if displaced.is_initialized {
            info!(plugin = %name, "Shutting down replaced plugin");
            if let Err(message) = shutdown(&mut displaced, cancel).await {
                error!("{}", PluginError::Shutdown { name, message });
            }
        }
        let previous_path = displaced.module_path().to_path_buf();
        drop(displaced);
        if previous_path != replacement {
            self.loader.unload(&previous_path);
        }
    }

    async fn initialize_pending(&self, registry: &mut Registry, cancel: &CancellationToken) -> usize {
        let pending: Vec<String> = registry
            .ordered_mut()
            .into_iter()
            .filter(|m| m.is_enabled && !m.is_initialized)
            .map(|m| m.name().to_string())
            .collect();
        let graph: HashMap<String, Vec<String>> = registry
            .entries
            .iter()
            .map(|(name, m)| (name.clone(), m.plugin().dependencies()))
            .collect();

        let mut count = 0;
        for name in resolver::resolve_order(&pending, &graph) {
            if cancel.is_cancelled() {
                warn!("Plugin initialization cancelled");
                break;
            }
            let Some(metadata) = registry.entries.get_mut(&name) else {
                continue;
            };

            debug!(plugin = %name, "Initializing plugin");
            match initialize(metadata, &self.host, cancel).await {
                Ok(()) => {
                    metadata.is_initialized = true;
                    info!(plugin = %name, version = %metadata.plugin().version(), "Plugin initialized");
                    registry.mark_initialized(&name);
                    count += 1;
                }
                Err(message) => {
                    metadata.is_enabled = false;
                    metadata.error_message = Some(message.clone());
                    error!("{}", PluginError::Initialization { name, message });
                }
            }
        }
        count
    }

    /// Snapshot of one plugin's metadata
    pub async fn get_plugin(&self, name: &str) -> Option<PluginInfo> {
        self.registry.lock().await.entries.get(name).map(PluginMetadata::info)
    }

    /// First registered plugin whose concrete type is `T`.
    ///
    /// The registry stays locked while the guard is held.
    pub async fn get_plugin_of<T: Plugin>(&self) -> Option<MappedMutexGuard<'_, T>> {
        let registry = self.registry.lock().await;
        MutexGuard::try_map(registry, |registry| {
            registry
                .ordered_mut()
                .into_iter()
                .find_map(|m| m.plugin_mut().as_any_mut().downcast_mut::<T>())
        })
        .ok()
    }

    /// Snapshot of every registry entry by name
    pub async fn plugins(&self) -> BTreeMap<String, PluginInfo> {
        self.registry
            .lock()
            .await
            .entries
            .iter()
            .map(|(name, m)| (name.clone(), m.info()))
            .collect()
    }

    /// Names of initialized plugins in the order they were initialized
    pub async fn initialization_order(&self) -> Vec<String> {
        self.registry.lock().await.init_order.clone()
    }

    /// Enable a disabled plugin and initialize it.
    ///
    /// Returns `Ok(true)` if the plugin ends up enabled, `Ok(false)` if it is
    /// unknown or failed to initialize.
    pub async fn enable_plugin(&self, name: &str, cancel: &CancellationToken) -> Result<bool, PluginError> {
        if name.is_empty() {
            return Err(PluginError::InvalidArgument("plugin name cannot be empty"));
        }

        let mut registry = self.registry.lock().await;
        let Some(metadata) = registry.entries.get_mut(name) else {
            warn!(plugin = name, "Plugin not found");
            return Ok(false);
        };
        if metadata.is_enabled {
            info!(plugin = name, "Plugin already enabled");
            return Ok(true);
        }

        metadata.is_enabled = true;
        metadata.error_message = None;

        match initialize(metadata, &self.host, cancel).await {
            Ok(()) => {
                metadata.is_initialized = true;
                registry.mark_initialized(name);
                info!(plugin = name, "Plugin enabled");
                Ok(true)
            }
            Err(message) => {
                metadata.is_enabled = false;
                metadata.error_message = Some(message.clone());
                error!(
                    "{}",
                    PluginError::Initialization {
                        name: name.to_string(),
                        message
                    }
                );
                Ok(false)
            }
        }
    }

    /// Shut a plugin down and disable it.
    ///
    /// The plugin ends up disabled even if its shutdown fails; the failure is
    /// logged and stored as its error message.
    pub async fn disable_plugin(&self, name: &str, cancel: &CancellationToken) -> Result<bool, PluginError> {
        if name.is_empty() {
            return Err(PluginError::InvalidArgument("plugin name cannot be empty"));
        }

        let mut registry = self.registry.lock().await;
        let Some(metadata) = registry.entries.get_mut(name) else {
            warn!(plugin = name, "Plugin not found");
            return Ok(false);
        };
        if !metadata.is_enabled {
            info!(plugin = name, "Plugin already disabled");
            return Ok(true);
        }

        if let Err(message) = shutdown(metadata, cancel).await {
            metadata.error_message = Some(message.clone());
            error!(
                "{}",
                PluginError::Shutdown {
                    name: name.to_string(),
                    message
                }
            );
        }
        metadata.is_enabled = false;
        metadata.is_initialized = false;
        registry.mark_shut_down(name);
        info!(plugin = name, "Plugin disabled");
        Ok(true)
    }

    /// Shut down every initialized plugin in reverse initialization order,
    /// then clear the registry and release all isolation boundaries.
    ///
    /// If `cancel` fires between plugins the remaining plugins stay
    /// initialized and registered, so the call can be repeated.
    pub async fn shutdown_all(&self, cancel: &CancellationToken) {
        info!("Shutting down all plugins");

        let mut registry = self.registry.lock().await;
        let order: Vec<String> = registry.init_order.iter().rev().cloned().collect();

        for name in order {
            if cancel.is_cancelled() {
                warn!("Plugin shutdown cancelled");
                return;
            }
            let Some(metadata) = registry.entries.get_mut(&name) else {
                continue;
            };

            debug!(plugin = %name, "Shutting down plugin");
            if let Err(message) = shutdown(metadata, cancel).await {
                error!("{}", PluginError::Shutdown { name: name.clone(), message });
            }
            metadata.is_initialized = false;
            registry.mark_shut_down(&name);
        }

        // Instances go first so none outlives the module holding its code.
        registry.entries.clear();
        registry.init_order.clear();
        drop(registry);
        self.loader.unload_all();

        info!("All plugins shut down");
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("loader", &self.loader)
            .field("use_isolation", &self.use_isolation)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

fn validate(plugin: &dyn Plugin) -> Option<String> {
    std::panic::catch_unwind(AssertUnwindSafe(|| plugin.validate()))
        .unwrap_or_else(|payload| Some(format!("validation panicked: {}", panic_message(payload.as_ref()))))
}

async fn initialize(
    metadata: &mut PluginMetadata,
    host: &HostServices,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let outcome = AssertUnwindSafe(metadata.plugin_mut().initialize(host, cancel))
        .catch_unwind()
        .await;
    flatten(outcome)
}

async fn shutdown(metadata: &mut PluginMetadata, cancel: &CancellationToken) -> Result<(), String> {
    let outcome = AssertUnwindSafe(metadata.plugin_mut().shutdown(cancel))
        .catch_unwind()
        .await;
    flatten(outcome)
}

fn flatten(
    outcome: Result<anyhow::Result<()>, Box<dyn std::any::Any + Send>>,
) -> Result<(), String> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("plugin panicked: {}", panic_message(payload.as_ref()))),
    }
}
