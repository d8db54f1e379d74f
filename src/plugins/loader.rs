use libloading::Library;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use super::api::Plugin;
use super::boundary::{IsolationBoundary, ModuleBackend, SharedPrefixes};
use super::error::PluginError;
use super::native::NativeBackend;

/// A plugin instance together with the module that holds its code
pub struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    type_name: &'static str,
    // Declared after `plugin`: the instance is dropped before its library can unmap.
    _module: Option<Arc<Library>>,
}

impl LoadedPlugin {
    pub(crate) fn new(
        plugin: Box<dyn Plugin>,
        type_name: &'static str,
        module: Option<Arc<Library>>,
    ) -> Self {
        Self {
            plugin,
            type_name,
            _module: module,
        }
    }

    #[must_use]
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn Plugin {
        self.plugin.as_mut()
    }

    /// Rust type name the module registered the plugin under
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.plugin.name())
            .field("version", &self.plugin.version())
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Discovers plugin modules and loads them into isolation boundaries
pub struct PluginLoader {
    backend: Arc<dyn ModuleBackend>,
    shared_prefixes: SharedPrefixes,
    search_pattern: String,
    /// Collectible boundaries by module path
    boundaries: Mutex<HashMap<PathBuf, Arc<dyn IsolationBoundary>>>,
}

impl PluginLoader {
    /// Create a loader for dynamic-library plugins
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(Arc::new(NativeBackend))
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn ModuleBackend>) -> Self {
        let search_pattern = backend.default_pattern();
        Self {
            backend,
            shared_prefixes: SharedPrefixes::default(),
            search_pattern,
            boundaries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_search_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.search_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn with_shared_prefixes(mut self, shared_prefixes: SharedPrefixes) -> Self {
        self.shared_prefixes = shared_prefixes;
        self
    }

    /// Pattern used by [`PluginLoader::load_all`]
    #[must_use]
    pub fn search_pattern(&self) -> &str {
        &self.search_pattern
    }

    #[must_use]
    pub fn shared_prefixes(&self) -> &SharedPrefixes {
        &self.shared_prefixes
    }

    /// Find candidate module files under `directory`, recursing into subdirectories.
    ///
    /// Never fails: a missing directory logs a warning and an unreadable one
    /// logs an error, both yielding an empty list.
    pub fn discover(&self, directory: &Path, pattern: &str) -> Vec<PathBuf> {
        if !directory.is_dir() {
            warn!(directory = %directory.display(), "Plugin directory does not exist");
            return Vec::new();
        }

        match Self::try_discover(directory, pattern) {
            Ok(paths) => {
                info!(
                    count = paths.len(),
                    directory = %directory.display(),
                    "Discovered candidate plugin modules"
                );
                paths
            }
            Err(e) => {
                error!("{}", e);
                Vec::new()
            }
        }
    }

    fn try_discover(directory: &Path, pattern: &str) -> Result<Vec<PathBuf>, PluginError> {
        let discovery_error = |message: String| PluginError::Discovery {
            directory: directory.to_path_buf(),
            message,
        };

        let root = directory
            .to_str()
            .ok_or_else(|| discovery_error("directory path is not valid UTF-8".to_string()))?;
        let full_pattern = format!("{}/**/{}", glob::Pattern::escape(root), pattern);

        let entries = glob::glob(&full_pattern).map_err(|e| discovery_error(e.to_string()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| discovery_error(e.to_string()))?;
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Load a single plugin module.
    ///
    /// With `use_isolation` the module gets its own collectible boundary,
    /// retained until [`PluginLoader::unload`]. Any failure is logged and
    /// yields `None`.
    pub fn load(&self, path: &Path, use_isolation: bool) -> Option<LoadedPlugin> {
        match self.try_load(path, use_isolation) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    fn try_load(&self, path: &Path, use_isolation: bool) -> Result<Option<LoadedPlugin>, PluginError> {
        if !path.is_file() {
            return Err(PluginError::load(path, "module file not found"));
        }

        debug!(path = %path.display(), isolated = use_isolation, "Loading plugin");
        let boundary = self.backend.open(path, use_isolation, &self.shared_prefixes)?;

        match Self::instantiate(&*boundary) {
            Ok(Some(loaded)) => {
                if use_isolation {
                    self.retain(path, boundary);
                }
                info!(
                    plugin = %loaded.plugin().name(),
                    version = %loaded.plugin().version(),
                    path = %path.display(),
                    "Loaded plugin"
                );
                Ok(Some(loaded))
            }
            other => {
                boundary.release();
                other
            }
        }
    }

    fn instantiate(boundary: &dyn IsolationBoundary) -> Result<Option<LoadedPlugin>, PluginError> {
        let path = boundary.module_path();
        let factories = boundary.capabilities()?;

        let Some(factory) = factories.first() else {
            warn!(path = %path.display(), "No plugin types found in module");
            return Ok(None);
        };
        if factories.len() > 1 {
            warn!(
                path = %path.display(),
                count = factories.len(),
                chosen = factory.type_name,
                "Multiple plugin types found in module, using the first"
            );
        }

        boundary.instantiate(factory).map(Some)
    }

    fn retain(&self, path: &Path, boundary: Arc<dyn IsolationBoundary>) {
        let previous = self
            .boundaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), boundary);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    /// Discover and load every module under `directory` using the loader's search pattern.
    ///
    /// Modules that fail to load are left out of the result.
    pub fn load_all(&self, directory: &Path, use_isolation: bool) -> BTreeMap<PathBuf, LoadedPlugin> {
        let mut loaded = BTreeMap::new();
        for path in self.discover(directory, &self.search_pattern) {
            if let Some(plugin) = self.load(&path, use_isolation) {
                loaded.insert(path, plugin);
            }
        }

        info!(
            count = loaded.len(),
            directory = %directory.display(),
            "Loaded plugins from directory"
        );
        loaded
    }

    /// Release the isolation boundary of a module. No-op if there is none.
    pub fn unload(&self, path: &Path) {
        let boundary = self
            .boundaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        if let Some(boundary) = boundary {
            info!(path = %path.display(), "Unloading plugin");
            boundary.release();
        }
    }

    /// Release every retained isolation boundary
    pub fn unload_all(&self) {
        let boundaries: Vec<_> = self
            .boundaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        info!(count = boundaries.len(), "Unloading all plugins");
        for (_, boundary) in boundaries {
            boundary.release();
        }
    }

    /// Whether `path` currently has a retained isolation boundary
    #[must_use]
    pub fn is_isolated(&self, path: &Path) -> bool {
        self.boundaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// Paths with a retained isolation boundary, sorted
    #[must_use]
    pub fn isolated_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .boundaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("search_pattern", &self.search_pattern)
            .field("shared_prefixes", &self.shared_prefixes)
            .field("isolated", &self.isolated_paths())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::api::{HostServices, PluginRegistrar};
    use crate::plugins::boundary::StaticBackend;
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Tool;

    #[async_trait]
    impl Plugin for Tool {
        fn name(&self) -> &str {
            "tool"
        }

        fn version(&self) -> &str {
            "2.0.0"
        }

        async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn loader() -> PluginLoader {
        let backend = StaticBackend::new()
            .with_module("tool", |r: &mut PluginRegistrar| r.register::<Tool>())
            .with_module("empty", |_| {})
            .with_module("twice", |r: &mut PluginRegistrar| {
                r.register_factory("first", || Box::new(Tool));
                r.register_factory("second", || Box::new(Tool));
            });
        PluginLoader::with_backend(Arc::new(backend)).with_search_pattern("*.plugin")
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_loader_creation() {
        let loader = PluginLoader::new();
        assert_eq!(loader.search_pattern(), NativeBackend.default_pattern());
        assert!(loader.isolated_paths().is_empty());
    }

    #[test]
    fn test_discover_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(loader().discover(&missing, "*.plugin").is_empty());
    }

    #[test]
    fn test_discover_recurses_and_filters() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("tool.plugin"));
        touch(&dir.path().join("nested/deeper/empty.plugin"));
        touch(&dir.path().join("README.md"));
        std::fs::create_dir_all(dir.path().join("folder.plugin")).unwrap();

        let found = loader().discover(dir.path(), "*.plugin");
        assert_eq!(
            found,
            vec![
                dir.path().join("nested/deeper/empty.plugin"),
                dir.path().join("tool.plugin"),
            ]
        );
    }

    #[test]
    fn test_discover_invalid_pattern_is_empty() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("tool.plugin"));
        assert!(loader().discover(dir.path(), "[").is_empty());
    }

    #[test]
    fn test_load_isolated_retains_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tool.plugin");
        touch(&path);

        let loader = loader();
        let loaded = loader.load(&path, true).expect("tool should load");
        assert_eq!(loaded.plugin().name(), "tool");
        assert!(loader.is_isolated(&path));

        loader.unload(&path);
        assert!(!loader.is_isolated(&path));
        // unloading twice is a no-op
        loader.unload(&path);
    }

    #[test]
    fn test_load_shared_scope_is_not_retained() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tool.plugin");
        touch(&path);

        let loader = loader();
        assert!(loader.load(&path, false).is_some());
        assert!(!loader.is_isolated(&path));
        loader.unload(&path);
    }

    #[test]
    fn test_load_without_plugin_types_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.plugin");
        touch(&path);

        let loader = loader();
        assert!(loader.load(&path, true).is_none());
        assert!(!loader.is_isolated(&path));
    }

    #[test]
    fn test_load_with_several_plugin_types_picks_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.plugin");
        touch(&path);

        let loaded = loader().load(&path, true).expect("first type should load");
        assert_eq!(loaded.type_name(), "first");
    }

    #[test]
    fn test_load_missing_file_returns_none() {
        let dir = tempdir().unwrap();
        assert!(loader().load(&dir.path().join("tool.plugin"), true).is_none());
    }

    #[test]
    fn test_unload_all_releases_everything() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a/tool.plugin"));
        touch(&dir.path().join("b/tool.plugin"));

        let loader = loader();
        let loaded = loader.load_all(dir.path(), true);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loader.isolated_paths().len(), 2);

        drop(loaded);
        loader.unload_all();
        assert!(loader.isolated_paths().is_empty());
    }
}
