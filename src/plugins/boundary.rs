//! Isolation boundaries
//!
//! Every plugin module is opened inside an [`IsolationBoundary`], its own
//! symbol-resolution scope. Symbols whose names match the shared-prefix
//! allow-list always resolve against the host's single copy so the contract
//! types a plugin sees are the host's own; everything else resolves only
//! inside the module. Other plugins' boundaries are never searched.
//!
//! A Rust `cdylib` still carries private copies of the crates it links. Host
//! state reaches those copies through [`HostServices`](super::api::HostServices):
//! configuration by type name, and the host's `tracing` dispatcher, which
//! guarded plugins install as their module's global default.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::api::{
    Plugin, PluginRegistrar, RegisteredFactory, API_VERSION_SYMBOL, BUILD_ID, BUILD_ID_SYMBOL,
    PLUGIN_API_VERSION, REGISTER_SYMBOL,
};
use super::error::{panic_message, PluginError};
use super::loader::LoadedPlugin;
use super::native;

/// Where a name was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Found inside the module's own scope
    Local(T),
    /// Delegated to the host's default scope
    Host(T),
    NotFound,
}

impl<T> Resolution<T> {
    #[must_use]
    pub fn is_found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Local(value) | Self::Host(value) => Some(value),
            Self::NotFound => None,
        }
    }
}

/// Allow-list of name prefixes that always resolve against the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPrefixes {
    prefixes: Vec<String>,
}

impl SharedPrefixes {
    /// Host contract plus common infrastructure namespaces
    pub const DEFAULT: &'static [&'static str] = &[
        "plughost::",
        "plughost_",
        "std::",
        "core::",
        "alloc::",
        "tokio::",
        "tracing::",
    ];

    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Whether `name` belongs to a shared namespace.
    ///
    /// Matching is ASCII case-insensitive. A bare namespace name (`std` for
    /// the prefix `std::`) is shared as well.
    #[must_use]
    pub fn is_shared(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.prefixes.iter().any(|prefix| {
            name.starts_with(prefix.as_str())
                || name == prefix.trim_end_matches(|c| c == ':' || c == '_' || c == '.')
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }
}

impl Default for SharedPrefixes {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

/// An independent symbol-resolution scope holding one plugin module
pub trait IsolationBoundary: Send + Sync {
    /// Path the module was opened from
    fn module_path(&self) -> &Path;

    /// Whether the boundary can be released independently of the host
    fn is_collectible(&self) -> bool;

    fn shared_prefixes(&self) -> &SharedPrefixes;

    /// Resolve a symbol to its address.
    ///
    /// Shared names go to the host scope, everything else to the module's own
    /// scope. A released boundary resolves nothing locally.
    fn resolve(&self, symbol: &str) -> Resolution<usize>;

    /// Resolve a native library dependency to the file that would be loaded
    fn resolve_native(&self, library: &str) -> Resolution<PathBuf> {
        if self.shared_prefixes().is_shared(library) {
            return Resolution::Host(PathBuf::from(libloading::library_filename(library)));
        }
        let Some(dir) = self.module_path().parent() else {
            return Resolution::NotFound;
        };
        [dir.join(libloading::library_filename(library)), dir.join(library)]
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map_or(Resolution::NotFound, Resolution::Local)
    }

    /// Plugin types the module registers, in registration order
    fn capabilities(&self) -> Result<Vec<RegisteredFactory>, PluginError>;

    /// Create an instance of one of the module's plugin types
    fn instantiate(&self, factory: &RegisteredFactory) -> Result<LoadedPlugin, PluginError>;

    /// Give up the module. No-op for non-collectible boundaries.
    fn release(&self);

    fn is_released(&self) -> bool;
}

/// Opens plugin modules into isolation boundaries
pub trait ModuleBackend: Send + Sync {
    /// Open the module at `path`.
    ///
    /// `isolated` selects a fresh collectible boundary; otherwise the module
    /// joins the host's default scope and stays resident.
    fn open(
        &self,
        path: &Path,
        isolated: bool,
        shared: &SharedPrefixes,
    ) -> Result<Arc<dyn IsolationBoundary>, PluginError>;

    /// File pattern matching candidate modules for this backend
    fn default_pattern(&self) -> String;
}

/// Run a module's registration entry point, turning a panic or a recorded
/// registration failure into a load error
pub(crate) fn collect_factories(
    path: &Path,
    register: impl FnOnce(&mut PluginRegistrar),
) -> Result<Vec<RegisteredFactory>, PluginError> {
    let mut registrar = PluginRegistrar::new();
    panic::catch_unwind(AssertUnwindSafe(|| register(&mut registrar))).map_err(|payload| {
        PluginError::load(
            path,
            format!("module registration panicked: {}", panic_message(payload.as_ref())),
        )
    })?;
    registrar
        .finish()
        .map_err(|message| PluginError::load(path, format!("module registration panicked: {message}")))
}

/// Call a plugin constructor, turning a panic into a load error
pub(crate) fn create_instance(
    path: &Path,
    factory: &RegisteredFactory,
) -> Result<Box<dyn Plugin>, PluginError> {
    factory.construct().map_err(|message| {
        PluginError::load(
            path,
            format!("{} constructor panicked: {message}", factory.type_name),
        )
    })
}

/// Registration function of a statically linked module
pub type ModuleRegistration = fn(&mut PluginRegistrar);

/// Backend for plugin modules linked into the host binary.
///
/// A module file is matched to a registration function by its file stem, so
/// `plugins/audit.plugin` opens the module registered as `"audit"`.
#[derive(Debug, Default)]
pub struct StaticBackend {
    modules: HashMap<String, ModuleRegistration>,
}

impl StaticBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_module(mut self, stem: impl Into<String>, registration: ModuleRegistration) -> Self {
        self.modules.insert(stem.into(), registration);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleBackend for StaticBackend {
    fn open(
        &self,
        path: &Path,
        isolated: bool,
        shared: &SharedPrefixes,
    ) -> Result<Arc<dyn IsolationBoundary>, PluginError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PluginError::load(path, "module path has no file stem"))?;

        let registration = self.modules.get(stem).copied().ok_or_else(|| {
            PluginError::load(path, format!("no statically linked module named '{stem}'"))
        })?;

        Ok(Arc::new(StaticBoundary {
            path: path.to_path_buf(),
            registration,
            collectible: isolated,
            released: AtomicBool::new(false),
            shared: shared.clone(),
        }))
    }

    fn default_pattern(&self) -> String {
        "*".to_string()
    }
}

struct StaticBoundary {
    path: PathBuf,
    registration: ModuleRegistration,
    collectible: bool,
    released: AtomicBool,
    shared: SharedPrefixes,
}

impl StaticBoundary {
    fn ensure_live(&self) -> Result<(), PluginError> {
        if self.is_released() {
            return Err(PluginError::load(&self.path, "isolation boundary already released"));
        }
        Ok(())
    }
}

impl IsolationBoundary for StaticBoundary {
    fn module_path(&self) -> &Path {
        &self.path
    }

    fn is_collectible(&self) -> bool {
        self.collectible
    }

    fn shared_prefixes(&self) -> &SharedPrefixes {
        &self.shared
    }

    fn resolve(&self, symbol: &str) -> Resolution<usize> {
        if self.shared.is_shared(symbol) {
            return native::resolve_in_host(symbol);
        }
        if self.is_released() {
            return Resolution::NotFound;
        }
        match symbol {
            REGISTER_SYMBOL => Resolution::Local(self.registration as usize),
            API_VERSION_SYMBOL => Resolution::Local(&PLUGIN_API_VERSION as *const u32 as usize),
            BUILD_ID_SYMBOL => Resolution::Local(BUILD_ID.as_ptr() as usize),
            _ => Resolution::NotFound,
        }
    }

    fn capabilities(&self) -> Result<Vec<RegisteredFactory>, PluginError> {
        self.ensure_live()?;
        collect_factories(&self.path, self.registration)
    }

    fn instantiate(&self, factory: &RegisteredFactory) -> Result<LoadedPlugin, PluginError> {
        self.ensure_live()?;
        let plugin = create_instance(&self.path, factory)?;
        Ok(LoadedPlugin::new(plugin, factory.type_name, None))
    }

    fn release(&self) {
        if self.collectible {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
