use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::api::{
    PluginRegisterFn, RegisteredFactory, API_VERSION_SYMBOL, BUILD_ID, BUILD_ID_SYMBOL,
    PLUGIN_API_VERSION, REGISTER_SYMBOL,
};
use super::boundary::{
    collect_factories, create_instance, IsolationBoundary, ModuleBackend, Resolution,
    SharedPrefixes,
};
use super::error::PluginError;
use super::loader::LoadedPlugin;

/// Handle on the host process image, used for shared-name resolution
static HOST_SCOPE: Lazy<Option<Library>> = Lazy::new(|| {
    #[cfg(unix)]
    {
        Some(libloading::os::unix::Library::this().into())
    }
    #[cfg(windows)]
    {
        libloading::os::windows::Library::this().ok().map(Into::into)
    }
});

/// Look a symbol up in the host's default scope
pub(crate) fn resolve_in_host(symbol: &str) -> Resolution<usize> {
    let Some(host) = HOST_SCOPE.as_ref() else {
        return Resolution::NotFound;
    };
    // Safety: the symbol is only located, never called or read here
    match unsafe { host.get::<*const c_void>(symbol.as_bytes()) } {
        Ok(address) => Resolution::Host(*address as usize),
        Err(_) => Resolution::NotFound,
    }
}

/// Backend loading plugin modules as dynamic libraries
///
/// Isolated modules are opened with `RTLD_LOCAL` so their symbols never leak
/// into other modules. Non-isolated modules are opened into the global scope
/// and stay mapped for the life of the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl ModuleBackend for NativeBackend {
    fn open(
        &self,
        path: &Path,
        isolated: bool,
        shared: &SharedPrefixes,
    ) -> Result<Arc<dyn IsolationBoundary>, PluginError> {
        let library =
            open_library(path, isolated).map_err(|e| PluginError::load(path, e.to_string()))?;
        debug!(path = %path.display(), isolated, "Opened plugin library");
        Ok(Arc::new(NativeBoundary::new(path, library, isolated, shared.clone())))
    }

    fn default_pattern(&self) -> String {
        format!("*{}", std::env::consts::DLL_SUFFIX)
    }
}

fn open_library(path: &Path, isolated: bool) -> Result<Library, libloading::Error> {
    #[cfg(unix)]
    {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};
        let scope = if isolated { RTLD_LOCAL } else { RTLD_GLOBAL };
        // Safety: running a module's initialisers is the point of loading it
        unsafe { UnixLibrary::open(Some(path), RTLD_NOW | scope) }.map(Into::into)
    }
    #[cfg(windows)]
    {
        // Windows resolves imports per module, so both modes open the same way
        let _ = isolated;
        unsafe { Library::new(path) }
    }
}

/// A dynamic library opened for one plugin module
pub struct NativeBoundary {
    path: PathBuf,
    library: Mutex<Option<Arc<Library>>>,
    collectible: bool,
    shared: SharedPrefixes,
}

impl NativeBoundary {
    fn new(path: &Path, library: Library, collectible: bool, shared: SharedPrefixes) -> Self {
        let library = Arc::new(library);
        if !collectible {
            // Default-scope modules are never unmapped.
            std::mem::forget(Arc::clone(&library));
        }
        Self {
            path: path.to_path_buf(),
            library: Mutex::new(Some(library)),
            collectible,
            shared,
        }
    }

    fn library(&self) -> Result<Arc<Library>, PluginError> {
        self.library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PluginError::load(&self.path, "isolation boundary already released"))
    }

    fn check_api_version(&self, library: &Library) -> Result<(), PluginError> {
        // Safety: the declare_plugin! macro exports this symbol as a `u32` static
        let version = unsafe {
            let symbol: Symbol<*const u32> = library
                .get(API_VERSION_SYMBOL.as_bytes())
                .map_err(|e| PluginError::load(&self.path, format!("missing {API_VERSION_SYMBOL}: {e}")))?;
            **symbol
        };
        if version != PLUGIN_API_VERSION {
            return Err(PluginError::load(
                &self.path,
                format!("plugin API version {version} does not match host version {PLUGIN_API_VERSION}"),
            ));
        }
        Ok(())
    }

    /// Refuse modules built from a different `plughost` release or compiler
    fn check_build_id(&self, library: &Library) -> Result<(), PluginError> {
        // Safety: declare_plugin! exports this as a function returning a
        // pointer to a static NUL-terminated string
        let module_build = unsafe {
            let symbol: Symbol<unsafe extern "C" fn() -> *const c_char> = library
                .get(BUILD_ID_SYMBOL.as_bytes())
                .map_err(|e| PluginError::load(&self.path, format!("missing {BUILD_ID_SYMBOL}: {e}")))?;
            let raw = symbol();
            if raw.is_null() {
                return Err(PluginError::load(&self.path, format!("{BUILD_ID_SYMBOL} returned null")));
            }
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        };
        let host_build = host_build_id();
        if module_build != host_build {
            return Err(PluginError::load(
                &self.path,
                format!("module built with '{module_build}' but host is '{host_build}'"),
            ));
        }
        Ok(())
    }
}

fn host_build_id() -> &'static str {
    BUILD_ID.trim_end_matches('\0')
}

impl IsolationBoundary for NativeBoundary {
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
            return resolve_in_host(symbol);
        }
        let Ok(library) = self.library() else {
            return Resolution::NotFound;
        };
        // Safety: the symbol is only located, never called or read here
        match unsafe { library.get::<*const c_void>(symbol.as_bytes()) } {
            Ok(address) => Resolution::Local(*address as usize),
            Err(_) => Resolution::NotFound,
        }
    }

    fn capabilities(&self) -> Result<Vec<RegisteredFactory>, PluginError> {
        let library = self.library()?;

        if !self.resolve(REGISTER_SYMBOL).is_local() {
            return Err(PluginError::load(
                &self.path,
                format!("module does not export {REGISTER_SYMBOL}"),
            ));
        }
        self.check_api_version(&library)?;
        self.check_build_id(&library)?;

        // Safety: the signature is fixed by declare_plugin! and guarded by the API version check
        let register: Symbol<PluginRegisterFn> = unsafe { library.get(REGISTER_SYMBOL.as_bytes()) }
            .map_err(|e| PluginError::load(&self.path, e.to_string()))?;

        collect_factories(&self.path, |registrar| unsafe { register(registrar) })
    }

    fn instantiate(&self, factory: &RegisteredFactory) -> Result<LoadedPlugin, PluginError> {
        let library = self.library()?;
        let plugin = create_instance(&self.path, factory)?;
        Ok(LoadedPlugin::new(plugin, factory.type_name, Some(library)))
    }

    fn release(&self) {
        if !self.collectible {
            return;
        }
        let released = self
            .library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            debug!(path = %self.path.display(), "Released plugin library");
        }
    }

    fn is_released(&self) -> bool {
        self.library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
