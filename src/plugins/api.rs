//! Plugin API definitions shared by the host and every plugin module

use anyhow::Result;
use async_trait::async_trait;
use std::alloc::Layout;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::panic_message;
use super::guard;

/// Version of the module ABI. A module built against a different version is rejected at load.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Registration entry point every plugin module exports
pub const REGISTER_SYMBOL: &str = "_plugin_register";

/// Exported `u32` holding the `PLUGIN_API_VERSION` the module was built with
pub const API_VERSION_SYMBOL: &str = "_plugin_api_version";

/// Exported `extern "C"` function returning the module's [`BUILD_ID`]
pub const BUILD_ID_SYMBOL: &str = "_plugin_build_id";

/// `plughost` version and compiler that built this copy of the crate, NUL-terminated.
///
/// Host and module must agree on it: types shared through [`HostServices`]
/// are matched by name and layout, which only holds for identical builds.
pub const BUILD_ID: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " ",
    env!("PLUGHOST_RUSTC_VERSION"),
    "\0"
);

/// Plugin API trait that all plugins must implement
///
/// Instances are created through a [`PluginFactory`] (usually `T::default()`),
/// validated, then initialized in dependency order. Failures are reported by
/// returning an error; the manager records the error text and disables the plugin.
#[async_trait]
pub trait Plugin: AsAny + Send + Sync {
    /// Unique plugin name, used as the registry key
    fn name(&self) -> &str;

    /// Semantic version string
    fn version(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn author(&self) -> &str {
        ""
    }

    /// Names of plugins that must be initialized before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Check whether the plugin can run in this environment.
    ///
    /// `None` means ready; `Some(reason)` keeps the plugin registered but disabled.
    fn validate(&self) -> Option<String> {
        None
    }

    /// Initialize the plugin
    async fn initialize(&mut self, host: &HostServices, cancel: &CancellationToken) -> Result<()>;

    /// Shutdown the plugin
    async fn shutdown(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Dynamic type access for plugins, implemented for every `'static` type
///
/// Call these on a `&dyn Plugin` (or `&mut dyn Plugin` for `as_any_mut`).
/// Calling them on a `Box<dyn Plugin>` resolves to the box itself.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Concrete type name of the implementation
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Services the host exposes to plugins during initialization
///
/// A plugin module links its own copy of every crate, so a `TypeId` taken
/// inside the module never equals the host's for the same type. Services are
/// therefore keyed by [`std::any::type_name`] and checked against the value's
/// layout; the module handshake ([`BUILD_ID`]) makes sure both sides compiled
/// the type from the same source with the same compiler.
#[derive(Clone, Default)]
pub struct HostServices {
    services: HashMap<String, Service>,
}

#[derive(Clone)]
struct Service {
    type_id: TypeId,
    layout: Layout,
    value: Arc<dyn Any + Send + Sync>,
}

impl HostServices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous service of the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, service: T) -> &mut Self {
        self.insert_arc(Arc::new(service))
    }

    pub fn insert_arc<T: Any + Send + Sync>(&mut self, service: Arc<T>) -> &mut Self {
        self.services.insert(
            std::any::type_name::<T>().to_string(),
            Service {
                type_id: TypeId::of::<T>(),
                layout: Layout::new::<T>(),
                value: service,
            },
        );
        self
    }

    /// Look up a service by type
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let service = self.services.get(std::any::type_name::<T>())?;
        if service.type_id == TypeId::of::<T>() {
            return Arc::clone(&service.value).downcast::<T>().ok();
        }
        if service.layout != Layout::new::<T>() {
            return None;
        }

        let raw = Arc::into_raw(Arc::clone(&service.value)).cast::<T>();
        // Safety: another copy of the same crate registered this value under the
        // same type name and layout, and the module handshake guarantees the
        // copies are identical builds
        Some(unsafe { Arc::from_raw(raw) })
    }

    #[must_use]
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.services
            .get(std::any::type_name::<T>())
            .is_some_and(|service| service.layout == Layout::new::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("services", &self.services.len())
            .finish()
    }
}

/// Function that instantiates a plugin
pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// Constructor that contains its own panics, reporting them as `Err`
pub type GuardedFactory = fn() -> Result<Box<dyn Plugin>, String>;

/// Signature of the `_plugin_register` entry point exported by plugin modules
pub type PluginRegisterFn = unsafe fn(&mut PluginRegistrar);

#[derive(Clone, Copy)]
pub enum Constructor {
    /// Runs in the caller's runtime, which catches its panics
    Plain(PluginFactory),
    /// Compiled into the plugin module and catches panics there
    Guarded(GuardedFactory),
}

/// A plugin type a module offers, in registration order
#[derive(Clone, Copy)]
pub struct RegisteredFactory {
    pub type_name: &'static str,
    pub create: Constructor,
}

impl RegisteredFactory {
    /// Create an instance. A panicking constructor yields its panic message.
    pub fn construct(&self) -> Result<Box<dyn Plugin>, String> {
        match self.create {
            Constructor::Plain(create) => {
                panic::catch_unwind(create).map_err(|payload| panic_message(payload.as_ref()))
            }
            Constructor::Guarded(create) => create(),
        }
    }
}

impl fmt::Debug for RegisteredFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFactory")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Collects the plugin types a module registers from its entry point
#[derive(Debug, Default)]
pub struct PluginRegistrar {
    factories: Vec<RegisteredFactory>,
    failure: Option<String>,
}

impl PluginRegistrar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin type constructed through `Default`
    pub fn register<T: Plugin + Default>(&mut self) {
        self.factories.push(RegisteredFactory {
            type_name: std::any::type_name::<T>(),
            create: Constructor::Plain(create_default::<T>),
        });
    }

    /// Register a plugin type wrapped so that none of its panics leave the module.
    ///
    /// Used by [`declare_plugin!`](crate::declare_plugin); the wrapper is
    /// compiled into the plugin module itself.
    pub fn register_guarded<T: Plugin + Default>(&mut self) {
        self.factories.push(RegisteredFactory {
            type_name: std::any::type_name::<T>(),
            create: Constructor::Guarded(guard::construct_guarded::<T>),
        });
    }

    /// Register a plugin type with an explicit constructor
    pub fn register_factory(&mut self, type_name: &'static str, create: PluginFactory) {
        self.factories.push(RegisteredFactory {
            type_name,
            create: Constructor::Plain(create),
        });
    }

    /// Mark registration as failed; the host refuses the module
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    #[must_use]
    pub fn into_factories(self) -> Vec<RegisteredFactory> {
        self.factories
    }

    /// Registered factories, or the failure recorded during registration
    pub(crate) fn finish(self) -> Result<Vec<RegisteredFactory>, String> {
        match self.failure {
            Some(message) => Err(message),
            None => Ok(self.factories),
        }
    }
}

fn create_default<T: Plugin + Default>() -> Box<dyn Plugin> {
    Box::new(T::default())
}

/// Export the module entry points for one or more plugin types.
///
/// ```ignore
/// #[derive(Default)]
/// pub struct Greeter;
///
/// plughost::declare_plugin!(Greeter);
/// ```
///
/// The module must be compiled as a `cdylib` with the same toolchain and
/// `plughost` version as the host. Every registered type is wrapped in a
/// [`PanicGuard`](crate::plugins::guard::PanicGuard), so panics in
/// registration, construction and lifecycle calls are caught inside the
/// module and reach the host as errors.
#[macro_export]
macro_rules! declare_plugin {
    ($($plugin:ty),+ $(,)?) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static _plugin_api_version: u32 = $crate::plugins::api::PLUGIN_API_VERSION;

        #[no_mangle]
        pub extern "C" fn _plugin_build_id() -> *const ::std::os::raw::c_char {
            $crate::plugins::api::BUILD_ID.as_ptr().cast()
        }

        #[no_mangle]
        pub fn _plugin_register(registrar: &mut $crate::plugins::api::PluginRegistrar) {
            $crate::plugins::guard::guarded_registration(registrar, |registrar| {
                $( registrar.register_guarded::<$plugin>(); )+
            });
        }
    };
}
