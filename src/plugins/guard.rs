//! Panic containment for plugin modules
//!
//! A module built as a `cdylib` links its own Rust runtime. A panic unwinding
//! out of it into the host is a foreign exception and aborts the process, so
//! everything a module exports goes through these wrappers. They are compiled
//! into the module by [`declare_plugin!`](crate::declare_plugin) and turn
//! panics into errors before control returns to the host.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

use super::api::{HostServices, Plugin, PluginRegistrar};
use super::error::panic_message;

/// Run a module's registrations, recording a panic as a registration failure
pub fn guarded_registration(
    registrar: &mut PluginRegistrar,
    register: impl FnOnce(&mut PluginRegistrar),
) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| register(registrar))) {
        registrar.record_failure(panic_message(payload.as_ref()));
    }
}

/// Construct `T` inside the module and wrap it in a [`PanicGuard`]
pub fn construct_guarded<T: Plugin + Default>() -> Result<Box<dyn Plugin>, String> {
    panic::catch_unwind(T::default)
        .map(|plugin| Box::new(PanicGuard::new(plugin)) as Box<dyn Plugin>)
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// Plugin wrapper whose lifecycle calls never unwind
///
/// `initialize` also adopts the host's tracing dispatcher, so the module's
/// own copy of `tracing` logs through the host subscriber.
pub struct PanicGuard<P> {
    inner: P,
}

impl<P: Plugin> PanicGuard<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Plugin> Plugin for PanicGuard<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version(&self) -> &str {
        self.inner.version()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn author(&self) -> &str {
        self.inner.author()
    }

    fn dependencies(&self) -> Vec<String> {
        panic::catch_unwind(AssertUnwindSafe(|| self.inner.dependencies())).unwrap_or_default()
    }

    fn validate(&self) -> Option<String> {
        panic::catch_unwind(AssertUnwindSafe(|| self.inner.validate())).unwrap_or_else(|payload| {
            Some(format!("validation panicked: {}", panic_message(payload.as_ref())))
        })
    }

    async fn initialize(&mut self, host: &HostServices, cancel: &CancellationToken) -> Result<()> {
        adopt_host_dispatch(host);
        contain(self.inner.initialize(host, cancel)).await
    }

    async fn shutdown(&mut self, cancel: &CancellationToken) -> Result<()> {
        contain(self.inner.shutdown(cancel)).await
    }
}

async fn contain<F>(call: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(anyhow!("plugin panicked: {}", panic_message(payload.as_ref()))))
}

fn adopt_host_dispatch(host: &HostServices) {
    if let Some(dispatch) = host.get::<Dispatch>() {
        // Only the first plugin of a module installs it; later calls are no-ops.
        let _ = tracing::dispatcher::set_global_default(Dispatch::clone(&dispatch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Volatile {
        calls: u32,
    }

    #[async_trait]
    impl Plugin for Volatile {
        fn name(&self) -> &str {
            "volatile"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        fn dependencies(&self) -> Vec<String> {
            panic!("dependency table corrupted")
        }

        fn validate(&self) -> Option<String> {
            panic!("self check failed")
        }

        async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> Result<()> {
            self.calls += 1;
            panic!("init blew up")
        }

        async fn shutdown(&mut self, _cancel: &CancellationToken) -> Result<()> {
            Err(anyhow!("still busy"))
        }
    }

    struct Fragile;

    impl Default for Fragile {
        fn default() -> Self {
            panic!("cannot build")
        }
    }

    #[async_trait]
    impl Plugin for Fragile {
        fn name(&self) -> &str {
            "fragile"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_panics_become_errors() {
        let mut plugin = PanicGuard::new(Volatile::default());
        let host = HostServices::new();
        let cancel = CancellationToken::new();

        let err = plugin.initialize(&host, &cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "plugin panicked: init blew up");
        assert_eq!(plugin.inner().calls, 1);

        let err = plugin.shutdown(&cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "still busy");
    }

    #[test]
    fn test_validation_and_dependency_panics_are_contained() {
        let plugin = PanicGuard::new(Volatile::default());
        assert_eq!(plugin.name(), "volatile");
        assert!(plugin.dependencies().is_empty());
        assert_eq!(
            plugin.validate().as_deref(),
            Some("validation panicked: self check failed")
        );
    }

    #[test]
    fn test_constructor_panic_is_reported() {
        let err = construct_guarded::<Fragile>().err();
        assert_eq!(err.as_deref(), Some("cannot build"));

        let plugin = construct_guarded::<Volatile>().unwrap();
        assert_eq!(plugin.name(), "volatile");
    }

    #[test]
    fn test_registration_panic_is_recorded() {
        let mut registrar = PluginRegistrar::new();
        guarded_registration(&mut registrar, |registrar| {
            registrar.register_guarded::<Volatile>();
            panic!("half registered");
        });
        assert_eq!(registrar.finish().unwrap_err(), "half registered");
    }
}
