//! A module that claims to come from a different compiler.

use async_trait::async_trait;
use plughost::plugins::api::{PluginRegistrar, PLUGIN_API_VERSION};
use plughost::plugins::guard::guarded_registration;
use plughost::plugins::{HostServices, Plugin};
use std::os::raw::c_char;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Foreign;

#[async_trait]
impl Plugin for Foreign {
    fn name(&self) -> &str {
        "foreign"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

#[no_mangle]
#[allow(non_upper_case_globals)]
pub static _plugin_api_version: u32 = PLUGIN_API_VERSION;

#[no_mangle]
pub extern "C" fn _plugin_build_id() -> *const c_char {
    b"0.0.0 rustc 0.0.0 (000000000 1970-01-01)\0".as_ptr().cast()
}

#[no_mangle]
pub fn _plugin_register(registrar: &mut PluginRegistrar) {
    guarded_registration(registrar, |registrar| registrar.register_guarded::<Foreign>());
}
