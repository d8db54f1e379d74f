//! Exports the module entry points by hand, claiming a newer plugin API.

use plughost::plugins::api::{PluginRegistrar, BUILD_ID, PLUGIN_API_VERSION};
use std::os::raw::c_char;

#[no_mangle]
#[allow(non_upper_case_globals)]
pub static _plugin_api_version: u32 = PLUGIN_API_VERSION + 1;

#[no_mangle]
pub extern "C" fn _plugin_build_id() -> *const c_char {
    BUILD_ID.as_ptr().cast()
}

#[no_mangle]
pub fn _plugin_register(_registrar: &mut PluginRegistrar) {}
