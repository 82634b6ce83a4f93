//! Replacements for the `d3d9.dll` factory exports. The originals' entries
//! branch here once hooked.

#![allow(non_snake_case)]

use core::ffi::c_void;

use dxshim_intercept::HRESULT;
use log::{debug, warn};

use crate::d3d9::factory::{wrap_factory, FactoryPolicy};
use crate::d3d9::ffi::IDIRECT3D9_SLOTS;

#[unsafe(no_mangle)]
pub unsafe extern "system" fn Direct3DCreate9(sdk_version: u32) -> *mut c_void {
    debug!("Direct3DCreate9({}) hook hit", sdk_version);
    create_wrapped(&FactoryPolicy::current(), sdk_version)
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn Direct3DCreate9Ex(sdk_version: u32, out: *mut *mut c_void) -> HRESULT {
    debug!("Direct3DCreate9Ex({}) hook hit", sdk_version);
    unsafe { FactoryPolicy::current().create_ex(sdk_version, out) }
}

/// `Direct3DCreate9` semantics under `policy`: a factory proxy, or null.
fn create_wrapped(policy: &FactoryPolicy, sdk_version: u32) -> *mut c_void {
    let Some((factory, path)) = policy.create(sdk_version) else {
        return core::ptr::null_mut();
    };
    match wrap_factory(factory, IDIRECT3D9_SLOTS) {
        Ok(proxy) => {
            debug!("returning {:?} factory proxy {:p}", path, proxy);
            proxy
        }
        Err(e) => {
            warn!("cannot wrap the Direct3D 9 factory: {}", e);
            core::ptr::null_mut()
        }
    }
}
