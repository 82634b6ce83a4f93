//! dxshim agent: loaded into a Direct3D 9 host, it hooks the runtime's
//! factory exports and upgrades device creation to the `Ex` variants where
//! the runtime supports them.
//!
//! On Windows the library is loaded into the host by whatever injects it
//! and starts from `DllMain`. On Linux a constructor starts it, which keeps
//! the hooking machinery testable against a mocked runtime.

pub mod config;
pub mod context;
pub mod d3d9;
pub mod logging;
pub mod negotiate;

#[cfg(test)]
mod test_utils;

use anyhow::Result;
use dxshim_intercept::platform_loader;
use log::{error, info};

use crate::config::ShimConfig;

/// Read the config, set up logging and install the hooks.
pub fn attach() -> Result<()> {
    let config = ShimConfig::from_env();
    logging::init(&config);
    info!(
        "dxshim {} attaching (enhanced: {})",
        env!("CARGO_PKG_VERSION"),
        config.enhanced
    );
    context::install(config, platform_loader())
}

/// Release what [`attach`] acquired.
pub fn detach() {
    context::teardown();
}

/// Install on a worker thread so the loader is never blocked on us.
#[cfg_attr(not(any(windows, all(target_os = "linux", not(test)))), allow(dead_code))]
fn start() {
    let spawned = std::thread::Builder::new()
        .name("dxshim-install".to_string())
        .spawn(|| {
            if let Err(e) = attach() {
                error!("dxshim install failed: {:#}", e);
            }
        });
    // Nothing to report to yet: the logger is set up on that thread.
    drop(spawned);
}

#[cfg(windows)]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "system" fn DllMain(
    _module: windows_sys::Win32::Foundation::HINSTANCE,
    reason: u32,
    _reserved: *mut core::ffi::c_void,
) -> windows_sys::Win32::Foundation::BOOL {
    use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    match reason {
        DLL_PROCESS_ATTACH => start(),
        DLL_PROCESS_DETACH => detach(),
        _ => {}
    }
    windows_sys::Win32::Foundation::TRUE
}

/// Constructor attribute for automatic initialization on library load (Linux).
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        start();
    }
    init
};

/// Destructor counterpart of [`INIT`].
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".fini_array")]
#[used]
static FINI: extern "C" fn() = {
    extern "C" fn fini() {
        detach();
    }
    fini
};
