//! Process-wide shim state: the hook table, the bound originals and the
//! runtime library reference taken when the host had not loaded it yet.

use core::ffi::c_void;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use dxshim_intercept::{HookTable, Library, Loader, OriginalSlot, SymbolHook};
use log::{debug, info, warn};

use crate::config::{ShimConfig, DISABLE_VAR};
use crate::d3d9::exports;
use crate::d3d9::ffi::{Direct3DCreate9ExFn, Direct3DCreate9Fn};

pub const D3D9_MODULE: &str = "d3d9.dll";

const CREATE9: &str = "Direct3DCreate9";
const CREATE9_EX: &str = "Direct3DCreate9Ex";

pub static NEXT_DIRECT3D_CREATE9: OriginalSlot = OriginalSlot::new();
pub static NEXT_DIRECT3D_CREATE9_EX: OriginalSlot = OriginalSlot::new();

struct ShimContext {
    config: ShimConfig,
    // Keeps the deferred-hook bookkeeping alive for the process.
    #[allow(dead_code)]
    table: HookTable,
    library: Mutex<Option<Library>>,
}

static CONTEXT: OnceLock<ShimContext> = OnceLock::new();

fn hooks() -> &'static [SymbolHook] {
    static HOOKS: OnceLock<[SymbolHook; 2]> = OnceLock::new();
    HOOKS.get_or_init(|| {
        [
            SymbolHook::new(
                CREATE9,
                exports::Direct3DCreate9 as *const c_void,
                &NEXT_DIRECT3D_CREATE9,
            ),
            SymbolHook::new(
                CREATE9_EX,
                exports::Direct3DCreate9Ex as *const c_void,
                &NEXT_DIRECT3D_CREATE9_EX,
            ),
        ]
    })
}

/// Hook the factory exports of `d3d9.dll`. Runs once per process.
pub fn install(config: ShimConfig, loader: Arc<dyn Loader>) -> Result<()> {
    if config.disabled {
        info!("{} is set, no hooks installed", DISABLE_VAR);
        return Ok(());
    }
    if CONTEXT.get().is_some() {
        bail!("shim already installed");
    }

    let table = HookTable::new(loader);
    table.apply(D3D9_MODULE, hooks());

    let library = if hooks().iter().all(|h| h.link.is_bound()) {
        None
    } else {
        let library = load_runtime(table.loader().as_ref(), hooks())?;
        // Resident now, so the entries get routed like any host-loaded copy.
        table.apply(D3D9_MODULE, hooks());
        Some(library)
    };

    let context = ShimContext {
        config,
        table,
        library: Mutex::new(library),
    };
    CONTEXT
        .set(context)
        .map_err(|_| anyhow!("shim installed concurrently"))?;
    info!("Direct3D 9 shim installed");
    Ok(())
}

/// Load the runtime ourselves and bind whatever `hooks` left empty.
///
/// The baseline entry point is required; the enhanced one is optional since
/// older runtimes do not export it.
fn load_runtime(loader: &dyn Loader, hooks: &[SymbolHook]) -> Result<Library> {
    let library = loader
        .load(D3D9_MODULE)
        .with_context(|| format!("{} not found or failed initialization", D3D9_MODULE))?;

    for hook in hooks.iter().filter(|h| !h.link.is_bound()) {
        match loader.resolve_export(D3D9_MODULE, hook.symbol) {
            Ok(addr) if addr != hook.patch_address() => {
                hook.link.bind(addr);
                debug!("{} bound from the loaded runtime", hook.symbol);
            }
            Ok(_) => {}
            Err(e) => debug!("{} not bound: {}", hook.symbol, e),
        }
    }

    for hook in hooks.iter().filter(|h| !h.link.is_bound()) {
        if hook.symbol == CREATE9 {
            bail!("{} not found in loaded {}", CREATE9, D3D9_MODULE);
        }
        warn!("{} not found in loaded {}, enhanced path off", hook.symbol, D3D9_MODULE);
    }
    Ok(library)
}

/// Drop the runtime reference taken by [`install`].
pub fn teardown() {
    let Some(context) = CONTEXT.get() else {
        return;
    };
    let library = context
        .library
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(library) = library {
        info!("releasing {}", library.name());
        drop(library);
    }
}

/// The originals bound so far.
pub fn originals() -> (Option<Direct3DCreate9Fn>, Option<Direct3DCreate9ExFn>) {
    unsafe {
        (
            NEXT_DIRECT3D_CREATE9.as_fn::<Direct3DCreate9Fn>(),
            NEXT_DIRECT3D_CREATE9_EX.as_fn::<Direct3DCreate9ExFn>(),
        )
    }
}

/// Whether the enhanced factory and device paths may be tried.
pub fn enhanced_allowed() -> bool {
    CONTEXT.get().is_none_or(|c| c.config.enhanced)
}
