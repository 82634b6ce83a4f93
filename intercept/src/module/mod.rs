//! Loader primitives: residency, export lookup, import rebinding and load
//! notification for the images mapped into this process.

use std::sync::Arc;

use log::debug;

use crate::hook::{InlineHooks, OriginalSlot};
use crate::types::HookError;

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod linux;

#[cfg(windows)]
mod windows;

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub use linux::*;

#[cfg(windows)]
pub use windows::*;

/// Invoked once when a watched module becomes resident.
pub type LoadCallback = Box<dyn FnOnce() + Send + 'static>;

/// How an export was routed to its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// The export's entry branches to the replacement, so every caller is
    /// covered, including ones that resolve the name later. `trampoline`
    /// runs the displaced entry and resumes the export.
    Inline { trampoline: usize },
    /// The entry could not be relocated; only the import slots resolved at
    /// this point were rewritten.
    Imports { slots: usize },
}

/// What the hook table needs from the platform loader.
pub trait Loader: Send + Sync {
    fn is_resident(&self, module: &str) -> bool;

    /// Address of `symbol` as exported by `module`.
    fn resolve_export(&self, module: &str, symbol: &str) -> Result<usize, HookError>;

    /// Route the export at `function` to `replacement` and bind `link` to
    /// whatever still reaches the unmodified export. `link` is bound before
    /// any caller can reach the replacement.
    ///
    /// # Safety
    /// `replacement` must be a function with the same signature and calling
    /// convention as `function`.
    unsafe fn redirect(
        &self,
        module: &str,
        function: usize,
        replacement: usize,
        link: &OriginalSlot,
    ) -> Result<Redirect, HookError>;

    /// Run `callback` once, when `module` is next loaded by anyone.
    fn watch_load(&self, module: &str, callback: LoadCallback) -> Result<(), HookError>;

    /// Load `module` and keep it loaded until the returned handle is dropped.
    fn load(&self, module: &str) -> Result<Library, HookError>;
}

/// A library reference taken by [`Loader::load`].
#[derive(Debug)]
pub struct Library {
    name: String,
    handle: usize,
    unload: fn(usize),
}

impl Library {
    pub fn new(name: &str, handle: usize, unload: fn(usize)) -> Self {
        Self {
            name: name.to_string(),
            handle,
            unload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> usize {
        self.handle
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        log::debug!("unloading {}", self.name);
        (self.unload)(self.handle);
    }
}

/// A loader for targets without an implementation: every hook stays inert.
#[derive(Debug, Default)]
pub struct UnsupportedLoader;

impl Loader for UnsupportedLoader {
    fn is_resident(&self, _module: &str) -> bool {
        false
    }

    fn resolve_export(&self, _module: &str, _symbol: &str) -> Result<usize, HookError> {
        Err(HookError::Unsupported)
    }

    unsafe fn redirect(
        &self,
        _: &str,
        _: usize,
        _: usize,
        _: &OriginalSlot,
    ) -> Result<Redirect, HookError> {
        Err(HookError::Unsupported)
    }

    fn watch_load(&self, _module: &str, _callback: LoadCallback) -> Result<(), HookError> {
        Err(HookError::Unsupported)
    }

    fn load(&self, _module: &str) -> Result<Library, HookError> {
        Err(HookError::Unsupported)
    }
}

/// Replace `function` inline, falling back to `rebind_imports` (which
/// rewrites import slots holding `function`) when its entry cannot be
/// relocated.
///
/// # Safety
/// As for [`Loader::redirect`].
pub(crate) unsafe fn redirect_inline_or(
    function: usize,
    replacement: usize,
    link: &OriginalSlot,
    rebind_imports: impl FnOnce() -> Result<usize, HookError>,
) -> Result<Redirect, HookError> {
    match unsafe { InlineHooks::obtain().replace(function, replacement, link) } {
        Ok(trampoline) => Ok(Redirect::Inline { trampoline }),
        Err(e @ HookError::AlreadyHooked(_)) => Err(e),
        Err(e) => {
            debug!("{:#x} not replaced inline ({}), rewriting imports", function, e);
            link.bind(function);
            rebind_imports().map(|slots| Redirect::Imports { slots })
        }
    }
}

/// The loader backing this process.
pub fn platform_loader() -> Arc<dyn Loader> {
    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    {
        Arc::new(ElfLoader)
    }
    #[cfg(windows)]
    {
        Arc::new(PeLoader)
    }
    #[cfg(not(any(all(target_os = "linux", target_pointer_width = "64"), windows)))]
    {
        Arc::new(UnsupportedLoader)
    }
}
