//! Symbol hooks: bind a replacement to a named export and keep the true
//! original reachable for the replacement to call.

use core::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

mod inline;
mod table;

pub use inline::InlineHooks;
pub use table::HookTable;

/// Process-lifetime cell holding the resolved original of a hooked export.
#[derive(Debug, Default)]
pub struct OriginalSlot(AtomicUsize);

impl OriginalSlot {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.get().is_some()
    }

    /// Store `addr` if the slot is still empty. A bound slot is never
    /// overwritten; returns whether this call bound it.
    pub fn bind(&self, addr: usize) -> bool {
        addr != 0
            && self
                .0
                .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// The bound address as a typed function pointer.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the bound function.
    pub unsafe fn as_fn<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(core::mem::size_of::<F>(), core::mem::size_of::<usize>());
        let addr = self.get()?;
        Some(unsafe { core::mem::transmute_copy::<usize, F>(&addr) })
    }

    /// Bind `addr` if the slot is empty or still holds `stale`.
    pub(crate) fn supersede(&self, stale: usize, addr: usize) -> bool {
        self.bind(addr)
            || self
                .0
                .compare_exchange(stale, addr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// One export to replace: `symbol` is routed to `patch`, and `link`
/// receives the original.
#[derive(Debug)]
pub struct SymbolHook {
    pub symbol: &'static str,
    pub patch: *const c_void,
    pub link: &'static OriginalSlot,
}

// Safety: `patch` is the address of a function with static lifetime.
unsafe impl Send for SymbolHook {}
unsafe impl Sync for SymbolHook {}

impl SymbolHook {
    pub const fn new(symbol: &'static str, patch: *const c_void, link: &'static OriginalSlot) -> Self {
        Self {
            symbol,
            patch,
            link,
        }
    }

    pub fn patch_address(&self) -> usize {
        self.patch as usize
    }
}
