//! Inline replacement: the entry of a function is overwritten with a branch
//! to the replacement, and a trampoline runs the displaced instructions
//! before resuming the function. Every caller is covered, however it found
//! the address.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use log::debug;

use crate::code::allocator::CodeAllocator;
use crate::code::patcher::patch_code;
use crate::code::writer::CodeWriter;
use crate::hook::OriginalSlot;
use crate::types::HookError;

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
use crate::arch::x86 as isa;

#[cfg(target_arch = "aarch64")]
use crate::arch::arm64 as isa;

/// Bytes of the entry that are read for relocation.
const ENTRY_WINDOW: usize = 32;
const PAGE_SIZE: usize = 4096;

struct Replacement {
    replacement: usize,
    trampoline: usize,
}

/// A prepared but not yet installed replacement.
struct Detour {
    trampoline: usize,
    patch_at: usize,
    patch: Vec<u8>,
}

/// Process-wide registry of replaced functions.
pub struct InlineHooks {
    replaced: Mutex<HashMap<usize, Replacement>>,
}

impl InlineHooks {
    pub fn obtain() -> &'static InlineHooks {
        static INSTANCE: OnceLock<InlineHooks> = OnceLock::new();
        INSTANCE.get_or_init(|| InlineHooks {
            replaced: Mutex::new(HashMap::new()),
        })
    }

    /// Route `function` to `replacement` and bind `link` to a trampoline
    /// that behaves like the untouched function. `link` is bound before the
    /// entry is rewritten. Replacing the same function with the same
    /// replacement again returns the existing trampoline.
    ///
    /// # Safety
    /// `function` must be the entry of a function with at least the entry
    /// window mapped, and `replacement` must share its signature.
    pub unsafe fn replace(
        &self,
        function: usize,
        replacement: usize,
        link: &OriginalSlot,
    ) -> Result<usize, HookError> {
        let mut replaced = self.replaced.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = replaced.get(&function) {
            if existing.replacement != replacement {
                return Err(HookError::AlreadyHooked(function));
            }
            link.bind(existing.trampoline);
            return Ok(existing.trampoline);
        }
        if function == 0 || function == replacement {
            return Err(HookError::RelocationFailed(function));
        }
        // A slot already holding something else would call back into us.
        if link.get().is_some_and(|bound| bound != function) {
            return Err(HookError::AlreadyHooked(function));
        }

        let detour = unsafe { build(function, replacement)? };
        // A slot still holding the bare entry would re-enter the replacement.
        link.supersede(function, detour.trampoline);
        unsafe {
            patch_code(detour.patch_at as *mut u8, detour.patch.len(), |p| {
                core::ptr::copy_nonoverlapping(detour.patch.as_ptr(), p, detour.patch.len());
            })?;
        }
        debug!(
            "{:#x} now branches to {:#x}, trampoline at {:#x}",
            function, replacement, detour.trampoline
        );

        let trampoline = detour.trampoline;
        replaced.insert(
            function,
            Replacement {
                replacement,
                trampoline,
            },
        );
        Ok(trampoline)
    }

    pub fn trampoline(&self, function: usize) -> Option<usize> {
        self.replaced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&function)
            .map(|r| r.trampoline)
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
unsafe fn build(function: usize, replacement: usize) -> Result<Detour, HookError> {
    let mode = isa::HOST;
    let entry = unsafe { core::slice::from_raw_parts(function as *const u8, ENTRY_WINDOW) };
    // Indirect-branch landing pads stay in place.
    let skip = if isa::is_endbr(entry) { 4 } else { 0 };
    let at = (function + skip) as u64;
    let code = &entry[skip..];

    let alloc = CodeAllocator::default();
    let page = match mode {
        isa::Mode::Long64 => alloc
            .alloc_near(at as usize, 0x7FF0_0000, PAGE_SIZE)
            .or_else(|_| alloc.alloc(PAGE_SIZE))?,
        isa::Mode::Legacy32 => alloc.alloc(PAGE_SIZE)?,
    };
    let page_pc = page.data as u64;
    let replacement = replacement as u64;

    let relay_reachable = isa::near_reachable(at, page_pc, mode);
    let direct = isa::near_reachable(at, replacement, mode);
    let window = if direct || relay_reachable {
        isa::NEAR_JMP_SIZE
    } else {
        isa::FAR_JMP_SIZE
    };

    let (consumed, target) = unsafe {
        let mut w = CodeWriter::new(page.data, page.size);
        let consumed = isa::relocate(code, at, window, &mut w, mode)?;
        isa::put_jmp(&mut w, at + consumed as u64, mode);
        let target = if direct || !relay_reachable {
            replacement
        } else {
            let relay = w.pc();
            isa::put_jmp_far(&mut w, replacement);
            relay
        };
        alloc.make_executable(&page)?;
        (consumed, target)
    };

    Ok(Detour {
        trampoline: page_pc as usize,
        patch_at: at as usize,
        patch: isa::entry_jump(at, target, consumed, mode),
    })
}

#[cfg(target_arch = "aarch64")]
unsafe fn build(function: usize, replacement: usize) -> Result<Detour, HookError> {
    let code = unsafe { core::slice::from_raw_parts(function as *const u8, ENTRY_WINDOW) };
    let at = function as u64;

    let alloc = CodeAllocator::default();
    // The relay sits somewhere in the page, so the whole page must be in reach.
    let near = alloc.alloc_near(function, isa::NEAR_RANGE - PAGE_SIZE, PAGE_SIZE);
    let relay_reachable = near
        .as_ref()
        .is_ok_and(|page| isa::near_reachable(at, page.data as u64));
    let page = match near {
        Ok(page) => page,
        Err(_) => alloc.alloc(PAGE_SIZE)?,
    };
    let page_pc = page.data as u64;
    let replacement = replacement as u64;
    let direct = isa::near_reachable(at, replacement);
    let window = if direct || relay_reachable {
        isa::NEAR_JMP_SIZE
    } else {
        isa::FAR_JMP_SIZE
    };

    let (consumed, target) = unsafe {
        let mut w = CodeWriter::new(page.data, page.size);
        let consumed = isa::relocate(code, at, window, &mut w)?;
        isa::put_jmp_far(&mut w, at + consumed as u64);
        let target = if direct || !relay_reachable {
            replacement
        } else {
            let relay = w.pc();
            isa::put_jmp_far(&mut w, replacement);
            relay
        };
        alloc.make_executable(&page)?;
        (consumed, target)
    };

    Ok(Detour {
        trampoline: page_pc as usize,
        patch_at: function,
        patch: isa::entry_jump(at, target, consumed),
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
unsafe fn build(function: usize, _replacement: usize) -> Result<Detour, HookError> {
    Err(HookError::RelocationFailed(function))
}
