//! Forwarding stubs shared by every proxy.
//!
//! Stub `i` is entered with the synthetic object as `this`. It loads the
//! record's slot table, replaces `this` with the real object and tail-jumps
//! through slot `i`. Argument registers and the stack are left untouched, so
//! the real method sees exactly the call the host made. The stubs depend only
//! on the slot index and the record layout, so one page serves the process.

use core::ffi::c_void;
use std::sync::OnceLock;

use log::debug;

use crate::code::allocator::{CodeAllocator, CodeSlice};
use crate::code::writer::CodeWriter;
use crate::com::proxy::{REAL_OFFSET, SLOTS_OFFSET};
use crate::types::HookError;

/// Widest interface a proxy can present.
pub const MAX_FORWARDED_SLOTS: usize = 256;

const THUNK_STRIDE: usize = 32;

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
const FILLER: &[u8] = &[0xCC]; // int3

#[cfg(target_arch = "aarch64")]
const FILLER: &[u8] = &[0x00, 0x00, 0x20, 0xD4]; // brk #0

struct ThunkPage {
    slice: CodeSlice,
}

static PAGE: OnceLock<Result<ThunkPage, HookError>> = OnceLock::new();

/// Address of the stub that forwards slot `index`.
pub(crate) fn forwarder(index: usize) -> Result<*const c_void, HookError> {
    if index >= MAX_FORWARDED_SLOTS {
        return Err(HookError::TableTooLarge(index + 1));
    }
    let page = PAGE.get_or_init(build).as_ref().map_err(Clone::clone)?;
    Ok(unsafe { page.slice.data.add(index * THUNK_STRIDE) } as *const c_void)
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
fn build() -> Result<ThunkPage, HookError> {
    let alloc = CodeAllocator::default();
    let slice = alloc.alloc(MAX_FORWARDED_SLOTS * THUNK_STRIDE)?;
    unsafe {
        let mut w = CodeWriter::new(slice.data, slice.size);
        for index in 0..MAX_FORWARDED_SLOTS {
            emit_forwarder(&mut w, index);
            w.pad_to(THUNK_STRIDE, FILLER);
        }
        alloc.make_executable(&slice)?;
    }
    debug!(
        "emitted {} forwarding thunks at {:p}",
        MAX_FORWARDED_SLOTS, slice.data
    );
    Ok(ThunkPage { slice })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
fn build() -> Result<ThunkPage, HookError> {
    Err(HookError::Unsupported)
}

// mov rax, [this + SLOTS]; mov this, [this + REAL]; jmp [rax + index*8]
#[cfg(target_arch = "x86_64")]
unsafe fn emit_forwarder(w: &mut CodeWriter, index: usize) {
    // `this` is rcx under the Microsoft x64 convention and rdi under System V.
    #[cfg(windows)]
    const LOAD: ([u8; 3], [u8; 3]) = ([0x48, 0x8B, 0x41], [0x48, 0x8B, 0x49]);
    #[cfg(not(windows))]
    const LOAD: ([u8; 3], [u8; 3]) = ([0x48, 0x8B, 0x47], [0x48, 0x8B, 0x7F]);

    unsafe {
        w.put_bytes(&LOAD.0);
        w.put_bytes(&[SLOTS_OFFSET as u8]);
        w.put_bytes(&LOAD.1);
        w.put_bytes(&[REAL_OFFSET as u8]);
        w.put_bytes(&[0xFF, 0xA0]);
        w.put_u32_le((index * 8) as u32);
    }
}

// stdcall: `this` is the first stack argument, above the return address.
#[cfg(target_arch = "x86")]
unsafe fn emit_forwarder(w: &mut CodeWriter, index: usize) {
    unsafe {
        w.put_bytes(&[0x8B, 0x44, 0x24, 0x04]); // mov eax, [esp+4]
        w.put_bytes(&[0x8B, 0x48, SLOTS_OFFSET as u8]); // mov ecx, [eax+SLOTS]
        w.put_bytes(&[0x8B, 0x40, REAL_OFFSET as u8]); // mov eax, [eax+REAL]
        w.put_bytes(&[0x89, 0x44, 0x24, 0x04]); // mov [esp+4], eax
        w.put_bytes(&[0xFF, 0xA1]); // jmp [ecx+disp32]
        w.put_u32_le((index * 4) as u32);
    }
}

// ldr x16, [x0, #SLOTS]; ldr x0, [x0, #REAL]; ldr x16, [x16, #index*8]; br x16
#[cfg(target_arch = "aarch64")]
unsafe fn emit_forwarder(w: &mut CodeWriter, index: usize) {
    const LDR_X: u32 = 0xF940_0000;
    const X16: u32 = 16;
    unsafe {
        w.put_u32_le(LDR_X | (((SLOTS_OFFSET / 8) as u32) << 10) | X16);
        w.put_u32_le(LDR_X | (((REAL_OFFSET / 8) as u32) << 10));
        w.put_u32_le(LDR_X | ((index as u32) << 10) | (X16 << 5) | X16);
        w.put_u32_le(0xD61F_0000 | (X16 << 5));
    }
}

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;

    fn bytes_at(addr: *const c_void, len: usize) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }

    #[test]
    fn stubs_are_evenly_strided() {
        let first = forwarder(0).expect("thunks");
        let fifth = forwarder(5).expect("thunks");
        assert_eq!(fifth as usize - first as usize, 5 * THUNK_STRIDE);
    }

    #[test]
    fn index_beyond_limit_is_rejected() {
        assert_eq!(
            forwarder(MAX_FORWARDED_SLOTS),
            Err(HookError::TableTooLarge(MAX_FORWARDED_SLOTS + 1))
        );
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    fn x86_64_stub_swaps_rdi_and_jumps_through_slot() {
        let stub = bytes_at(forwarder(16).expect("thunks"), 14);
        assert_eq!(
            stub,
            vec![
                0x48, 0x8B, 0x47, 0x10, // mov rax, [rdi+16]
                0x48, 0x8B, 0x7F, 0x08, // mov rdi, [rdi+8]
                0xFF, 0xA0, 0x80, 0x00, 0x00, 0x00, // jmp [rax+0x80]
            ]
        );
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn aarch64_stub_swaps_x0_and_branches_through_slot() {
        let stub = bytes_at(forwarder(3).expect("thunks"), 16);
        let words: Vec<u32> = stub
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![0xF940_0810, 0xF940_0400, 0xF940_0E10, 0xD61F_0200]);
    }
}
