use crate::code::cache::invalidate_icache;
use crate::types::HookError;

/// Rewrite `size` bytes of live code at `addr`.
///
/// The covering pages are made writable for the duration of `apply` and
/// returned to read-execute afterwards.
///
/// # Safety
/// `addr` must point to `size` bytes of mapped code, and `apply` must only
/// write within that range. Threads executing the range while it is
/// rewritten observe a torn instruction stream.
pub unsafe fn patch_code(
    addr: *mut u8,
    size: usize,
    apply: impl FnOnce(*mut u8),
) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    unsafe {
        let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page_start = (addr as usize) & !(page_sz - 1);
        let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
        let map_size = page_end - page_start;

        // RWX so the rest of the page keeps executing meanwhile.
        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::ProtectFailed);
        }

        apply(addr);

        libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_EXEC,
        );
        invalidate_icache(page_start as *mut u8, map_size);
        Ok(())
    }

    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};
        let mut old = 0;
        if VirtualProtect(addr as *const _, size, PAGE_EXECUTE_READWRITE, &mut old) == 0 {
            return Err(HookError::ProtectFailed);
        }
        apply(addr);
        let mut restored = 0;
        VirtualProtect(addr as *const _, size, old, &mut restored);
        invalidate_icache(addr, size);
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = apply;
        Err(HookError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::allocator::CodeAllocator;

    #[test]
    fn patched_bytes_are_visible_at_the_original_address() {
        let alloc = CodeAllocator::default();
        let slice = alloc.alloc(4096).expect("alloc");
        unsafe {
            core::ptr::write_bytes(slice.data, 0x90, 16);
            alloc.make_executable(&slice).expect("rx");

            patch_code(slice.data.add(4), 4, |p| {
                (p as *mut u32).write_unaligned(0xDEAD_BEEF);
            })
            .expect("patch");

            let after = (slice.data.add(4) as *const u32).read_unaligned();
            assert_eq!(after, 0xDEAD_BEEF);
            assert_eq!(slice.data.read(), 0x90);
        }
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let mut called = false;
        unsafe { patch_code(core::ptr::null_mut(), 0, |_| called = true) }.expect("noop");
        assert!(!called);
    }
}
