#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
    fn sys_dcache_flush(addr: *mut core::ffi::c_void, size: usize);
}

/// Make freshly written instructions visible to the instruction fetcher.
///
/// x86 keeps its caches coherent, so only AArch64 hosts and Windows (which
/// documents `FlushInstructionCache` as required after code generation on
/// every architecture) do real work here.
///
/// # Safety
/// `addr` must point to at least `size` bytes of memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(target_os = "macos")]
    unsafe {
        sys_dcache_flush(addr as *mut core::ffi::c_void, size);
        sys_icache_invalidate(addr as *mut core::ffi::c_void, size);
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    unsafe {
        unsafe extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;
        FlushInstructionCache(GetCurrentProcess(), addr as *const core::ffi::c_void, size);
    }

    #[cfg(not(any(
        target_os = "macos",
        all(target_os = "linux", target_arch = "aarch64"),
        windows
    )))]
    {
        let _ = (addr, size);
    }
}
