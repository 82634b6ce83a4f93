use crate::types::HookError;

/// A page-aligned region obtained from [`CodeAllocator`].
///
/// Regions are never returned to the system: generated code is shared by
/// every proxy for the rest of the process.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

#[derive(Debug)]
pub struct CodeAllocator {
    page_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { page_size: 4096 }
    }
}

impl CodeAllocator {
    /// Allocate a writable region of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<CodeSlice, HookError> {
        let size = size.max(1).div_ceil(self.page_size) * self.page_size;

        #[cfg(unix)]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                size,
            })
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
            };
            let ptr = VirtualAlloc(
                core::ptr::null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            );
            if ptr.is_null() {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                size,
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = size;
            Err(HookError::Unsupported)
        }
    }

    /// Allocate a writable region of `size` bytes within `max_distance` of
    /// `near`, so that a short relative branch from `near` can reach it.
    pub fn alloc_near(
        &self,
        near: usize,
        max_distance: usize,
        size: usize,
    ) -> Result<CodeSlice, HookError> {
        let size = size.max(1).div_ceil(self.page_size) * self.page_size;
        let win_start = near.saturating_sub(max_distance) & !(self.page_size - 1);
        let win_end = near.saturating_add(max_distance).saturating_sub(size) & !(self.page_size - 1);

        #[cfg(target_os = "linux")]
        unsafe {
            let maps = std::fs::read_to_string("/proc/self/maps")
                .map_err(|_| HookError::AllocationFailed)?;
            let mut regions: Vec<(usize, usize)> = maps
                .lines()
                .filter_map(|line| {
                    let (start, end) = line.split_whitespace().next()?.split_once('-')?;
                    Some((
                        usize::from_str_radix(start, 16).ok()?,
                        usize::from_str_radix(end, 16).ok()?,
                    ))
                })
                .collect();
            regions.sort_by_key(|&(start, _)| start);
            regions.push((usize::MAX, usize::MAX));

            // Gaps are tried nearest-first along the address space walk.
            let mut prev_end = win_start;
            for &(region_start, region_end) in &regions {
                if prev_end > win_end {
                    break;
                }
                if region_start > prev_end && region_start - prev_end >= size {
                    let candidate = near.clamp(prev_end, (region_start - size).min(win_end))
                        & !(self.page_size - 1);
                    if candidate >= win_start && candidate <= win_end && candidate >= prev_end {
                        let ptr = libc::mmap(
                            candidate as *mut libc::c_void,
                            size,
                            libc::PROT_READ | libc::PROT_WRITE,
                            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                            -1,
                            0,
                        );
                        if ptr != libc::MAP_FAILED {
                            return Ok(CodeSlice {
                                data: ptr as *mut u8,
                                size,
                            });
                        }
                    }
                }
                prev_end = prev_end.max(region_end);
            }
            Err(HookError::AllocationFailed)
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
            };
            // Reservations are granular to 64 KiB; walk outwards from `near`.
            const GRANULARITY: usize = 0x1_0000;
            let origin = near & !(GRANULARITY - 1);
            let mut step = 0;
            loop {
                let below = origin.checked_sub(step).filter(|&a| a >= win_start && a != 0);
                let above = origin.checked_add(step).filter(|&a| a <= win_end);
                if below.is_none() && above.is_none() {
                    return Err(HookError::AllocationFailed);
                }
                for candidate in [below, above].into_iter().flatten() {
                    let ptr = VirtualAlloc(
                        candidate as *const core::ffi::c_void,
                        size,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    );
                    if !ptr.is_null() {
                        return Ok(CodeSlice {
                            data: ptr as *mut u8,
                            size,
                        });
                    }
                }
                step += GRANULARITY;
            }
        }

        #[cfg(not(any(target_os = "linux", windows)))]
        {
            let _ = (win_start, win_end);
            Err(HookError::Unsupported)
        }
    }

    /// Flip a region from RW to RX once emission is complete.
    ///
    /// # Safety
    /// `slice` must come from [`CodeAllocator::alloc`] and must not be
    /// written to afterwards.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        #[cfg(unix)]
        unsafe {
            if libc::mprotect(
                slice.data as *mut libc::c_void,
                slice.size,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                return Err(HookError::ProtectFailed);
            }
            crate::code::cache::invalidate_icache(slice.data, slice.size);
            Ok(())
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};
            let mut old = 0;
            if VirtualProtect(
                slice.data as *const core::ffi::c_void,
                slice.size,
                PAGE_EXECUTE_READ,
                &mut old,
            ) == 0
            {
                return Err(HookError::ProtectFailed);
            }
            crate::code::cache::invalidate_icache(slice.data, slice.size);
            Ok(())
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = slice;
            Err(HookError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_whole_pages() {
        let alloc = CodeAllocator::default();
        let slice = alloc.alloc(10).expect("alloc");
        assert_eq!(slice.size, 4096);
        assert_eq!(slice.data as usize % 4096, 0);

        let slice = alloc.alloc(4097).expect("alloc");
        assert_eq!(slice.size, 8192);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn alloc_near_stays_within_reach() {
        let alloc = CodeAllocator::default();
        let anchor = alloc_rounds_up_to_whole_pages as usize;
        let slice = alloc.alloc_near(anchor, 0x7FFF_0000, 64).expect("near");
        let distance = (slice.data as usize).abs_diff(anchor);
        assert!(distance <= 0x7FFF_0000, "{:#x} is too far", distance);
        assert_eq!(slice.size, 4096);
    }

    #[test]
    fn alloc_returns_executable_page() {
        let alloc = CodeAllocator::default();
        let slice = alloc.alloc(4096).expect("alloc");
        unsafe {
            #[cfg(target_arch = "aarch64")]
            {
                (slice.data as *mut u32).write(0xD65F03C0); // ret
            }
            #[cfg(not(target_arch = "aarch64"))]
            {
                slice.data.write(0xC3); // ret
            }
            alloc.make_executable(&slice).expect("protect");
            let f: extern "C" fn() = core::mem::transmute(slice.data);
            f();
        }
    }
}
