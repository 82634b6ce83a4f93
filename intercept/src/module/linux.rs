use crate::hook::OriginalSlot;
use crate::module::{redirect_inline_or, Library, LoadCallback, Loader, Redirect};
use crate::types::{HookError, ModuleInfo};
use core::ffi::{c_char, c_int, c_void};
use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use log::{debug, warn};

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn module_matches(module: &ModuleInfo, name: &str) -> bool {
    module.name == name || module.path.ends_with(name)
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    struct Ctx {
        modules: Vec<ModuleInfo>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = unsafe { &mut *(data as *mut Ctx) };
        let info = unsafe { &*info };

        let path = if info.dlpi_name.is_null() || unsafe { *info.dlpi_name } == 0 {
            // Empty name means the main executable.
            match std::fs::read_link("/proc/self/exe") {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => String::new(),
            }
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }
                .to_string_lossy()
                .into_owned()
        };

        let mut min_addr: Option<u64> = None;
        let mut max_addr: u64 = 0;
        let phdrs = unsafe { core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                let start = phdr.p_vaddr;
                let end = start + phdr.p_memsz;
                min_addr = Some(min_addr.map_or(start, |m| m.min(start)));
                max_addr = max_addr.max(end);
            }
        }

        let base = info.dlpi_addr as usize + min_addr.unwrap_or(0) as usize;
        let size = min_addr.map_or(0, |min| (max_addr - min) as usize);
        let name = if path.is_empty() {
            String::from("[unknown]")
        } else {
            basename(&path).to_string()
        };

        ctx.modules.push(ModuleInfo {
            name,
            path,
            base_address: base,
            size,
        });

        0
    }

    let mut ctx = Ctx {
        modules: Vec::new(),
    };

    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }

    ctx.modules
}

pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| module_matches(m, name))
}

/// Resolve a symbol globally using `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    let cstr = CString::new(symbol).map_err(|_| HookError::ExportNotFound(symbol.to_string()))?;
    let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
    if p.is_null() {
        Err(HookError::ExportNotFound(symbol.to_string()))
    } else {
        Ok(p as usize)
    }
}

/// Resolve a symbol within a specific module using `dlopen(RTLD_NOLOAD) + dlsym`.
///
/// Unlike a global lookup this never answers with a same-named symbol from
/// another image.
pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize, HookError> {
    let module = find_module_by_name(module_name)
        .ok_or_else(|| HookError::ModuleNotFound(module_name.to_string()))?;
    let sym_cstr =
        CString::new(symbol).map_err(|_| HookError::ExportNotFound(symbol.to_string()))?;

    for path in [&module.path, &module.name] {
        if path.is_empty() {
            continue;
        }
        let Ok(path_cstr) = CString::new(path.as_str()) else {
            continue;
        };
        unsafe {
            let handle = libc::dlopen(path_cstr.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_NOW);
            if handle.is_null() {
                continue;
            }
            let p = libc::dlsym(handle, sym_cstr.as_ptr());
            libc::dlclose(handle);
            if !p.is_null() {
                return Ok(p as usize);
            }
        }
    }

    Err(HookError::ExportNotFound(symbol.to_string()))
}

mod elf {
    pub const DT_NULL: i64 = 0;
    pub const DT_PLTRELSZ: i64 = 2;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_RELA: i64 = 7;
    pub const DT_RELASZ: i64 = 8;
    pub const DT_JMPREL: i64 = 23;

    pub const RELA_ENTRY_SIZE: usize = 24;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }
}

/// Rewrite GOT entries holding `original` to `replacement` in every loaded
/// image (Linux counterpart of import-table patching).
///
/// Scans the `.got.plt` (DT_JMPREL) and `.got` (DT_RELA) relocation targets.
/// Entries that already hold `replacement` are left alone, so repeating the
/// call is harmless.
///
/// # Safety
/// `replacement` must have the signature of the function at `original`.
pub unsafe fn rebind_pointers(original: usize, replacement: usize) -> Result<usize, HookError> {
    if original == 0 || original == replacement {
        return Ok(0);
    }

    struct Ctx {
        original: usize,
        replacement: usize,
        patched: usize,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = unsafe { &mut *(data as *mut Ctx) };
        let info = unsafe { &*info };
        let base = info.dlpi_addr as usize;
        let phdrs = unsafe { core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };

        let Some(dynamic) = phdrs
            .iter()
            .find(|p| p.p_type == libc::PT_DYNAMIC)
            .map(|p| (base as u64 + p.p_vaddr) as *const elf::Elf64Dyn)
        else {
            return 0;
        };

        let mut jmprel_val: u64 = 0;
        let mut jmprel_size: usize = 0;
        let mut rela_val: u64 = 0;
        let mut rela_size: usize = 0;
        let mut symtab_val: u64 = 0;
        let mut strtab_val: u64 = 0;

        let mut entry_ptr = dynamic;
        loop {
            let entry = unsafe { &*entry_ptr };
            match entry.d_tag {
                elf::DT_NULL => break,
                elf::DT_JMPREL => jmprel_val = entry.d_val,
                elf::DT_PLTRELSZ => jmprel_size = entry.d_val as usize,
                elf::DT_RELA => rela_val = entry.d_val,
                elf::DT_RELASZ => rela_size = entry.d_val as usize,
                elf::DT_SYMTAB => symtab_val = entry.d_val,
                elf::DT_STRTAB => strtab_val = entry.d_val,
                _ => {}
            }
            entry_ptr = unsafe { entry_ptr.add(1) };
        }

        // The dynamic linker relocates DT entries in place for most images
        // but leaves the vDSO's pristine.
        let base_u64 = info.dlpi_addr;
        let adjusted = symtab_val > base_u64 || strtab_val > base_u64;
        let resolve = |val: u64| -> *const u8 {
            if val == 0 {
                core::ptr::null()
            } else if adjusted {
                val as *const u8
            } else {
                (base_u64 + val) as *const u8
            }
        };

        let page_sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        for (rel_ptr, rel_size) in [(resolve(jmprel_val), jmprel_size), (resolve(rela_val), rela_size)] {
            if rel_ptr.is_null() || rel_size == 0 {
                continue;
            }
            for i in 0..rel_size / elf::RELA_ENTRY_SIZE {
                let r_offset = unsafe { *(rel_ptr.add(i * elf::RELA_ENTRY_SIZE) as *const u64) };
                let got_addr = base + r_offset as usize;
                let got_slot = got_addr as *mut usize;
                if unsafe { core::ptr::read_unaligned(got_slot) } != ctx.original {
                    continue;
                }
                let page = got_addr & !(page_sz - 1);
                let writable = unsafe {
                    libc::mprotect(
                        page as *mut libc::c_void,
                        page_sz,
                        libc::PROT_READ | libc::PROT_WRITE,
                    )
                } == 0;
                if writable {
                    unsafe { core::ptr::write_unaligned(got_slot, ctx.replacement) };
                    ctx.patched += 1;
                }
            }
        }

        0
    }

    let mut ctx = Ctx {
        original,
        replacement,
        patched: 0,
    };

    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }

    Ok(ctx.patched)
}

type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

static ORIGINAL_DLOPEN: AtomicUsize = AtomicUsize::new(0);
static OBSERVER: OnceLock<Result<(), HookError>> = OnceLock::new();
static WATCHERS: Mutex<Vec<(String, LoadCallback)>> = Mutex::new(Vec::new());

thread_local! {
    // Callbacks resolve exports, which calls dlopen again.
    static IN_NOTIFY: Cell<bool> = const { Cell::new(false) };
}

unsafe extern "C" fn observed_dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let original = ORIGINAL_DLOPEN.load(Ordering::Acquire);
    if original == 0 {
        return core::ptr::null_mut();
    }
    let dlopen: DlopenFn = unsafe { core::mem::transmute(original) };
    let handle = unsafe { dlopen(filename, flags) };
    if !handle.is_null() && flags & libc::RTLD_NOLOAD == 0 {
        notify_loaded();
    }
    handle
}

/// Fire the callbacks of every watched module that is now resident.
fn notify_loaded() {
    if IN_NOTIFY.with(|f| f.replace(true)) {
        return;
    }

    let ready: Vec<(String, LoadCallback)> = {
        let mut watchers = WATCHERS.lock().unwrap_or_else(|e| e.into_inner());
        if watchers.is_empty() {
            Vec::new()
        } else {
            let modules = enumerate_modules();
            let (ready, waiting) = std::mem::take(&mut *watchers)
                .into_iter()
                .partition(|(name, _)| modules.iter().any(|m| module_matches(m, name)));
            *watchers = waiting;
            ready
        }
    };

    for (name, callback) in ready {
        debug!("{} loaded, running deferred hooks", name);
        callback();
    }

    IN_NOTIFY.with(|f| f.set(false));
}

fn install_observer() -> Result<(), HookError> {
    let original = find_global_export_by_name("dlopen")?;
    ORIGINAL_DLOPEN.store(original, Ordering::Release);
    let patched = unsafe { rebind_pointers(original, observed_dlopen as usize)? };
    debug!("dlopen observer installed in {} GOT slots", patched);
    Ok(())
}

fn unload_library(handle: usize) {
    unsafe {
        libc::dlclose(handle as *mut c_void);
    }
}

/// [`Loader`] over the dynamic linker.
#[derive(Debug, Default)]
pub struct ElfLoader;

impl Loader for ElfLoader {
    fn is_resident(&self, module: &str) -> bool {
        find_module_by_name(module).is_some()
    }

    fn resolve_export(&self, module: &str, symbol: &str) -> Result<usize, HookError> {
        find_export_by_name(module, symbol)
    }

    unsafe fn redirect(
        &self,
        _module: &str,
        function: usize,
        replacement: usize,
        link: &OriginalSlot,
    ) -> Result<Redirect, HookError> {
        unsafe {
            redirect_inline_or(function, replacement, link, || {
                rebind_pointers(function, replacement)
            })
        }
    }

    fn watch_load(&self, module: &str, callback: LoadCallback) -> Result<(), HookError> {
        OBSERVER.get_or_init(install_observer).clone().inspect_err(|e| {
            warn!("cannot observe library loads: {}", e);
        })?;
        WATCHERS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((module.to_string(), callback));
        Ok(())
    }

    fn load(&self, module: &str) -> Result<Library, HookError> {
        let name = CString::new(module).map_err(|_| HookError::ModuleNotFound(module.to_string()))?;
        let original = ORIGINAL_DLOPEN.load(Ordering::Acquire);
        let handle = unsafe {
            if original == 0 {
                libc::dlopen(name.as_ptr(), libc::RTLD_NOW)
            } else {
                let dlopen: DlopenFn = core::mem::transmute(original);
                dlopen(name.as_ptr(), libc::RTLD_NOW)
            }
        };
        if handle.is_null() {
            return Err(HookError::ModuleNotFound(module.to_string()));
        }
        notify_loaded();
        Ok(Library::new(module, handle as usize, unload_library))
    }
}
