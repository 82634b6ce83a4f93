use crate::hook::OriginalSlot;
use crate::module::{redirect_inline_or, Library, LoadCallback, Loader, Redirect};
use crate::types::HookError;
use core::ffi::c_void;
use std::ffi::CStr;
use std::sync::{Mutex, OnceLock};

use log::{debug, warn};
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{
    FreeLibrary, GetModuleHandleW, GetProcAddress, LoadLibraryW,
};
use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE};
use windows_sys::Win32::System::ProcessStatus::K32EnumProcessModules;
use windows_sys::Win32::System::Threading::GetCurrentProcess;

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(core::iter::once(0)).collect()
}

fn module_handle(name: &str) -> Option<HMODULE> {
    let wide = to_wide(name);
    let handle = unsafe { GetModuleHandleW(wide.as_ptr()) };
    (!handle.is_null()).then_some(handle)
}

/// Resolve `symbol` exported by an already loaded module.
pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize, HookError> {
    let handle = module_handle(module_name)
        .ok_or_else(|| HookError::ModuleNotFound(module_name.to_string()))?;
    export_of(handle, symbol)
}

fn export_of(handle: HMODULE, symbol: &str) -> Result<usize, HookError> {
    let mut name = symbol.as_bytes().to_vec();
    name.push(0);
    match unsafe { GetProcAddress(handle, name.as_ptr()) } {
        Some(f) => Ok(f as usize),
        None => Err(HookError::ExportNotFound(symbol.to_string())),
    }
}

/// Base addresses of every module mapped into this process.
pub fn enumerate_modules() -> Vec<usize> {
    let process = unsafe { GetCurrentProcess() };
    let mut handles: Vec<HMODULE> = vec![core::ptr::null_mut(); 256];
    loop {
        let capacity = (handles.len() * core::mem::size_of::<HMODULE>()) as u32;
        let mut needed = 0u32;
        let ok = unsafe {
            K32EnumProcessModules(process, handles.as_mut_ptr(), capacity, &mut needed)
        };
        if ok == 0 {
            return Vec::new();
        }
        let count = needed as usize / core::mem::size_of::<HMODULE>();
        if count <= handles.len() {
            handles.truncate(count);
            return handles.into_iter().map(|h| h as usize).collect();
        }
        handles.resize(count, core::ptr::null_mut());
    }
}

mod pe {
    pub const DOS_MAGIC: u16 = 0x5A4D;
    pub const NT_SIGNATURE: u32 = 0x0000_4550;
    pub const E_LFANEW: usize = 0x3C;
    pub const OPTIONAL_HEADER: usize = 24;
    pub const PE32_MAGIC: u16 = 0x10B;
    pub const PE32_PLUS_MAGIC: u16 = 0x20B;
    pub const PE32_DATA_DIRECTORIES: usize = 96;
    pub const PE32_PLUS_DATA_DIRECTORIES: usize = 112;
    pub const IMPORT_DIRECTORY: usize = 1;
    pub const DESCRIPTOR_SIZE: usize = 20;
    pub const DESCRIPTOR_NAME: usize = 12;
    pub const DESCRIPTOR_FIRST_THUNK: usize = 16;
}

unsafe fn read<T: Copy>(addr: usize) -> T {
    unsafe { core::ptr::read_unaligned(addr as *const T) }
}

/// Walk the import descriptors of the image at `base`, calling `f` with the
/// imported module name and the address of its import address table.
///
/// # Safety
/// `base` must be the base address of a mapped PE image.
pub unsafe fn for_each_import(base: usize, mut f: impl FnMut(&str, *mut usize)) {
    unsafe {
        if read::<u16>(base) != pe::DOS_MAGIC {
            return;
        }
        let nt = base + read::<u32>(base + pe::E_LFANEW) as usize;
        if read::<u32>(nt) != pe::NT_SIGNATURE {
            return;
        }
        let optional = nt + pe::OPTIONAL_HEADER;
        let directories = match read::<u16>(optional) {
            pe::PE32_PLUS_MAGIC => optional + pe::PE32_PLUS_DATA_DIRECTORIES,
            pe::PE32_MAGIC => optional + pe::PE32_DATA_DIRECTORIES,
            _ => return,
        };
        let import_rva = read::<u32>(directories + pe::IMPORT_DIRECTORY * 8) as usize;
        if import_rva == 0 {
            return;
        }

        let mut descriptor = base + import_rva;
        loop {
            let name_rva = read::<u32>(descriptor + pe::DESCRIPTOR_NAME) as usize;
            let thunk_rva = read::<u32>(descriptor + pe::DESCRIPTOR_FIRST_THUNK) as usize;
            if name_rva == 0 || thunk_rva == 0 {
                break;
            }
            let name = CStr::from_ptr((base + name_rva) as *const core::ffi::c_char);
            f(&name.to_string_lossy(), (base + thunk_rva) as *mut usize);
            descriptor += pe::DESCRIPTOR_SIZE;
        }
    }
}

/// Rewrite every import address table entry that binds `module` and holds
/// `original` so that it holds `replacement`, across all loaded images.
///
/// # Safety
/// `replacement` must have the signature of the function at `original`.
pub unsafe fn rebind_imports(
    module: &str,
    original: usize,
    replacement: usize,
) -> Result<usize, HookError> {
    if original == 0 || original == replacement {
        return Ok(0);
    }
    let mut patched = 0;
    for base in enumerate_modules() {
        unsafe {
            for_each_import(base, |name, table| {
                if !name.eq_ignore_ascii_case(module) {
                    return;
                }
                let mut entry = table;
                while *entry != 0 {
                    if *entry == original && write_entry(entry, replacement) {
                        patched += 1;
                    }
                    entry = entry.add(1);
                }
            });
        }
    }
    Ok(patched)
}

unsafe fn write_entry(entry: *mut usize, value: usize) -> bool {
    let size = core::mem::size_of::<usize>();
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    unsafe {
        if VirtualProtect(entry as *const c_void, size, PAGE_READWRITE, &mut old) == 0 {
            return false;
        }
        core::ptr::write_volatile(entry, value);
        VirtualProtect(entry as *const c_void, size, old, &mut old);
    }
    true
}

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *const u16,
}

#[repr(C)]
struct LdrDllLoadedNotificationData {
    flags: u32,
    full_dll_name: *const UnicodeString,
    base_dll_name: *const UnicodeString,
    dll_base: *mut c_void,
    size_of_image: u32,
}

const LDR_DLL_NOTIFICATION_REASON_LOADED: u32 = 1;

type LdrDllNotificationFn =
    unsafe extern "system" fn(u32, *const LdrDllLoadedNotificationData, *mut c_void);
type LdrRegisterDllNotificationFn = unsafe extern "system" fn(
    u32,
    LdrDllNotificationFn,
    *mut c_void,
    *mut *mut c_void,
) -> i32;

struct Cookie(#[allow(dead_code)] usize);

static OBSERVER: OnceLock<Result<Cookie, HookError>> = OnceLock::new();
static WATCHERS: Mutex<Vec<(String, LoadCallback)>> = Mutex::new(Vec::new());

unsafe fn unicode_to_string(s: *const UnicodeString) -> Option<String> {
    let s = unsafe { s.as_ref()? };
    if s.buffer.is_null() {
        return None;
    }
    let units = unsafe { core::slice::from_raw_parts(s.buffer, s.length as usize / 2) };
    Some(String::from_utf16_lossy(units))
}

unsafe extern "system" fn on_dll_notification(
    reason: u32,
    data: *const LdrDllLoadedNotificationData,
    _context: *mut c_void,
) {
    if reason != LDR_DLL_NOTIFICATION_REASON_LOADED {
        return;
    }
    let Some(loaded) = (unsafe { data.as_ref() }).and_then(|d| unsafe { unicode_to_string(d.base_dll_name) })
    else {
        return;
    };

    let ready: Vec<(String, LoadCallback)> = {
        let mut watchers = WATCHERS.lock().unwrap_or_else(|e| e.into_inner());
        let (ready, waiting) = std::mem::take(&mut *watchers)
            .into_iter()
            .partition(|(name, _)| name.eq_ignore_ascii_case(&loaded));
        *watchers = waiting;
        ready
    };

    for (name, callback) in ready {
        debug!("{} loaded, running deferred hooks", name);
        callback();
    }
}

fn register_observer() -> Result<Cookie, HookError> {
    let ntdll =
        module_handle("ntdll.dll").ok_or_else(|| HookError::ModuleNotFound("ntdll.dll".into()))?;
    let register = export_of(ntdll, "LdrRegisterDllNotification")?;
    let register: LdrRegisterDllNotificationFn = unsafe { core::mem::transmute(register) };
    let mut cookie: *mut c_void = core::ptr::null_mut();
    let status = unsafe { register(0, on_dll_notification, core::ptr::null_mut(), &mut cookie) };
    if status < 0 {
        warn!("LdrRegisterDllNotification failed: {:#x}", status);
        return Err(HookError::Unsupported);
    }
    Ok(Cookie(cookie as usize))
}

fn unload_library(handle: usize) {
    unsafe {
        FreeLibrary(handle as HMODULE);
    }
}

/// [`Loader`] over the Windows module loader.
#[derive(Debug, Default)]
pub struct PeLoader;

impl Loader for PeLoader {
    fn is_resident(&self, module: &str) -> bool {
        module_handle(module).is_some()
    }

    fn resolve_export(&self, module: &str, symbol: &str) -> Result<usize, HookError> {
        find_export_by_name(module, symbol)
    }

    unsafe fn redirect(
        &self,
        module: &str,
        function: usize,
        replacement: usize,
        link: &OriginalSlot,
    ) -> Result<Redirect, HookError> {
        unsafe {
            redirect_inline_or(function, replacement, link, || {
                rebind_imports(module, function, replacement)
            })
        }
    }

    fn watch_load(&self, module: &str, callback: LoadCallback) -> Result<(), HookError> {
        if let Err(e) = OBSERVER.get_or_init(register_observer) {
            return Err(e.clone());
        }
        WATCHERS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((module.to_string(), callback));
        Ok(())
    }

    fn load(&self, module: &str) -> Result<Library, HookError> {
        let wide = to_wide(module);
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            return Err(HookError::ModuleNotFound(module.to_string()));
        }
        Ok(Library::new(module, handle as usize, unload_library))
    }
}
