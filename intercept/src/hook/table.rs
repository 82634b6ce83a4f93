use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::hook::SymbolHook;
use crate::module::{Loader, Redirect};

type PendingKey = (String, usize);

/// Applies [`SymbolHook`] sets against named modules, now or when the module
/// is later loaded.
pub struct HookTable {
    loader: Arc<dyn Loader>,
    pending: Arc<Mutex<HashSet<PendingKey>>>,
}

impl HookTable {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Self {
            loader,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.loader
    }

    /// Bind `hooks` against `module`.
    ///
    /// A resident module is hooked immediately. Otherwise a load watcher is
    /// registered once per (module, hook set) and residency is checked again
    /// so that a load racing the registration still gets hooked.
    pub fn apply(&self, module: &str, hooks: &'static [SymbolHook]) {
        if self.loader.is_resident(module) {
            bind_resident(self.loader.as_ref(), module, hooks);
            return;
        }

        let key = (module.to_ascii_lowercase(), hooks.as_ptr() as usize);
        let newly_pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());

        if newly_pending {
            let loader = Arc::clone(&self.loader);
            let pending = Arc::clone(&self.pending);
            let target = module.to_string();
            let callback = Box::new(move || {
                pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                bind_resident(loader.as_ref(), &target, hooks);
            });

            match self.loader.watch_load(module, callback) {
                Ok(()) => debug!("{} not loaded yet, hooks deferred", module),
                Err(e) => {
                    warn!("cannot defer hooks for {}: {}", module, e);
                    self.pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&(module.to_ascii_lowercase(), hooks.as_ptr() as usize));
                }
            }
        }

        if self.loader.is_resident(module) {
            bind_resident(self.loader.as_ref(), module, hooks);
        }
    }

    pub fn is_pending(&self, module: &str, hooks: &'static [SymbolHook]) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(module.to_ascii_lowercase(), hooks.as_ptr() as usize))
    }
}

fn bind_resident(loader: &dyn Loader, module: &str, hooks: &[SymbolHook]) {
    for hook in hooks {
        let patch = hook.patch_address();
        let function = match loader.resolve_export(module, hook.symbol) {
            // The export itself is ours; nothing left to route.
            Ok(addr) if addr == patch => continue,
            Ok(addr) => addr,
            Err(e) => {
                warn!("{}!{} not hooked: {}", module, hook.symbol, e);
                continue;
            }
        };

        match unsafe { loader.redirect(module, function, patch, hook.link) } {
            Ok(Redirect::Inline { trampoline }) => info!(
                "{}!{} hooked at its entry, original via {:#x}",
                module, hook.symbol, trampoline
            ),
            Ok(Redirect::Imports { slots }) => info!(
                "{}!{} hooked ({} import slots)",
                module, hook.symbol, slots
            ),
            Err(e) => warn!("{}!{} redirect failed: {}", module, hook.symbol, e),
        }
        if let Some(original) = hook.link.get() {
            debug!("{}!{} original at {:#x}", module, hook.symbol, original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::OriginalSlot;
    use crate::module::{Library, LoadCallback};
    use crate::types::HookError;
    use core::ffi::c_void;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockLoader {
        resident: AtomicBool,
        exports: Mutex<HashMap<&'static str, usize>>,
        redirects: Mutex<Vec<(usize, usize)>>,
        inline: AtomicBool,
        watchers: Mutex<Vec<LoadCallback>>,
        watch_calls: AtomicUsize,
    }

    impl MockLoader {
        fn export(&self, symbol: &'static str, addr: usize) {
            self.exports.lock().unwrap().insert(symbol, addr);
        }

        fn fire_load(&self) {
            self.resident.store(true, Ordering::SeqCst);
            let watchers = std::mem::take(&mut *self.watchers.lock().unwrap());
            for callback in watchers {
                callback();
            }
        }
    }

    impl Loader for MockLoader {
        fn is_resident(&self, _module: &str) -> bool {
            self.resident.load(Ordering::SeqCst)
        }

        fn resolve_export(&self, _module: &str, symbol: &str) -> Result<usize, HookError> {
            self.exports
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| HookError::ExportNotFound(symbol.to_string()))
        }

        unsafe fn redirect(
            &self,
            _module: &str,
            function: usize,
            replacement: usize,
            link: &OriginalSlot,
        ) -> Result<Redirect, HookError> {
            self.redirects.lock().unwrap().push((function, replacement));
            if self.inline.load(Ordering::SeqCst) {
                let trampoline = function + TRAMPOLINE_OFFSET;
                link.supersede(function, trampoline);
                Ok(Redirect::Inline { trampoline })
            } else {
                link.bind(function);
                Ok(Redirect::Imports { slots: 1 })
            }
        }

        fn watch_load(&self, _module: &str, callback: LoadCallback) -> Result<(), HookError> {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            self.watchers.lock().unwrap().push(callback);
            Ok(())
        }

        fn load(&self, module: &str) -> Result<Library, HookError> {
            Err(HookError::ModuleNotFound(module.to_string()))
        }
    }

    const TRAMPOLINE_OFFSET: usize = 0x100;

    fn leak(hooks: Vec<SymbolHook>) -> &'static [SymbolHook] {
        Box::leak(hooks.into_boxed_slice())
    }

    static ANSWER_ORIGINAL: OriginalSlot = OriginalSlot::new();

    extern "C" fn real_answer() -> u32 {
        42
    }

    extern "C" fn patched_answer() -> u32 {
        let next = unsafe { ANSWER_ORIGINAL.as_fn::<extern "C" fn() -> u32>() };
        next.map_or(0, |f| f() + 1)
    }

    #[test]
    fn reapplying_keeps_the_true_original() {
        let loader = Arc::new(MockLoader::default());
        loader.resident.store(true, Ordering::SeqCst);
        loader.export("answer", real_answer as usize);
        let table = HookTable::new(loader.clone());
        let hooks = leak(vec![SymbolHook::new(
            "answer",
            patched_answer as *const c_void,
            &ANSWER_ORIGINAL,
        )]);

        table.apply("d3d9.dll", hooks);
        // The export now reports the replacement, as after a real rebind.
        loader.export("answer", patched_answer as usize);
        table.apply("d3d9.dll", hooks);

        assert_eq!(ANSWER_ORIGINAL.get(), Some(real_answer as usize));
        assert_eq!(patched_answer(), 43);
        let redirects = loader.redirects.lock().unwrap();
        assert!(redirects
            .iter()
            .all(|&(from, to)| from == real_answer as usize && to == patched_answer as usize));
    }

    extern "C" fn deferred_patch() {}

    #[test]
    fn deferred_hooks_bind_on_load() {
        static SLOT: OriginalSlot = OriginalSlot::new();
        let loader = Arc::new(MockLoader::default());
        loader.export("Direct3DCreate9", 0x5000);
        let table = HookTable::new(loader.clone());
        let hooks = leak(vec![SymbolHook::new(
            "Direct3DCreate9",
            deferred_patch as *const c_void,
            &SLOT,
        )]);

        table.apply("d3d9.dll", hooks);
        assert!(!SLOT.is_bound());
        assert!(table.is_pending("D3D9.DLL", hooks));

        loader.fire_load();
        assert_eq!(SLOT.get(), Some(0x5000));
        assert!(!table.is_pending("d3d9.dll", hooks));
        assert_eq!(
            loader.redirects.lock().unwrap().as_slice(),
            &[(0x5000, deferred_patch as usize)]
        );
    }

    #[test]
    fn pending_registration_happens_once() {
        static SLOT: OriginalSlot = OriginalSlot::new();
        let loader = Arc::new(MockLoader::default());
        let table = HookTable::new(loader.clone());
        let hooks = leak(vec![SymbolHook::new(
            "Direct3DCreate9",
            deferred_patch as *const c_void,
            &SLOT,
        )]);

        table.apply("d3d9.dll", hooks);
        table.apply("d3d9.dll", hooks);
        assert_eq!(loader.watch_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_export_leaves_hook_inert() {
        static PRESENT: OriginalSlot = OriginalSlot::new();
        static ABSENT: OriginalSlot = OriginalSlot::new();
        let loader = Arc::new(MockLoader::default());
        loader.resident.store(true, Ordering::SeqCst);
        loader.export("Direct3DCreate9", 0x6000);
        let table = HookTable::new(loader.clone());
        let hooks = leak(vec![
            SymbolHook::new("Direct3DCreate9", deferred_patch as *const c_void, &PRESENT),
            SymbolHook::new("Direct3DCreate9Ex", deferred_patch as *const c_void, &ABSENT),
        ]);

        table.apply("d3d9.dll", hooks);
        assert_eq!(PRESENT.get(), Some(0x6000));
        assert!(!ABSENT.is_bound());
        assert_eq!(loader.redirects.lock().unwrap().len(), 1);
    }

    #[test]
    fn inline_redirect_binds_the_trampoline() {
        static SLOT: OriginalSlot = OriginalSlot::new();
        let loader = Arc::new(MockLoader::default());
        loader.resident.store(true, Ordering::SeqCst);
        loader.inline.store(true, Ordering::SeqCst);
        loader.export("Direct3DCreate9", 0x7000);
        let table = HookTable::new(loader.clone());
        let hooks = leak(vec![SymbolHook::new(
            "Direct3DCreate9",
            deferred_patch as *const c_void,
            &SLOT,
        )]);

        table.apply("d3d9.dll", hooks);
        // An inline-patched export still resolves to its own entry.
        table.apply("d3d9.dll", hooks);
        assert_eq!(SLOT.get(), Some(0x7000 + TRAMPOLINE_OFFSET));
        assert_eq!(loader.redirects.lock().unwrap().len(), 2);
    }

    #[test]
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    fn runtime_resolved_callers_reach_the_replacement() {
        use std::ffi::CString;

        const MARK: libc::pid_t = 1 << 24;
        static GETPPID: OriginalSlot = OriginalSlot::new();

        extern "C" fn marked_getppid() -> libc::pid_t {
            let next = unsafe { GETPPID.as_fn::<extern "C" fn() -> libc::pid_t>() };
            next.map_or(-1, |f| f() + MARK)
        }

        let Some(libc_name) = crate::module::enumerate_modules()
            .into_iter()
            .map(|m| m.name)
            .find(|name| name.starts_with("libc.so"))
        else {
            return;
        };
        let parent = unsafe { libc::getppid() };

        let table = HookTable::new(crate::module::platform_loader());
        let hooks = leak(vec![SymbolHook::new(
            "getppid",
            marked_getppid as *const c_void,
            &GETPPID,
        )]);
        table.apply(&libc_name, hooks);

        // Resolved by name after the hook went in, bypassing every import slot.
        let name = CString::new("getppid").unwrap();
        let resolved = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        assert!(!resolved.is_null());
        let resolved: extern "C" fn() -> libc::pid_t = unsafe { core::mem::transmute(resolved) };
        assert_eq!(resolved(), parent + MARK);
        assert_eq!(unsafe { libc::getppid() }, parent + MARK);

        let original = unsafe { GETPPID.as_fn::<extern "C" fn() -> libc::pid_t>() }.expect("bound");
        assert_eq!(original(), parent);
    }
}
