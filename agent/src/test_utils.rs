//! Mock Direct3D 9 objects for the agent tests.
//!
//! Factories and devices are heap objects whose first field is a dispatch
//! table of `extern "system"` functions, like the real runtime's. Reference
//! counts and call records live in shared state so tests can inspect them
//! after the object is gone.

use core::ffi::c_void;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dxshim_intercept::com::unknown::{E_NOINTERFACE, E_POINTER, S_OK};
use dxshim_intercept::{Guid, HRESULT};

use crate::d3d9::ffi::{
    D3DDisplayModeEx, D3DPresentParameters, IDirect3D9ExVtbl, D3DDEVTYPE, D3DERR_INVALIDCALL, HWND,
    IDIRECT3DDEVICE9_SLOTS, IID_IDIRECT3D9, IID_IDIRECT3D9EX,
};

/// {00000000-0000-0000-C000-000000000046}
const IID_IUNKNOWN: Guid = Guid::new(0, 0, 0, [0xc0, 0, 0, 0, 0, 0, 0, 0x46]);

/// Returned by slot 4 (`GetAdapterCount`) of every mock factory.
pub const MOCK_ADAPTER_COUNT: u32 = 3;
/// Returned by slot 3 (`TestCooperativeLevel`) of every mock device.
pub const MOCK_COOPERATIVE_LEVEL: HRESULT = 0x0876_0001;

/// Arguments seen by a device creation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCall {
    pub adapter: u32,
    pub device_type: D3DDEVTYPE,
    pub focus_window: usize,
    pub behavior_flags: u32,
    pub params: usize,
}

/// Behavior and bookkeeping of one mock factory.
#[derive(Debug)]
pub struct FactoryState {
    pub refs: AtomicU32,
    /// Answer `QueryInterface(IID_IDirect3D9Ex)`.
    pub supports_ex: bool,
    /// Result of `CreateDevice`; a device is produced when it succeeds.
    pub create_device_result: HRESULT,
    /// Result of `CreateDeviceEx`; a device is produced when it succeeds.
    pub create_device_ex_result: HRESULT,
    pub ex_queries: AtomicU32,
    pub create_device_calls: Mutex<Vec<DeviceCall>>,
    pub create_device_ex_calls: Mutex<Vec<DeviceCall>>,
    pub destroyed: AtomicU32,
    /// States of the devices this factory created.
    pub devices: Mutex<Vec<Arc<DeviceState>>>,
}

impl FactoryState {
    pub fn new(supports_ex: bool) -> Arc<Self> {
        Self::with_results(supports_ex, S_OK, S_OK)
    }

    pub fn with_results(
        supports_ex: bool,
        create_device_result: HRESULT,
        create_device_ex_result: HRESULT,
    ) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicU32::new(0),
            supports_ex,
            create_device_result,
            create_device_ex_result,
            ex_queries: AtomicU32::new(0),
            create_device_calls: Mutex::new(Vec::new()),
            create_device_ex_calls: Mutex::new(Vec::new()),
            destroyed: AtomicU32::new(0),
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn baseline_calls(&self) -> Vec<DeviceCall> {
        self.create_device_calls.lock().unwrap().clone()
    }

    pub fn enhanced_calls(&self) -> Vec<DeviceCall> {
        self.create_device_ex_calls.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct DeviceState {
    pub refs: AtomicU32,
    pub enhanced: bool,
    pub destroyed: AtomicU32,
}

#[repr(C)]
pub struct MockFactory {
    vtbl: *const IDirect3D9ExVtbl,
    state: Arc<FactoryState>,
}

#[repr(C)]
pub struct MockDevice {
    vtbl: *const [usize; IDIRECT3DDEVICE9_SLOTS],
    state: Arc<DeviceState>,
}

/// A new factory holding one reference.
pub fn new_factory(state: &Arc<FactoryState>) -> *mut c_void {
    state.refs.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(Box::new(MockFactory {
        vtbl: factory_vtable(),
        state: Arc::clone(state),
    })) as *mut c_void
}

fn new_device(enhanced: bool) -> (*mut c_void, Arc<DeviceState>) {
    let state = Arc::new(DeviceState {
        refs: AtomicU32::new(1),
        enhanced,
        destroyed: AtomicU32::new(0),
    });
    let device = Box::into_raw(Box::new(MockDevice {
        vtbl: device_vtable(),
        state: Arc::clone(&state),
    })) as *mut c_void;
    (device, state)
}

pub fn factory_vtable() -> *const IDirect3D9ExVtbl {
    static VTABLE: OnceLock<IDirect3D9ExVtbl> = OnceLock::new();
    VTABLE.get_or_init(|| IDirect3D9ExVtbl {
        query_interface: factory_query_interface as usize,
        add_ref: factory_add_ref as usize,
        release: factory_release as usize,
        get_adapter_count: factory_get_adapter_count as usize,
        create_device: factory_create_device as usize,
        create_device_ex: factory_create_device_ex as usize,
        ..IDirect3D9ExVtbl::default()
    })
}

pub fn device_vtable() -> *const [usize; IDIRECT3DDEVICE9_SLOTS] {
    static VTABLE: OnceLock<[usize; IDIRECT3DDEVICE9_SLOTS]> = OnceLock::new();
    VTABLE.get_or_init(|| {
        let mut table = [0usize; IDIRECT3DDEVICE9_SLOTS];
        table[0] = device_query_interface as usize;
        table[1] = device_add_ref as usize;
        table[2] = device_release as usize;
        table[3] = device_test_cooperative_level as usize;
        table
    })
}

unsafe fn factory<'a>(this: *mut c_void) -> &'a MockFactory {
    unsafe { &*(this as *const MockFactory) }
}

unsafe fn device<'a>(this: *mut c_void) -> &'a MockDevice {
    unsafe { &*(this as *const MockDevice) }
}

unsafe extern "system" fn factory_query_interface(
    this: *mut c_void,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> HRESULT {
    if out.is_null() {
        return E_POINTER;
    }
    let state = unsafe { &factory(this).state };
    let iid = unsafe { *iid };
    if iid == IID_IDIRECT3D9EX {
        state.ex_queries.fetch_add(1, Ordering::SeqCst);
    }
    let supported = iid == IID_IUNKNOWN
        || iid == IID_IDIRECT3D9
        || (iid == IID_IDIRECT3D9EX && state.supports_ex);
    unsafe {
        if supported {
            factory_add_ref(this);
            *out = this;
            S_OK
        } else {
            *out = core::ptr::null_mut();
            E_NOINTERFACE
        }
    }
}

unsafe extern "system" fn factory_add_ref(this: *mut c_void) -> u32 {
    unsafe { factory(this).state.refs.fetch_add(1, Ordering::SeqCst) + 1 }
}

unsafe extern "system" fn factory_release(this: *mut c_void) -> u32 {
    let left = unsafe { factory(this).state.refs.fetch_sub(1, Ordering::SeqCst) - 1 };
    if left == 0 {
        let object = unsafe { Box::from_raw(this as *mut MockFactory) };
        object.state.destroyed.fetch_add(1, Ordering::SeqCst);
    }
    left
}

unsafe extern "system" fn factory_get_adapter_count(_this: *mut c_void) -> u32 {
    MOCK_ADAPTER_COUNT
}

fn record(
    calls: &Mutex<Vec<DeviceCall>>,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
) {
    calls.lock().unwrap().push(DeviceCall {
        adapter,
        device_type,
        focus_window: focus_window as usize,
        behavior_flags,
        params: params as usize,
    });
}

fn produce_device(
    state: &FactoryState,
    result: HRESULT,
    enhanced: bool,
    out: *mut *mut c_void,
) -> HRESULT {
    if out.is_null() {
        return D3DERR_INVALIDCALL;
    }
    if result < 0 {
        return result;
    }
    let (device, device_state) = new_device(enhanced);
    state.devices.lock().unwrap().push(device_state);
    unsafe { *out = device };
    result
}

unsafe extern "system" fn factory_create_device(
    this: *mut c_void,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
    out: *mut *mut c_void,
) -> HRESULT {
    let state = unsafe { &factory(this).state };
    record(&state.create_device_calls, adapter, device_type, focus_window, behavior_flags, params);
    produce_device(state, state.create_device_result, false, out)
}

unsafe extern "system" fn factory_create_device_ex(
    this: *mut c_void,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
    _fullscreen_mode: *mut D3DDisplayModeEx,
    out: *mut *mut c_void,
) -> HRESULT {
    let state = unsafe { &factory(this).state };
    record(&state.create_device_ex_calls, adapter, device_type, focus_window, behavior_flags, params);
    produce_device(state, state.create_device_ex_result, true, out)
}

unsafe extern "system" fn device_query_interface(
    _this: *mut c_void,
    _iid: *const Guid,
    out: *mut *mut c_void,
) -> HRESULT {
    unsafe { *out = core::ptr::null_mut() };
    E_NOINTERFACE
}

unsafe extern "system" fn device_add_ref(this: *mut c_void) -> u32 {
    unsafe { device(this).state.refs.fetch_add(1, Ordering::SeqCst) + 1 }
}

unsafe extern "system" fn device_release(this: *mut c_void) -> u32 {
    let left = unsafe { device(this).state.refs.fetch_sub(1, Ordering::SeqCst) - 1 };
    if left == 0 {
        let object = unsafe { Box::from_raw(this as *mut MockDevice) };
        object.state.destroyed.fetch_add(1, Ordering::SeqCst);
    }
    left
}

unsafe extern "system" fn device_test_cooperative_level(_this: *mut c_void) -> HRESULT {
    MOCK_COOPERATIVE_LEVEL
}

/// What the mock `Direct3DCreate9`/`Direct3DCreate9Ex` entry points do on
/// the current thread.
#[derive(Default)]
pub struct MockRuntime {
    /// Factory handed out by `Direct3DCreate9`; `None` makes it return null.
    pub standard: Option<Arc<FactoryState>>,
    /// Factory handed out by `Direct3DCreate9Ex`, or its failure code.
    pub enhanced: Option<Result<Arc<FactoryState>, HRESULT>>,
    pub standard_calls: u32,
    pub enhanced_calls: u32,
    pub sdk_versions: Vec<u32>,
}

thread_local! {
    static RUNTIME: RefCell<MockRuntime> = RefCell::new(MockRuntime::default());
}

pub fn set_runtime(runtime: MockRuntime) {
    RUNTIME.with(|r| *r.borrow_mut() = runtime);
}

pub fn with_runtime<R>(f: impl FnOnce(&MockRuntime) -> R) -> R {
    RUNTIME.with(|r| f(&r.borrow()))
}

pub unsafe extern "system" fn mock_direct3d_create9(sdk_version: u32) -> *mut c_void {
    RUNTIME.with(|r| {
        let mut runtime = r.borrow_mut();
        runtime.standard_calls += 1;
        runtime.sdk_versions.push(sdk_version);
        match &runtime.standard {
            Some(state) => new_factory(state),
            None => core::ptr::null_mut(),
        }
    })
}

pub unsafe extern "system" fn mock_direct3d_create9_ex(
    sdk_version: u32,
    out: *mut *mut c_void,
) -> HRESULT {
    RUNTIME.with(|r| {
        let mut runtime = r.borrow_mut();
        runtime.enhanced_calls += 1;
        runtime.sdk_versions.push(sdk_version);
        match &runtime.enhanced {
            Some(Ok(state)) => {
                unsafe { *out = new_factory(state) };
                S_OK
            }
            Some(Err(hr)) => *hr,
            None => crate::d3d9::ffi::D3DERR_NOTAVAILABLE,
        }
    })
}
