//! The `IDirect3D9::CreateDevice` override: prefer `CreateDeviceEx` when the
//! real factory is an `IDirect3D9Ex`, otherwise create the device exactly as
//! the caller asked.

use core::ffi::c_void;

use dxshim_intercept::com::unknown::{method, query_interface, succeeded, E_POINTER};
use dxshim_intercept::{ComProxy, ComRef, HookError, HRESULT};
use log::{debug, info, warn};

use crate::context;
use crate::d3d9::factory::hresult_of;
use crate::d3d9::ffi::{
    CreateDeviceExFn, CreateDeviceFn, D3DPresentParameters, D3DDEVTYPE, HWND, CREATE_DEVICE,
    CREATE_DEVICE_EX, D3DERR_INVALIDCALL, D3DERR_NOTAVAILABLE, IDIRECT3DDEVICE9_SLOTS,
    IID_IDIRECT3D9EX,
};
use crate::negotiate::{Declined, Negotiation};

/// Turns a freshly created enhanced device into what the caller receives.
type WrapDevice = fn(ComRef) -> Result<*mut c_void, HookError>;

/// The caller's `CreateDevice` arguments, passed on untouched.
#[derive(Debug, Clone, Copy)]
struct DeviceRequest {
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
    out: *mut *mut c_void,
}

/// Installed in slot 16 of every factory proxy.
pub(crate) unsafe extern "system" fn create_device(
    this: *mut c_void,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
    out: *mut *mut c_void,
) -> HRESULT {
    debug!("IDirect3D9::CreateDevice(adapter {}, type {})", adapter, device_type);

    let Some(proxy) = (unsafe { ComProxy::downcast(this) }) else {
        warn!("CreateDevice called on an object that is not a factory proxy");
        return D3DERR_INVALIDCALL;
    };

    let request = DeviceRequest {
        adapter,
        device_type,
        focus_window,
        behavior_flags,
        params,
        out,
    };
    unsafe { negotiate(proxy.real(), &request, context::enhanced_allowed(), wrap_device) }
}

fn wrap_device(device: ComRef) -> Result<*mut c_void, HookError> {
    ComProxy::wrap(device, IDIRECT3DDEVICE9_SLOTS).map(|builder| builder.seal())
}

/// Run the device strategies against the real factory `real`.
///
/// A null `request.out` goes straight to the baseline, which rejects it the
/// way the runtime does.
///
/// # Safety
/// `real` must be a live `IDirect3D9` and `request.out` null or valid for
/// writes.
unsafe fn negotiate(
    real: *mut c_void,
    request: &DeviceRequest,
    allow_enhanced: bool,
    wrap: WrapDevice,
) -> HRESULT {
    let outcome = Negotiation::new("CreateDevice", D3DERR_NOTAVAILABLE)
        .strategy("CreateDeviceEx", || unsafe {
            if allow_enhanced && !request.out.is_null() {
                create_enhanced(real, request, wrap)
            } else {
                Err(Declined::Unavailable)
            }
        })
        .strategy("CreateDevice", || unsafe { create_baseline(real, request) })
        .run();

    match outcome {
        Ok(negotiated) => negotiated.value,
        Err(hr) => hr,
    }
}

unsafe fn create_enhanced(
    real: *mut c_void,
    request: &DeviceRequest,
    wrap: WrapDevice,
) -> Result<HRESULT, Declined> {
    let factory_ex = unsafe { query_interface(real, &IID_IDIRECT3D9EX) }.map_err(|hr| {
        debug!("factory is not IDirect3D9Ex ({:#010x})", hr);
        Declined::Unavailable
    })?;

    let mut device: *mut c_void = core::ptr::null_mut();
    let hr = unsafe {
        let create_device_ex: CreateDeviceExFn = method(factory_ex.as_raw(), CREATE_DEVICE_EX);
        create_device_ex(
            factory_ex.as_raw(),
            request.adapter,
            request.device_type,
            request.focus_window,
            request.behavior_flags,
            request.params,
            core::ptr::null_mut(),
            &mut device,
        )
    };
    drop(factory_ex);

    if !succeeded(hr) {
        warn!("CreateDeviceEx failed with {:#010x}, falling back", hr);
        return Err(Declined::Failed(hr));
    }
    let device = unsafe { ComRef::from_raw(device) }.ok_or(Declined::Failed(E_POINTER))?;

    // A refused wrap has already released the device.
    match wrap(device) {
        Ok(proxy) => {
            unsafe { *request.out = proxy };
            info!("created an IDirect3DDevice9Ex device");
            Ok(hr)
        }
        Err(e) => {
            warn!("cannot wrap the enhanced device: {}", e);
            Err(Declined::Failed(hresult_of(&e)))
        }
    }
}

unsafe fn create_baseline(real: *mut c_void, request: &DeviceRequest) -> Result<HRESULT, Declined> {
    let hr = unsafe {
        let create_device: CreateDeviceFn = method(real, CREATE_DEVICE);
        create_device(
            real,
            request.adapter,
            request.device_type,
            request.focus_window,
            request.behavior_flags,
            request.params,
            request.out,
        )
    };
    if succeeded(hr) {
        info!("created a standard IDirect3DDevice9 device");
        Ok(hr)
    } else {
        Err(Declined::Failed(hr))
    }
}
