//! Direct3D 9 ABI: slot layout, signatures and identifiers of the
//! interfaces the shim touches.

use core::ffi::c_void;

use dxshim_intercept::{Guid, HRESULT};

pub const D3D_SDK_VERSION: u32 = 32;

pub const D3DERR_NOTAVAILABLE: HRESULT = 0x8876_086A_u32 as HRESULT;
pub const D3DERR_INVALIDCALL: HRESULT = 0x8876_086C_u32 as HRESULT;

/// Method count of `IDirect3D9` (three `IUnknown` slots included).
pub const IDIRECT3D9_SLOTS: usize = 17;
/// Method count of `IDirect3D9Ex`.
pub const IDIRECT3D9EX_SLOTS: usize = 22;
/// Method count of `IDirect3DDevice9`.
pub const IDIRECT3DDEVICE9_SLOTS: usize = 119;

pub const CREATE_DEVICE: usize = 16;
pub const CREATE_DEVICE_EX: usize = 20;

/// {02177241-69FC-400C-8FF1-93A44DF6861D}
pub const IID_IDIRECT3D9EX: Guid = Guid::new(
    0x0217_7241,
    0x69fc,
    0x400c,
    [0x8f, 0xf1, 0x93, 0xa4, 0x4d, 0xf6, 0x86, 0x1d],
);

/// {81BDCBCA-64D4-426D-AE8D-AD0147F4275C}
pub const IID_IDIRECT3D9: Guid = Guid::new(
    0x81bd_cbca,
    0x64d4,
    0x426d,
    [0xae, 0x8d, 0xad, 0x01, 0x47, 0xf4, 0x27, 0x5c],
);

pub type HWND = *mut c_void;
pub type D3DDEVTYPE = u32;

/// `D3DPRESENT_PARAMETERS`, passed through untouched.
pub enum D3DPresentParameters {}
/// `D3DDISPLAYMODEEX`, passed through untouched.
pub enum D3DDisplayModeEx {}

pub type Direct3DCreate9Fn = unsafe extern "system" fn(sdk_version: u32) -> *mut c_void;

pub type Direct3DCreate9ExFn =
    unsafe extern "system" fn(sdk_version: u32, out: *mut *mut c_void) -> HRESULT;

pub type CreateDeviceFn = unsafe extern "system" fn(
    this: *mut c_void,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
    out: *mut *mut c_void,
) -> HRESULT;

pub type CreateDeviceExFn = unsafe extern "system" fn(
    this: *mut c_void,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPresentParameters,
    fullscreen_mode: *mut D3DDisplayModeEx,
    out: *mut *mut c_void,
) -> HRESULT;

/// `IDirect3D9Ex` dispatch table; the first 17 entries are `IDirect3D9`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IDirect3D9ExVtbl {
    pub query_interface: usize,
    pub add_ref: usize,
    pub release: usize,
    pub register_software_device: usize,
    pub get_adapter_count: usize,
    pub get_adapter_identifier: usize,
    pub get_adapter_mode_count: usize,
    pub enum_adapter_modes: usize,
    pub get_adapter_display_mode: usize,
    pub check_device_type: usize,
    pub check_device_format: usize,
    pub check_device_multi_sample_type: usize,
    pub check_depth_stencil_match: usize,
    pub check_device_format_conversion: usize,
    pub get_device_caps: usize,
    pub get_adapter_monitor: usize,
    pub create_device: usize,
    pub get_adapter_mode_count_ex: usize,
    pub enum_adapter_modes_ex: usize,
    pub get_adapter_display_mode_ex: usize,
    pub create_device_ex: usize,
    pub get_adapter_luid: usize,
}
