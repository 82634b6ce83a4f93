use core::ffi::c_void;

use dxshim_intercept::com::unknown::{succeeded, E_FAIL, E_OUTOFMEMORY, E_POINTER};
use dxshim_intercept::{ComProxy, ComRef, HookError, HRESULT};
use log::{debug, info, warn};

use crate::context;
use crate::d3d9::device;
use crate::d3d9::ffi::{
    Direct3DCreate9ExFn, Direct3DCreate9Fn, CREATE_DEVICE, D3DERR_NOTAVAILABLE,
};
use crate::negotiate::{Declined, Negotiation};

const ENHANCED: &str = "Direct3DCreate9Ex";
const STANDARD: &str = "Direct3DCreate9";

/// Which factory entry point produced an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPath {
    Enhanced,
    Standard,
}

/// The original factory entry points and whether to prefer the enhanced one.
#[derive(Debug, Clone, Copy)]
pub struct FactoryPolicy {
    create9: Option<Direct3DCreate9Fn>,
    create9ex: Option<Direct3DCreate9ExFn>,
    prefer_enhanced: bool,
}

impl FactoryPolicy {
    pub fn new(
        create9: Option<Direct3DCreate9Fn>,
        create9ex: Option<Direct3DCreate9ExFn>,
        prefer_enhanced: bool,
    ) -> Self {
        Self {
            create9,
            create9ex,
            prefer_enhanced,
        }
    }

    /// The originals bound by the hook table, under the process config.
    pub fn current() -> Self {
        let (create9, create9ex) = context::originals();
        Self::new(create9, create9ex, context::enhanced_allowed())
    }

    /// Create a real factory, enhanced first. `None` when every path
    /// failed; the baseline's null result is passed on as is.
    pub fn create(&self, sdk_version: u32) -> Option<(ComRef, CreationPath)> {
        let outcome = Negotiation::new("Direct3DCreate9", D3DERR_NOTAVAILABLE)
            .strategy(ENHANCED, || self.create_enhanced(sdk_version))
            .strategy(STANDARD, || self.create_standard(sdk_version))
            .run();

        match outcome {
            Ok(negotiated) => {
                let path = if negotiated.strategy == ENHANCED {
                    CreationPath::Enhanced
                } else {
                    CreationPath::Standard
                };
                info!("{} created a factory", negotiated.strategy);
                Some((negotiated.value, path))
            }
            Err(hr) => {
                warn!("no Direct3D 9 factory could be created ({:#010x})", hr);
                None
            }
        }
    }

    fn create_enhanced(&self, sdk_version: u32) -> Result<ComRef, Declined> {
        let Some(create9ex) = self.create9ex.filter(|_| self.prefer_enhanced) else {
            return Err(Declined::Unavailable);
        };
        let mut out: *mut c_void = core::ptr::null_mut();
        let hr = unsafe { create9ex(sdk_version, &mut out) };
        if !succeeded(hr) {
            return Err(Declined::Failed(hr));
        }
        unsafe { ComRef::from_raw(out) }.ok_or(Declined::Failed(E_POINTER))
    }

    fn create_standard(&self, sdk_version: u32) -> Result<ComRef, Declined> {
        let create9 = self.create9.ok_or(Declined::Unavailable)?;
        unsafe { ComRef::from_raw(create9(sdk_version)) }.ok_or(Declined::Failed(E_FAIL))
    }

    /// `Direct3DCreate9Ex` semantics: call the original and wrap what it
    /// returns. Failure codes from the original come back unchanged.
    ///
    /// # Safety
    /// `out` must be null or valid for a pointer write.
    pub unsafe fn create_ex(&self, sdk_version: u32, out: *mut *mut c_void) -> HRESULT {
        let Some(create9ex) = self.create9ex else {
            warn!("Direct3DCreate9Ex is not available");
            return D3DERR_NOTAVAILABLE;
        };
        let hr = unsafe { create9ex(sdk_version, out) };
        if !succeeded(hr) || out.is_null() {
            return hr;
        }
        let Some(factory) = (unsafe { ComRef::from_raw(*out) }) else {
            return hr;
        };
        match wrap_factory(factory, crate::d3d9::ffi::IDIRECT3D9EX_SLOTS) {
            Ok(proxy) => {
                unsafe { *out = proxy };
                hr
            }
            Err(e) => {
                warn!("cannot wrap IDirect3D9Ex: {}", e);
                unsafe { *out = core::ptr::null_mut() };
                hresult_of(&e)
            }
        }
    }
}

/// Wrap a real factory, routing `CreateDevice` to the negotiating override.
pub fn wrap_factory(factory: ComRef, table_size: usize) -> Result<*mut c_void, HookError> {
    let mut builder = ComProxy::wrap(factory, table_size)?;
    builder.set_slot(CREATE_DEVICE, device::create_device as *const c_void)?;
    let proxy = builder.seal();
    debug!("factory proxy {:p} ({} slots)", proxy, table_size);
    Ok(proxy)
}

pub(crate) fn hresult_of(error: &HookError) -> HRESULT {
    match error {
        HookError::AllocationFailed => E_OUTOFMEMORY,
        _ => E_FAIL,
    }
}
