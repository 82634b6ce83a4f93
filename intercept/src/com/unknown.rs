//! The `IUnknown` layer shared by every vtable-based interface.
//!
//! Objects are opaque pointers whose first word points at a table of
//! `extern "system"` function pointers. Slots 0..3 are always
//! `QueryInterface`, `AddRef` and `Release`.

use core::ffi::c_void;
use core::ptr::NonNull;

#[allow(clippy::upper_case_acronyms)]
pub type HRESULT = i32;

pub const S_OK: HRESULT = 0;
pub const E_NOINTERFACE: HRESULT = 0x8000_4002_u32 as i32;
pub const E_POINTER: HRESULT = 0x8000_4003_u32 as i32;
pub const E_FAIL: HRESULT = 0x8000_4005_u32 as i32;
pub const E_OUTOFMEMORY: HRESULT = 0x8007_000E_u32 as i32;

pub const QUERY_INTERFACE: usize = 0;
pub const ADD_REF: usize = 1;
pub const RELEASE: usize = 2;
/// Number of slots every interface starts with.
pub const UNKNOWN_SLOTS: usize = 3;

#[inline]
pub fn succeeded(hr: HRESULT) -> bool {
    hr >= 0
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }
}

pub type QueryInterfaceFn =
    unsafe extern "system" fn(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> HRESULT;
pub type AddRefFn = unsafe extern "system" fn(this: *mut c_void) -> u32;
pub type ReleaseFn = unsafe extern "system" fn(this: *mut c_void) -> u32;

/// Pointer to the dispatch table of `object`.
///
/// # Safety
/// `object` must be a live vtable-based object.
#[inline]
pub unsafe fn vtable(object: *mut c_void) -> *const *const c_void {
    unsafe { *(object as *const *const *const c_void) }
}

/// Raw entry `index` of `object`'s dispatch table.
///
/// # Safety
/// `object` must be live and its table must have more than `index` slots.
#[inline]
pub unsafe fn slot(object: *mut c_void, index: usize) -> *const c_void {
    unsafe { *vtable(object).add(index) }
}

/// Entry `index` of `object`'s dispatch table as a typed function pointer.
///
/// # Safety
/// Same as [`slot`], and `F` must be the `extern "system"` function pointer
/// type of that method.
#[inline]
pub unsafe fn method<F: Copy>(object: *mut c_void, index: usize) -> F {
    debug_assert_eq!(core::mem::size_of::<F>(), core::mem::size_of::<*const c_void>());
    unsafe {
        let raw = slot(object, index);
        core::mem::transmute_copy(&raw)
    }
}

/// An owned reference on a vtable-based object.
///
/// Dropping it calls the object's `Release` exactly once.
#[derive(Debug)]
pub struct ComRef(NonNull<c_void>);

impl ComRef {
    /// Take ownership of one reference on `object`. Returns `None` for null.
    ///
    /// # Safety
    /// `object` must be null or a live object whose caller owns one reference.
    pub unsafe fn from_raw(object: *mut c_void) -> Option<Self> {
        NonNull::new(object).map(Self)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Give the reference back to the caller without releasing it.
    pub fn into_raw(self) -> *mut c_void {
        let raw = self.0.as_ptr();
        core::mem::forget(self);
        raw
    }

    /// `QueryInterface` for `iid`; the returned reference is owned.
    pub fn query_interface(&self, iid: &Guid) -> Result<ComRef, HRESULT> {
        unsafe { query_interface(self.as_raw(), iid) }
    }
}

/// `QueryInterface` on a borrowed object; the returned reference is owned.
///
/// # Safety
/// `object` must be a live vtable-based object.
pub unsafe fn query_interface(object: *mut c_void, iid: &Guid) -> Result<ComRef, HRESULT> {
    let mut out: *mut c_void = core::ptr::null_mut();
    let hr = unsafe {
        let qi: QueryInterfaceFn = method(object, QUERY_INTERFACE);
        qi(object, iid, &mut out)
    };
    if !succeeded(hr) {
        return Err(hr);
    }
    unsafe { ComRef::from_raw(out) }.ok_or(E_POINTER)
}

impl Clone for ComRef {
    fn clone(&self) -> Self {
        unsafe {
            let add_ref: AddRefFn = method(self.as_raw(), ADD_REF);
            add_ref(self.as_raw());
        }
        Self(self.0)
    }
}

impl Drop for ComRef {
    fn drop(&mut self) {
        unsafe {
            let release: ReleaseFn = method(self.as_raw(), RELEASE);
            release(self.as_raw());
        }
    }
}
