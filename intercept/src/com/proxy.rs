//! Synthetic objects that stand in for a real vtable-based object.
//!
//! [`ComProxy::wrap`] snapshots the real object's dispatch table and returns a
//! [`ProxyBuilder`]. Overrides go in through the builder; [`ProxyBuilder::seal`]
//! publishes the synthetic pointer, after which the tables never change.
//!
//! Callers see a table whose overridden entries point straight at the
//! override (which receives the synthetic pointer as `this`) and whose other
//! entries point at the shared forwarding stubs from [`crate::com::thunk`].
//! The stubs swap in the real object and jump through the slot table, so an
//! un-overridden method behaves exactly as if it had been called on the real
//! object. `Release` is always intercepted so the record dies with the object.

use core::ffi::c_void;
use core::mem::offset_of;

use log::trace;

use crate::com::thunk::{forwarder, MAX_FORWARDED_SLOTS};
use crate::com::unknown::{vtable, ComRef, ReleaseFn, RELEASE, UNKNOWN_SLOTS};
use crate::types::HookError;

#[cfg(target_pointer_width = "64")]
const PROXY_TAG: usize = 0x7072_6f78_7972_6563;
#[cfg(target_pointer_width = "32")]
const PROXY_TAG: usize = 0x7072_6f78;

/// The record behind a synthetic pointer.
///
/// The synthetic pointer handed to callers is the address of this record, so
/// its first field must be the caller-visible dispatch table.
#[repr(C)]
pub struct ComProxy {
    // The forwarding stubs read `real` and `slots_ptr` at fixed offsets.
    dispatch_ptr: *const *const c_void,
    real: *mut c_void,
    slots_ptr: *const *const c_void,
    tag: usize,
    snapshot: Box<[*const c_void]>,
    slots: Box<[*const c_void]>,
    dispatch: Box<[*const c_void]>,
}

pub(crate) const REAL_OFFSET: usize = offset_of!(ComProxy, real);
pub(crate) const SLOTS_OFFSET: usize = offset_of!(ComProxy, slots_ptr);

const _: () = assert!(offset_of!(ComProxy, dispatch_ptr) == 0);
const _: () = assert!(REAL_OFFSET < 0x80 && SLOTS_OFFSET < 0x80);

fn try_table(len: usize) -> Result<Vec<*const c_void>, HookError> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| HookError::AllocationFailed)?;
    Ok(table)
}

impl ComProxy {
    /// Wrap `real` behind a synthetic object presenting `table_size` slots.
    ///
    /// The reference owned by `real` moves into the proxy. If wrapping fails
    /// it is dropped here, which releases the object.
    pub fn wrap(real: ComRef, table_size: usize) -> Result<ProxyBuilder, HookError> {
        if table_size < UNKNOWN_SLOTS {
            return Err(HookError::TableTooSmall(table_size));
        }
        if table_size > MAX_FORWARDED_SLOTS {
            return Err(HookError::TableTooLarge(table_size));
        }

        let source = unsafe { core::slice::from_raw_parts(vtable(real.as_raw()), table_size) };

        let mut snapshot = try_table(table_size)?;
        snapshot.extend_from_slice(source);
        let mut slots = try_table(table_size)?;
        slots.extend_from_slice(source);
        let mut dispatch = try_table(table_size)?;
        for index in 0..table_size {
            if index == RELEASE {
                dispatch.push(proxy_release as *const c_void);
            } else {
                dispatch.push(forwarder(index)?);
            }
        }

        let mut proxy = Box::new(ComProxy {
            dispatch_ptr: core::ptr::null(),
            real: real.as_raw(),
            slots_ptr: core::ptr::null(),
            tag: PROXY_TAG,
            snapshot: snapshot.into_boxed_slice(),
            slots: slots.into_boxed_slice(),
            dispatch: dispatch.into_boxed_slice(),
        });
        proxy.dispatch_ptr = proxy.dispatch.as_ptr();
        proxy.slots_ptr = proxy.slots.as_ptr();

        trace!("wrapped {:p} with {} slots", proxy.real, table_size);
        Ok(ProxyBuilder { proxy, real })
    }

    /// Recover the record behind a pointer returned by [`ProxyBuilder::seal`].
    ///
    /// # Safety
    /// `object` must be null or a pointer previously returned by `seal` whose
    /// object is still alive. The tag check catches mistakes in debug runs; it
    /// does not make arbitrary pointers safe to pass.
    pub unsafe fn downcast<'a>(object: *mut c_void) -> Option<&'a ComProxy> {
        let proxy = unsafe { (object as *const ComProxy).as_ref() }?;
        (proxy.tag == PROXY_TAG && proxy.dispatch_ptr == proxy.dispatch.as_ptr()).then_some(proxy)
    }

    /// The wrapped object. Borrowed: the proxy owns the only reference it holds.
    pub fn real(&self) -> *mut c_void {
        self.real
    }

    pub fn table_size(&self) -> usize {
        self.slots.len()
    }

    /// The slot table: the snapshot with overrides applied.
    pub fn slots(&self) -> &[*const c_void] {
        &self.slots
    }

    /// The real object's table as it was at wrap time.
    pub fn snapshot(&self) -> &[*const c_void] {
        &self.snapshot
    }

    pub fn is_overridden(&self, index: usize) -> bool {
        index < self.slots.len() && self.slots[index] != self.snapshot[index]
    }
}

/// A proxy that has not been published yet.
///
/// Dropping it without calling [`seal`](ProxyBuilder::seal) frees the tables
/// and releases the real object.
pub struct ProxyBuilder {
    proxy: Box<ComProxy>,
    real: ComRef,
}

impl ProxyBuilder {
    pub fn table_size(&self) -> usize {
        self.proxy.table_size()
    }

    pub fn slots(&self) -> &[*const c_void] {
        self.proxy.slots()
    }

    /// Route slot `index` to `function`.
    ///
    /// `function` must be an `extern "system"` function with the signature of
    /// the method it replaces. It is called with the synthetic pointer as
    /// `this`; use [`ComProxy::downcast`] to reach the real object.
    pub fn set_slot(&mut self, index: usize, function: *const c_void) -> Result<(), HookError> {
        let size = self.table_size();
        if index >= size {
            return Err(HookError::SlotOutOfRange { index, size });
        }
        if index == RELEASE {
            return Err(HookError::ReservedSlot(index));
        }
        self.proxy.slots[index] = function;
        self.proxy.dispatch[index] = function;
        Ok(())
    }

    /// Publish the synthetic object. The returned pointer owns the reference
    /// that was passed to [`ComProxy::wrap`].
    pub fn seal(self) -> *mut c_void {
        let ProxyBuilder { proxy, real } = self;
        let _ = real.into_raw();
        Box::into_raw(proxy) as *mut c_void
    }
}

unsafe extern "system" fn proxy_release(this: *mut c_void) -> u32 {
    let Some(proxy) = (unsafe { ComProxy::downcast(this) }) else {
        return 0;
    };
    let real = proxy.real;
    let release: ReleaseFn = unsafe { core::mem::transmute(proxy.snapshot[RELEASE]) };

    let left = unsafe { release(real) };
    if left == 0 {
        trace!("last reference on {:p} released, dropping proxy {:p}", real, this);
        drop(unsafe { Box::from_raw(this as *mut ComProxy) });
    }
    left
}
