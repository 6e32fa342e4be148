//! Raw COM method table access.
//!
//! Every vtable read in the crate goes through [`read_slot`], which validates the slot
//! against the slot count of the interface it is read as. Slot tables of each api live in its
//! backend module.

use core::{
    ffi::c_void,
    fmt::{self, Debug, Formatter},
    mem,
    ptr::{self, NonNull},
};

use asdf_present_hook::FnPtr;

use crate::error::ProbeError;

/// COM interface layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub name: &'static str,
    /// Number of methods including inherited ones.
    pub slots: usize,
}

pub const IUNKNOWN: Interface = Interface {
    name: "IUnknown",
    slots: 3,
};

pub const QUERY_INTERFACE: usize = 0;
pub const ADD_REF: usize = 1;
pub const RELEASE: usize = 2;

pub type QueryInterfaceFn =
    unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32;
pub type AddRefFn = unsafe extern "system" fn(*mut c_void) -> u32;
pub type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;

/// Read slot `slot` of `object` viewed as `interface`.
///
/// # Safety
/// `object` must be null or point to a live COM object implementing `interface`.
pub unsafe fn read_slot(
    object: *mut c_void,
    interface: &Interface,
    slot: usize,
) -> Result<FnPtr, ProbeError> {
    if slot >= interface.slots {
        return Err(ProbeError::SlotOutOfRange {
            interface: interface.name,
            slots: interface.slots,
            slot,
        });
    }

    if object.is_null() {
        return Err(ProbeError::NullVtable(interface.name));
    }

    let vtable = unsafe { *object.cast::<*const *const c_void>() };
    if vtable.is_null() {
        return Err(ProbeError::NullVtable(interface.name));
    }

    FnPtr::new(unsafe { *vtable.add(slot) }).ok_or(ProbeError::NullVtable(interface.name))
}

/// Binary layout of a COM interface id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn from_u128(value: u128) -> Self {
        Self {
            data1: (value >> 96) as u32,
            data2: (value >> 80) as u16,
            data3: (value >> 64) as u16,
            data4: (value as u64).to_be_bytes(),
        }
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for byte in &self.data4[2..] {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

/// Owned reference to a COM object, released on drop.
pub struct ComObject(NonNull<c_void>);

impl ComObject {
    /// Take ownership of one reference of `raw`.
    ///
    /// # Safety
    /// `raw` must be null or a live COM object. Its reference is transferred to the returned
    /// value.
    #[inline]
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    #[inline]
    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Give up ownership without releasing.
    #[inline]
    pub fn into_raw(self) -> *mut c_void {
        let raw = self.0.as_ptr();
        mem::forget(self);
        raw
    }

    /// Query another interface of the object.
    pub fn query(&self, iid: &Guid) -> Option<ComObject> {
        unsafe { query_interface(self.as_raw(), iid) }
    }
}

impl Debug for ComObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComObject").field(&self.0).finish()
    }
}

impl Drop for ComObject {
    fn drop(&mut self) {
        unsafe { release(self.as_raw()) };
    }
}

// COM objects handed out by graphics apis are free threaded
unsafe impl Send for ComObject {}
unsafe impl Sync for ComObject {}

/// Call `IUnknown::QueryInterface` on a borrowed object.
///
/// # Safety
/// `object` must be null or a live COM object.
pub unsafe fn query_interface(object: *mut c_void, iid: &Guid) -> Option<ComObject> {
    let query = unsafe { read_slot(object, &IUNKNOWN, QUERY_INTERFACE) }.ok()?;
    let mut out = ptr::null_mut();
    let hr = unsafe { query.cast::<QueryInterfaceFn>()(object, iid, &mut out) };
    if hr < 0 {
        return None;
    }

    unsafe { ComObject::from_raw(out) }
}

/// Release one reference of `object`.
///
/// # Safety
/// `object` must be null or a live COM object the caller owns a reference of.
pub unsafe fn release(object: *mut c_void) {
    if let Ok(release) = unsafe { read_slot(object, &IUNKNOWN, RELEASE) } {
        unsafe { release.cast::<ReleaseFn>()(object) };
    }
}
