//! Raw interpreter-side types.
//!
//! Opaque object and thread-state types, the C signatures of the type slots
//! the bridge fills in, and the type-flag bits it reads and writes.

use libc::{c_int, c_void};

/// Opaque native object header.
#[repr(C)]
pub struct PyObject {
    _private: [u8; 0],
}

/// Opaque native thread state.
#[repr(C)]
pub struct PyThreadState {
    _private: [u8; 0],
}

pub type DestructorFn = unsafe extern "C" fn(*mut PyObject);
pub type UnaryFn = unsafe extern "C" fn(*mut PyObject) -> *mut PyObject;
pub type BinaryFn = unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject;
pub type TernaryFn =
    unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> *mut PyObject;
pub type InquiryFn = unsafe extern "C" fn(*mut PyObject) -> c_int;
pub type LenFn = unsafe extern "C" fn(*mut PyObject) -> isize;
pub type HashFn = unsafe extern "C" fn(*mut PyObject) -> isize;
pub type RichCompareFn = unsafe extern "C" fn(*mut PyObject, *mut PyObject, c_int) -> *mut PyObject;
pub type ObjObjFn = unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> c_int;
pub type ObjObjArgFn = unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> c_int;
pub type VisitFn = unsafe extern "C" fn(*mut PyObject, *mut c_void) -> c_int;
pub type TraverseFn = unsafe extern "C" fn(*mut PyObject, VisitFn, *mut c_void) -> c_int;

/// `tp_flags` bits.
pub mod type_flags {
    pub const HEAP_TYPE: usize = 1 << 9;
    pub const BASE_TYPE: usize = 1 << 10;
    pub const READY: usize = 1 << 12;
    pub const READYING: usize = 1 << 13;
    pub const HAVE_GC: usize = 1 << 14;
    /// Instances carry a trailing managed-instance slot
    pub const HAS_MANAGED_INSTANCE: usize = 1 << 15;
    pub const SUBCLASS: usize = 1 << 16;
}

/// Read one word at `base + offset`.
///
/// # Safety
///
/// `base + offset` must lie inside a live, word-aligned allocation.
#[inline]
pub unsafe fn read_word(base: *mut PyObject, offset: usize) -> usize {
    base.cast::<u8>().add(offset).cast::<usize>().read()
}

/// Write one word at `base + offset`.
///
/// # Safety
///
/// `base + offset` must lie inside a live, word-aligned allocation the caller
/// is allowed to mutate.
#[inline]
pub unsafe fn write_word(base: *mut PyObject, offset: usize, value: usize) {
    base.cast::<u8>().add(offset).cast::<usize>().write(value)
}
