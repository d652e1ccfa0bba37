//! Reference Ownership Model
//!
//! Native references carry lifetime contracts that the interpreter does not
//! check. This module encodes them as move-only wrapper types:
//!
//! - [`BorrowedRef`]: no reference owed; tied to the lifetime of the producer
//! - [`OwnedRef`]: exactly one reference owed; released exactly once
//! - [`StolenRef`]: a reference already handed to a consuming API
//! - [`NativeObject`]: an owned reference whose release is delegated to a
//!   finalizable managed wrapper
//!
//! Reading the address of an empty owned or stolen handle is a contract
//! violation and panics.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::api;
use crate::error::{NativeError, NativeResult};
use crate::ffi::PyObject;
use crate::finalizer;

#[cold]
#[track_caller]
fn contract_violation(what: &str) -> ! {
    panic!("native handle contract violation: {what}")
}

// ============================================================================
// Borrowed
// ============================================================================

/// A handle that owes no reference.
///
/// Never released and never stolen. The lifetime parameter keeps it from
/// outliving the operation that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BorrowedRef<'a> {
    ptr: NonNull<PyObject>,
    _lifetime: PhantomData<&'a PyObject>,
}

impl<'a> BorrowedRef<'a> {
    /// Borrow a non-null address.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live native object for `'a`.
    pub unsafe fn from_ptr(ptr: *mut PyObject) -> NativeResult<Self> {
        Self::from_nullable(ptr).ok_or_else(|| NativeError::null_handle("borrow"))
    }

    /// Borrow an address that may be null.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to a live native object for `'a`.
    pub unsafe fn from_nullable(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            _lifetime: PhantomData,
        })
    }

    pub fn as_ptr(self) -> *mut PyObject {
        self.ptr.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Take a new reference to the same object.
    ///
    /// Panics when no interpreter is installed; a borrowed handle cannot
    /// exist without one.
    pub fn to_owned(self) -> OwnedRef {
        match api::try_get() {
            Some(native) => {
                native.incref(self);
                OwnedRef {
                    ptr: Some(self.ptr),
                }
            }
            None => contract_violation("new reference without an installed interpreter"),
        }
    }
}

impl fmt::Debug for BorrowedRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Borrowed({:p})", self.ptr)
    }
}

// ============================================================================
// Owned
// ============================================================================

/// A handle owing exactly one reference.
///
/// Move-only. The reference is released by [`OwnedRef::dispose`] or on drop,
/// whichever comes first; later disposes are no-ops. Releasing without the
/// interpreter lock defers the decrement to the pending-release queue.
#[must_use = "an owned reference must be disposed, stolen or moved"]
pub struct OwnedRef {
    ptr: Option<NonNull<PyObject>>,
}

impl OwnedRef {
    /// Adopt a new reference.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must be a live object whose reference the caller owns.
    pub unsafe fn from_raw(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr: Some(ptr) })
    }

    /// Adopt a new reference, turning null into the pending native error.
    ///
    /// # Safety
    ///
    /// Same as [`OwnedRef::from_raw`].
    pub unsafe fn from_raw_or_err(ptr: *mut PyObject, native: &dyn api::NativeApi) -> NativeResult<Self> {
        match Self::from_raw(ptr) {
            Some(owned) => Ok(owned),
            None => Err(native.take_error("new reference")),
        }
    }

    /// Whether the reference was already released or moved out
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    #[track_caller]
    pub fn as_ptr(&self) -> *mut PyObject {
        match self.ptr {
            Some(ptr) => ptr.as_ptr(),
            None => contract_violation("address of an empty owned handle"),
        }
    }

    #[track_caller]
    pub fn addr(&self) -> usize {
        self.as_ptr() as usize
    }

    #[track_caller]
    pub fn borrow(&self) -> BorrowedRef<'_> {
        match self.ptr {
            Some(ptr) => BorrowedRef {
                ptr,
                _lifetime: PhantomData,
            },
            None => contract_violation("borrow of an empty owned handle"),
        }
    }

    /// Release the reference once. Repeat calls do nothing.
    pub fn dispose(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            finalizer::release(ptr);
        }
    }

    /// Hand the reference to a consuming API.
    #[track_caller]
    pub fn steal(mut self) -> StolenRef {
        match self.ptr.take() {
            Some(ptr) => StolenRef { ptr: Some(ptr) },
            None => contract_violation("steal of an empty owned handle"),
        }
    }

    /// Move the reference out as a raw pointer the caller now owns.
    #[track_caller]
    pub fn into_raw(mut self) -> *mut PyObject {
        match self.ptr.take() {
            Some(ptr) => ptr.as_ptr(),
            None => contract_violation("raw transfer of an empty owned handle"),
        }
    }

    /// Delegate release to a finalizable wrapper.
    #[track_caller]
    pub fn into_managed(mut self) -> NativeObject {
        match self.ptr.take() {
            Some(ptr) => NativeObject { ptr: Some(ptr) },
            None => contract_violation("managed wrapper around an empty owned handle"),
        }
    }
}

impl Drop for OwnedRef {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for OwnedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(ptr) => write!(f, "Owned({:p})", ptr),
            None => write!(f, "Owned(<empty>)"),
        }
    }
}

// ============================================================================
// Stolen
// ============================================================================

/// Proof that a reference was handed to a consuming API.
///
/// Holds no reference of its own: whoever receives it takes over the
/// reference it represents.
#[must_use = "a stolen reference must be passed to the consuming API"]
pub struct StolenRef {
    ptr: Option<NonNull<PyObject>>,
}

impl StolenRef {
    pub(crate) fn from_non_null(ptr: NonNull<PyObject>) -> Self {
        Self { ptr: Some(ptr) }
    }

    /// A null stolen reference, for APIs that accept one.
    pub fn null() -> Self {
        Self { ptr: None }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    #[track_caller]
    pub fn as_ptr(&self) -> *mut PyObject {
        match self.ptr {
            Some(ptr) => ptr.as_ptr(),
            None => contract_violation("address of an empty stolen handle"),
        }
    }

    /// Take the reference over. Called by the consuming API.
    #[track_caller]
    pub fn into_raw(self) -> *mut PyObject {
        self.as_ptr()
    }

    pub fn into_raw_nullable(self) -> *mut PyObject {
        self.ptr
            .map(NonNull::as_ptr)
            .unwrap_or(std::ptr::null_mut())
    }
}

impl fmt::Debug for StolenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(ptr) => write!(f, "Stolen({:p})", ptr),
            None => write!(f, "Stolen(<null>)"),
        }
    }
}

// ============================================================================
// Managed wrapper
// ============================================================================

/// An owned native reference held by managed code.
///
/// Can cross threads. Dropping it without the interpreter lock queues the
/// release for the next collection under the lock.
pub struct NativeObject {
    ptr: Option<NonNull<PyObject>>,
}

// SAFETY: the wrapped address is only dereferenced by the interpreter under its
// lock, and releases without the lock go through the pending-release queue.
unsafe impl Send for NativeObject {}
unsafe impl Sync for NativeObject {}

impl NativeObject {
    pub fn is_disposed(&self) -> bool {
        self.ptr.is_none()
    }

    #[track_caller]
    pub fn borrow(&self) -> BorrowedRef<'_> {
        match self.ptr {
            Some(ptr) => BorrowedRef {
                ptr,
                _lifetime: PhantomData,
            },
            None => contract_violation("borrow of a disposed native object"),
        }
    }

    #[track_caller]
    pub fn addr(&self) -> usize {
        self.borrow().addr()
    }

    /// A new owned reference to the wrapped object. Requires the lock.
    pub fn to_owned(&self) -> OwnedRef {
        crate::gil::assert_held("NativeObject::to_owned");
        self.borrow().to_owned()
    }

    /// Release now instead of on drop.
    pub fn dispose(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            finalizer::release(ptr);
        }
    }

    /// Take the reference back as an owned handle.
    pub fn into_owned(mut self) -> OwnedRef {
        OwnedRef {
            ptr: self.ptr.take(),
        }
    }
}

impl Drop for NativeObject {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(ptr) => write!(f, "NativeObject({:p})", ptr),
            None => write!(f, "NativeObject(<disposed>)"),
        }
    }
}
