//! The injected native call surface.
//!
//! Every interpreter entry point the bridge needs is a method on [`NativeApi`].
//! The bridge consumes this table and never implements it: production hosts
//! bind it to the interpreter library, tests bind it to a simulated one.
//!
//! One implementation is installed process-wide with [`install`]. The native
//! interpreter outlives managed attach/detach cycles, so installation is
//! independent of the bridge engine lifecycle.

use std::ptr::NonNull;
use std::sync::Arc;

use libc::{c_int, c_void};
use parking_lot::{const_rwlock, RwLock};
use tracing::info;

use crate::error::{ExceptionKind, NativeError, NativeException, NativeResult};
use crate::ffi::PyObject;
use crate::finalizer::Finalizer;
use crate::handle::{BorrowedRef, OwnedRef, StolenRef};

/// Result of a lock acquisition, handed back on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GilToken {
    /// The calling thread already held the lock
    Locked,
    /// The lock was taken by this acquisition
    Unlocked,
}

/// Saved thread state while the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStateToken(pub usize);

impl ThreadStateToken {
    pub fn as_ptr(self) -> *mut crate::ffi::PyThreadState {
        self.0 as *mut crate::ffi::PyThreadState
    }
}

/// Built-in object classes the bridge converts directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    Dict,
    Type,
    Capsule,
    Module,
    NotImplemented,
}

/// Rich comparison operators in native order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn to_raw(self) -> c_int {
        match self {
            CompareOp::Lt => 0,
            CompareOp::Le => 1,
            CompareOp::Eq => 2,
            CompareOp::Ne => 3,
            CompareOp::Gt => 4,
            CompareOp::Ge => 5,
        }
    }

    pub fn from_raw(op: c_int) -> Option<Self> {
        Some(match op {
            0 => CompareOp::Lt,
            1 => CompareOp::Le,
            2 => CompareOp::Eq,
            3 => CompareOp::Ne,
            4 => CompareOp::Gt,
            5 => CompareOp::Ge,
            _ => return None,
        })
    }

    /// The operator to try on the right operand
    pub fn swapped(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }

    /// Apply to an ordering result
    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

/// Binary numeric operators with their number-protocol slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberOp {
    Add,
    Subtract,
    Multiply,
    TrueDivide,
    FloorDivide,
    Remainder,
    And,
    Or,
    Xor,
    LeftShift,
    RightShift,
}

impl NumberOp {
    pub const ALL: [NumberOp; 11] = [
        NumberOp::Add,
        NumberOp::Subtract,
        NumberOp::Multiply,
        NumberOp::TrueDivide,
        NumberOp::FloorDivide,
        NumberOp::Remainder,
        NumberOp::And,
        NumberOp::Or,
        NumberOp::Xor,
        NumberOp::LeftShift,
        NumberOp::RightShift,
    ];

    /// Slot name in the number-methods table
    pub fn slot_name(self) -> &'static str {
        match self {
            NumberOp::Add => "nb_add",
            NumberOp::Subtract => "nb_subtract",
            NumberOp::Multiply => "nb_multiply",
            NumberOp::TrueDivide => "nb_true_divide",
            NumberOp::FloorDivide => "nb_floor_divide",
            NumberOp::Remainder => "nb_remainder",
            NumberOp::And => "nb_and",
            NumberOp::Or => "nb_or",
            NumberOp::Xor => "nb_xor",
            NumberOp::LeftShift => "nb_lshift",
            NumberOp::RightShift => "nb_rshift",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            NumberOp::Add => "+",
            NumberOp::Subtract => "-",
            NumberOp::Multiply => "*",
            NumberOp::TrueDivide => "/",
            NumberOp::FloorDivide => "//",
            NumberOp::Remainder => "%",
            NumberOp::And => "&",
            NumberOp::Or => "|",
            NumberOp::Xor => "^",
            NumberOp::LeftShift => "<<",
            NumberOp::RightShift => ">>",
        }
    }
}

/// Flat table of native interpreter operations.
///
/// Methods returning [`NativeResult`] report the pending native exception as
/// [`NativeError::Exception`] and leave no error indicator set.
pub trait NativeApi: Send + Sync {
    // ---- interpreter identity ----

    /// Full version string, as `Py_GetVersion` reports it
    fn version(&self) -> String;

    /// Build flags, as `sys.abiflags` reports them
    fn abi_flags(&self) -> String;

    // ---- object lifetime ----

    fn incref(&self, ob: BorrowedRef<'_>);

    /// Consumes one reference; may run the object's deallocation slot.
    fn decref(&self, ob: StolenRef);

    fn refcount(&self, ob: BorrowedRef<'_>) -> isize;

    // ---- type objects ----

    fn type_of<'a>(&self, ob: BorrowedRef<'a>) -> BorrowedRef<'a>;

    fn type_name(&self, ty: BorrowedRef<'_>) -> String;

    /// Allocate a zeroed heap type object with the given instance size
    fn alloc_type(&self, name: &str, basicsize: usize) -> NativeResult<OwnedRef>;

    fn type_ready(&self, ty: BorrowedRef<'_>) -> NativeResult<()>;

    /// Allocate a zeroed instance of `ty` with one reference
    fn generic_alloc(&self, ty: BorrowedRef<'_>) -> NativeResult<OwnedRef>;

    /// Release the memory of an object being deallocated.
    ///
    /// # Safety
    ///
    /// `ob` must be an object whose refcount reached zero, called from its
    /// deallocation slot, and never used afterwards.
    unsafe fn object_free(&self, ob: *mut PyObject);

    fn builtin_kind(&self, ob: BorrowedRef<'_>) -> Option<BuiltinKind>;

    // ---- singletons and scalars ----

    fn none(&self) -> BorrowedRef<'_>;

    fn not_implemented(&self) -> BorrowedRef<'_>;

    fn bool_from(&self, value: bool) -> OwnedRef;

    fn long_from_i64(&self, value: i64) -> NativeResult<OwnedRef>;

    fn long_as_i64(&self, ob: BorrowedRef<'_>) -> NativeResult<i64>;

    fn float_from_f64(&self, value: f64) -> NativeResult<OwnedRef>;

    fn float_as_f64(&self, ob: BorrowedRef<'_>) -> NativeResult<f64>;

    fn unicode_from_str(&self, value: &str) -> NativeResult<OwnedRef>;

    fn unicode_as_string(&self, ob: BorrowedRef<'_>) -> NativeResult<String>;

    fn is_true(&self, ob: BorrowedRef<'_>) -> NativeResult<bool>;

    // ---- tuples ----

    fn tuple_new(&self, len: usize) -> NativeResult<OwnedRef>;

    fn tuple_size(&self, tuple: BorrowedRef<'_>) -> NativeResult<usize>;

    fn tuple_get_item<'a>(&self, tuple: BorrowedRef<'a>, index: usize) -> NativeResult<BorrowedRef<'a>>;

    /// Stores `item` without a new reference
    fn tuple_set_item(&self, tuple: BorrowedRef<'_>, index: usize, item: StolenRef) -> NativeResult<()>;

    // ---- dicts ----

    fn dict_new(&self) -> NativeResult<OwnedRef>;

    /// Store `value` under a string key; the dict takes its own reference
    fn dict_set_item(&self, dict: BorrowedRef<'_>, key: &str, value: BorrowedRef<'_>) -> NativeResult<()>;

    /// The entry at `*position`, advancing it; `None` past the end
    fn dict_next<'a>(
        &self,
        dict: BorrowedRef<'a>,
        position: &mut usize,
    ) -> NativeResult<Option<(BorrowedRef<'a>, BorrowedRef<'a>)>>;

    // ---- abstract object protocol ----

    fn object_repr(&self, ob: BorrowedRef<'_>) -> NativeResult<OwnedRef>;

    fn object_str(&self, ob: BorrowedRef<'_>) -> NativeResult<OwnedRef>;

    fn object_hash(&self, ob: BorrowedRef<'_>) -> NativeResult<isize>;

    fn object_get_attr(&self, ob: BorrowedRef<'_>, name: &str) -> NativeResult<OwnedRef>;

    /// `None` deletes the attribute
    fn object_set_attr(&self, ob: BorrowedRef<'_>, name: &str, value: Option<BorrowedRef<'_>>) -> NativeResult<()>;

    fn object_call(&self, callable: BorrowedRef<'_>, args: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        self.object_call_kw(callable, args, None)
    }

    /// Call with keyword arguments; `kwargs` is a dict
    fn object_call_kw(
        &self,
        callable: BorrowedRef<'_>,
        args: BorrowedRef<'_>,
        kwargs: Option<BorrowedRef<'_>>,
    ) -> NativeResult<OwnedRef>;

    fn object_rich_compare(
        &self,
        left: BorrowedRef<'_>,
        right: BorrowedRef<'_>,
        op: CompareOp,
    ) -> NativeResult<OwnedRef>;

    fn object_get_item(&self, ob: BorrowedRef<'_>, key: BorrowedRef<'_>) -> NativeResult<OwnedRef>;

    /// `None` deletes the item
    fn object_set_item(
        &self,
        ob: BorrowedRef<'_>,
        key: BorrowedRef<'_>,
        value: Option<BorrowedRef<'_>>,
    ) -> NativeResult<()>;

    fn object_length(&self, ob: BorrowedRef<'_>) -> NativeResult<usize>;

    fn sequence_contains(&self, ob: BorrowedRef<'_>, item: BorrowedRef<'_>) -> NativeResult<bool>;

    fn object_get_iter(&self, ob: BorrowedRef<'_>) -> NativeResult<OwnedRef>;

    /// `Ok(None)` when the iterator is exhausted
    fn iter_next(&self, iterator: BorrowedRef<'_>) -> NativeResult<Option<OwnedRef>>;

    fn number_binary(&self, op: NumberOp, left: BorrowedRef<'_>, right: BorrowedRef<'_>) -> NativeResult<OwnedRef>;

    // ---- import, sys, capsules, raw memory ----

    fn import_module(&self, name: &str) -> NativeResult<OwnedRef>;

    fn sys_get_object(&self, name: &str) -> Option<BorrowedRef<'_>>;

    /// `None` removes the attribute
    fn sys_set_object(&self, name: &str, value: Option<BorrowedRef<'_>>) -> NativeResult<()>;

    fn capsule_new(&self, pointer: NonNull<c_void>) -> NativeResult<OwnedRef>;

    fn capsule_get_pointer(&self, capsule: BorrowedRef<'_>) -> NativeResult<NonNull<c_void>>;

    fn mem_malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `block` must come from [`NativeApi::mem_malloc`] and not be freed yet.
    unsafe fn mem_free(&self, block: NonNull<u8>);

    // ---- error indicator ----

    fn err_set(&self, exception: &NativeException);

    fn err_occurred(&self) -> bool;

    /// Take and clear the pending exception
    fn err_fetch(&self) -> Option<NativeException>;

    fn err_clear(&self);

    // ---- threads ----

    fn gil_ensure(&self) -> GilToken;

    fn gil_release(&self, token: GilToken);

    /// Release the lock entirely for this thread
    fn save_thread(&self) -> ThreadStateToken;

    fn restore_thread(&self, state: ThreadStateToken);

    fn thread_id(&self) -> u64;

    /// Post an asynchronous exception; returns the number of threads affected
    fn set_async_exc(&self, thread_id: u64, kind: ExceptionKind) -> usize;

    /// Safe point: raise a pending asynchronous exception for this thread
    fn check_signals(&self) -> NativeResult<()>;

    // ---- provided ----

    /// The pending exception as an error, or a null-handle error naming
    /// `context` when the interpreter set none.
    fn take_error(&self, context: &str) -> NativeError {
        match self.err_fetch() {
            Some(exception) => NativeError::Exception(exception),
            None => NativeError::exception(
                ExceptionKind::SystemError,
                format!("{context} returned NULL without setting an error"),
            ),
        }
    }
}

// ============================================================================
// Process-wide installation
// ============================================================================

static INSTALLED: RwLock<Option<Arc<dyn NativeApi>>> = const_rwlock(None);

/// Install the native surface for this process.
///
/// Replacing an installed surface starts a new interpreter run: releases still
/// queued for the previous one are discarded.
pub fn install(native: Arc<dyn NativeApi>) {
    let version = native.version();
    let previous = INSTALLED.write().replace(native);
    let run = Finalizer::global().begin_run();
    info!(version = %version, run, replaced = previous.is_some(), "native interpreter installed");
}

/// Remove the installed surface.
pub fn uninstall() -> Option<Arc<dyn NativeApi>> {
    INSTALLED.write().take()
}

pub fn get() -> NativeResult<Arc<dyn NativeApi>> {
    try_get().ok_or(NativeError::NotInstalled)
}

pub fn try_get() -> Option<Arc<dyn NativeApi>> {
    INSTALLED.read().clone()
}

pub fn is_installed() -> bool {
    INSTALLED.read().is_some()
}

/// Whether `native` is the installed surface.
pub fn is_current(native: &Arc<dyn NativeApi>) -> bool {
    INSTALLED
        .read()
        .as_ref()
        .map_or(false, |current| Arc::as_ptr(current) as *const () == Arc::as_ptr(native) as *const ())
}
