//! Object memory and payloads of the simulated interpreter.
//!
//! Every object is a real zeroed allocation laid out per the resolved offset
//! table: refcount and type pointer live in the header words, heap type
//! objects are `heap_type_size` bytes, and instances are `tp_basicsize`
//! bytes. Values that a real interpreter keeps in the object body (integers,
//! strings, tuple items) are kept in a side table keyed by address.

use std::alloc::{self, Layout};
use std::fmt;
use std::sync::Arc;

use pyclr_native::{BorrowedRef, NativeResult, OwnedRef};

use crate::interp::SimInterpreter;

/// Native function callable from the bridge through `object_call`
pub type SimFunction =
    Arc<dyn Fn(&SimInterpreter, &[BorrowedRef<'_>]) -> NativeResult<OwnedRef> + Send + Sync>;

/// Refcount of immortal objects; never decremented.
pub const IMMORTAL: usize = 1 << 30;

#[derive(Clone)]
pub enum Payload {
    /// Instance of a heap type, or a plain `object()`
    Plain,
    Type { name: String },
    None,
    NotImplemented,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Item addresses; each non-zero item owns one reference
    Tuple(Vec<usize>),
    /// Key and value addresses in insertion order; each owns one reference
    Dict(Vec<(usize, usize)>),
    Capsule(usize),
    /// Attribute addresses; each owns one reference
    Module {
        name: String,
        attrs: indexmap::IndexMap<String, usize>,
    },
    Function { name: String, body: SimFunction },
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Plain => write!(f, "Plain"),
            Payload::Type { name } => write!(f, "Type({name})"),
            Payload::None => write!(f, "None"),
            Payload::NotImplemented => write!(f, "NotImplemented"),
            Payload::Bool(value) => write!(f, "Bool({value})"),
            Payload::Int(value) => write!(f, "Int({value})"),
            Payload::Float(value) => write!(f, "Float({value})"),
            Payload::Str(value) => write!(f, "Str({value:?})"),
            Payload::Tuple(items) => write!(f, "Tuple({})", items.len()),
            Payload::Dict(entries) => write!(f, "Dict({})", entries.len()),
            Payload::Capsule(pointer) => write!(f, "Capsule({pointer:#x})"),
            Payload::Module { name, .. } => write!(f, "Module({name})"),
            Payload::Function { name, .. } => write!(f, "Function({name})"),
        }
    }
}

/// Bookkeeping for one live allocation.
#[derive(Debug)]
pub struct SimObject {
    pub layout: Layout,
    pub payload: Payload,
    pub immortal: bool,
}

/// Allocate `size` zeroed, word-aligned bytes.
pub(crate) fn allocate(size: usize) -> Option<(usize, Layout)> {
    let layout = Layout::from_size_align(size.max(std::mem::size_of::<usize>()), std::mem::align_of::<usize>()).ok()?;
    // SAFETY: the layout has a non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        None
    } else {
        Some((ptr as usize, layout))
    }
}

/// # Safety
///
/// `address` must come from [`allocate`] with this `layout` and not be freed yet.
pub(crate) unsafe fn release(address: usize, layout: Layout) {
    alloc::dealloc(address as *mut u8, layout)
}

/// Addresses of the built-in types and singletons.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builtins {
    pub type_type: usize,
    pub object_type: usize,
    pub none_type: usize,
    pub not_implemented_type: usize,
    pub bool_type: usize,
    pub int_type: usize,
    pub float_type: usize,
    pub str_type: usize,
    pub tuple_type: usize,
    pub dict_type: usize,
    pub capsule_type: usize,
    pub module_type: usize,
    pub function_type: usize,
    pub none: usize,
    pub not_implemented: usize,
    pub true_: usize,
    pub false_: usize,
}
