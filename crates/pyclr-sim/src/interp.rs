//! The simulated interpreter and its [`NativeApi`] implementation.
//!
//! Internal state sits behind one mutex that is never held while a type slot
//! runs: slots re-enter the interpreter (a bridge dealloc frees the object
//! and releases its type through this same surface).

use std::alloc::Layout;
use std::ffi::c_void;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::Arc;

use indexmap::IndexMap;
use libc::c_int;
use parking_lot::Mutex;
use pyclr_native::abi::{self, AbiRevision, PythonVersion, SlotLocation, TypeOffsets};
use pyclr_native::ffi::{
    read_word, type_flags, write_word, BinaryFn, DestructorFn, HashFn, LenFn, ObjObjArgFn, ObjObjFn,
    RichCompareFn, TernaryFn, TraverseFn, UnaryFn,
};
use pyclr_native::{
    BorrowedRef, BuiltinKind, CompareOp, ExceptionKind, GilToken, NativeApi, NativeError, NativeException,
    NativeResult, NumberOp, OwnedRef, PyObject, StolenRef, ThreadStateToken,
};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use tracing::{debug, trace, warn};

use crate::gil::{current_thread, SimGil};
use crate::object::{self, Builtins, Payload, SimFunction, SimObject, IMMORTAL};

/// Identity of the simulated build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Version banner, as `Py_GetVersion` reports it
    pub version: String,
    pub abi_flags: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            version: "3.11.4 (main, simulated) [rustc]".to_string(),
            abi_flags: String::new(),
        }
    }
}

impl SimConfig {
    pub fn new(version: impl Into<String>, abi_flags: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            abi_flags: abi_flags.into(),
        }
    }
}

#[derive(Default)]
struct SimState {
    objects: FxHashMap<usize, SimObject>,
    sys: IndexMap<String, usize>,
    modules: IndexMap<String, usize>,
    blocks: FxHashMap<usize, Layout>,
    error: Option<NativeException>,
    async_exc: FxHashMap<u64, ExceptionKind>,
    threads: FxHashSet<u64>,
}

fn exception<T>(kind: ExceptionKind, message: impl Into<String>) -> NativeResult<T> {
    Err(NativeError::exception(kind, message))
}

fn named_exception<T>(type_name: &str, message: impl Into<String>) -> NativeResult<T> {
    Err(NativeError::Exception(NativeException::named(type_name, message)))
}

fn compare_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Eq => "==",
        CompareOp::Ne => "!=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
    }
}

fn as_ptr(address: usize) -> *mut PyObject {
    address as *mut PyObject
}

/// An in-memory interpreter for driving the bridge in tests.
pub struct SimInterpreter {
    config: SimConfig,
    offsets: &'static TypeOffsets,
    state: Mutex<SimState>,
    gil: SimGil,
    builtins: Builtins,
}

impl SimInterpreter {
    pub fn new(config: SimConfig) -> NativeResult<Arc<Self>> {
        let version = PythonVersion::parse(&config.version)?;
        let revision = AbiRevision::from_version(version, &config.abi_flags);
        let offsets = abi::offsets_for(revision)?;
        let mut state = SimState::default();
        let builtins = bootstrap(offsets, &mut state)?;
        debug!(%revision, objects = state.objects.len(), "simulated interpreter created");
        Ok(Arc::new(Self {
            config,
            offsets,
            state: Mutex::new(state),
            gil: SimGil::default(),
            builtins,
        }))
    }

    pub fn with_defaults() -> NativeResult<Arc<Self>> {
        Self::new(SimConfig::default())
    }

    pub fn offsets(&self) -> &'static TypeOffsets {
        self.offsets
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn word(&self, address: usize, offset: usize) -> usize {
        // SAFETY: callers pass addresses of live allocations and offsets
        // inside them (header words, or type slots of type objects).
        unsafe { read_word(as_ptr(address), offset) }
    }

    fn set_word(&self, address: usize, offset: usize, value: usize) {
        // SAFETY: as in `word`.
        unsafe { write_word(as_ptr(address), offset, value) }
    }

    fn type_addr(&self, address: usize) -> usize {
        self.word(address, self.offsets.type_offset())
    }

    fn type_slot(&self, ty: usize, name: &str) -> usize {
        match self.offsets.locate(name) {
            Ok(SlotLocation::Direct(offset)) => self.word(ty, offset),
            Ok(SlotLocation::Indirect {
                table_offset,
                relative,
            }) => match self.word(ty, table_offset) {
                0 => 0,
                table => self.word(table, relative),
            },
            Err(_) => 0,
        }
    }

    fn type_word(&self, ty: usize, name: &str) -> NativeResult<usize> {
        Ok(self.word(ty, self.offsets.offset(name)?))
    }

    fn set_type_word(&self, ty: usize, name: &str, value: usize) -> NativeResult<()> {
        self.set_word(ty, self.offsets.offset(name)?, value);
        Ok(())
    }

    fn payload(&self, address: usize) -> Option<Payload> {
        self.state
            .lock()
            .objects
            .get(&address)
            .map(|object| object.payload.clone())
    }

    fn type_name_of(&self, address: usize) -> String {
        match self.payload(self.type_addr(address)) {
            Some(Payload::Type { name }) => name,
            _ => "<unknown>".to_string(),
        }
    }

    /// Allocate an object of `ty` with one reference; takes a reference to `ty`.
    fn alloc_object(&self, ty: usize, size: usize, payload: Payload) -> NativeResult<usize> {
        let address = {
            let mut state = self.state.lock();
            raw_object(self.offsets, &mut state, ty, size, payload, false)?
        };
        self.incref_addr(ty);
        Ok(address)
    }

    fn alloc_value(&self, ty: usize, payload: Payload) -> NativeResult<OwnedRef> {
        let address = self.alloc_object(ty, self.offsets.object_header_size(), payload)?;
        Ok(self.adopt(address))
    }

    /// Wrap an address whose reference the caller already owns.
    fn adopt(&self, address: usize) -> OwnedRef {
        // SAFETY: addresses handed out here come from live allocations.
        match unsafe { OwnedRef::from_raw(as_ptr(address)) } {
            Some(owned) => owned,
            None => panic!("simulated interpreter adopted a null object"),
        }
    }

    fn new_ref(&self, address: usize) -> OwnedRef {
        self.incref_addr(address);
        self.adopt(address)
    }

    fn borrowed(&self, address: usize) -> BorrowedRef<'_> {
        // SAFETY: builtin singletons and registered objects are live.
        match unsafe { BorrowedRef::from_nullable(as_ptr(address)) } {
            Some(borrowed) => borrowed,
            None => panic!("simulated interpreter borrowed a null object"),
        }
    }

    fn incref_addr(&self, address: usize) {
        let state = self.state.lock();
        match state.objects.get(&address) {
            Some(object) if object.immortal => {}
            Some(_) => {
                let count = self.word(address, self.offsets.refcount_offset());
                self.set_word(address, self.offsets.refcount_offset(), count + 1);
            }
            None => warn!(address, "incref of an unknown object"),
        }
    }

    fn decref_addr(&self, address: usize) {
        let dead = {
            let state = self.state.lock();
            match state.objects.get(&address) {
                Some(object) if object.immortal => return,
                Some(_) => {
                    let offset = self.offsets.refcount_offset();
                    let count = self.word(address, offset);
                    if count == 0 {
                        warn!(address, "decref below zero");
                        return;
                    }
                    self.set_word(address, offset, count - 1);
                    count == 1
                }
                None => {
                    warn!(address, "decref of an unknown object");
                    return;
                }
            }
        };
        if dead {
            self.dealloc(address);
        }
    }

    fn dealloc(&self, address: usize) {
        let ty = self.type_addr(address);
        let destructor = self.type_slot(ty, "tp_dealloc");
        if destructor != 0 {
            trace!(address, "running tp_dealloc");
            // SAFETY: a non-zero tp_dealloc is a destructor installed into the type.
            let destructor: DestructorFn = unsafe { std::mem::transmute(destructor) };
            unsafe { destructor(as_ptr(address)) };
            return;
        }
        let Some(object) = self.state.lock().objects.remove(&address) else {
            return;
        };
        let mut children = match &object.payload {
            Payload::Tuple(items) => items.iter().copied().filter(|item| *item != 0).collect(),
            Payload::Dict(entries) => entries.iter().flat_map(|(key, value)| [*key, *value]).collect(),
            Payload::Module { attrs, .. } => attrs.values().copied().collect(),
            _ => Vec::new(),
        };
        if matches!(object.payload, Payload::Type { .. }) {
            if let Ok(base) = self.type_word(address, "tp_base") {
                if base != 0 {
                    children.push(base);
                }
            }
        }
        // SAFETY: the entry was removed, so nothing refers to the memory.
        unsafe { object::release(address, object.layout) };
        for child in children {
            self.decref_addr(child);
        }
        self.decref_addr(ty);
    }

    /// Turn a slot's object result into a reference, fetching the pending
    /// error on null.
    fn slot_result(&self, result: *mut PyObject, context: &str) -> NativeResult<OwnedRef> {
        if result.is_null() {
            Err(self.take_error(context))
        } else {
            Ok(self.adopt(result as usize))
        }
    }

    fn status(&self, status: c_int, context: &str) -> NativeResult<()> {
        if status < 0 {
            Err(self.take_error(context))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Test helpers
    // ========================================================================

    /// Objects that are not immortal builtins
    pub fn live_objects(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|object| !object.immortal)
            .count()
    }

    pub fn is_live(&self, address: usize) -> bool {
        self.state.lock().objects.contains_key(&address)
    }

    /// Raw memory blocks not yet freed
    pub fn outstanding_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn gil_acquisitions(&self) -> u64 {
        self.gil.acquisitions()
    }

    pub fn holds_gil(&self) -> bool {
        self.gil.is_held_by_current()
    }

    /// Objects reported by the type's traversal slot.
    pub fn gc_referents(&self, ob: BorrowedRef<'_>) -> Vec<usize> {
        unsafe extern "C" fn collect(referent: *mut PyObject, arg: *mut c_void) -> c_int {
            // SAFETY: `arg` is the vector passed below for this traversal.
            let referents = unsafe { &mut *arg.cast::<Vec<usize>>() };
            referents.push(referent as usize);
            0
        }
        let traverse = self.type_slot(self.type_addr(ob.addr()), "tp_traverse");
        let mut referents: Vec<usize> = Vec::new();
        if traverse != 0 {
            // SAFETY: a non-zero tp_traverse is a traversal installed into the type.
            let traverse: TraverseFn = unsafe { std::mem::transmute(traverse) };
            unsafe {
                traverse(
                    ob.as_ptr(),
                    collect,
                    (&mut referents as *mut Vec<usize>).cast::<c_void>(),
                )
            };
        }
        referents
    }

    /// Register an importable module owning `attrs`.
    pub fn define_module(&self, name: &str, attrs: Vec<(String, OwnedRef)>) -> NativeResult<()> {
        let attrs: IndexMap<String, usize> = attrs
            .into_iter()
            .map(|(attr, value)| (attr, value.into_raw() as usize))
            .collect();
        let module = self.alloc_object(
            self.builtins.module_type,
            self.offsets.object_header_size(),
            Payload::Module {
                name: name.to_string(),
                attrs,
            },
        )?;
        let previous = self.state.lock().modules.insert(name.to_string(), module);
        if let Some(previous) = previous {
            self.decref_addr(previous);
        }
        Ok(())
    }

    /// A native callable running `body`.
    pub fn define_function(&self, name: &str, body: SimFunction) -> NativeResult<OwnedRef> {
        self.alloc_value(
            self.builtins.function_type,
            Payload::Function {
                name: name.to_string(),
                body,
            },
        )
    }

    /// A native subclass of `base`; fails when `base` is not subclassable.
    pub fn subclass(&self, base: BorrowedRef<'_>, name: &str) -> NativeResult<OwnedRef> {
        let basicsize = self.type_word(base.addr(), "tp_basicsize")?;
        let ty = self.alloc_type(name, basicsize)?;
        self.incref_addr(base.addr());
        self.set_type_word(ty.addr(), "tp_base", base.addr())?;
        self.type_ready(ty.borrow())?;
        Ok(ty)
    }
}

/// Allocate a raw object of `ty` without touching `ty`'s refcount.
fn raw_object(
    offsets: &TypeOffsets,
    state: &mut SimState,
    ty: usize,
    size: usize,
    payload: Payload,
    immortal: bool,
) -> NativeResult<usize> {
    let (address, layout) = object::allocate(size.max(offsets.object_header_size()))
        .ok_or_else(|| NativeError::allocation_failed(format!("{size}-byte object")))?;
    // SAFETY: the allocation spans at least the object header.
    unsafe {
        write_word(as_ptr(address), offsets.refcount_offset(), if immortal { IMMORTAL } else { 1 });
        write_word(as_ptr(address), offsets.type_offset(), ty);
    }
    state.objects.insert(
        address,
        SimObject {
            layout,
            payload,
            immortal,
        },
    );
    Ok(address)
}

fn builtin_type(offsets: &TypeOffsets, state: &mut SimState, meta: usize, name: &str) -> NativeResult<usize> {
    let ty = raw_object(
        offsets,
        state,
        meta,
        offsets.heap_type_size(),
        Payload::Type { name: name.to_string() },
        true,
    )?;
    // SAFETY: type objects are heap_type_size bytes.
    unsafe {
        write_word(as_ptr(ty), offsets.offset("tp_basicsize")?, offsets.object_header_size());
        write_word(
            as_ptr(ty),
            offsets.offset("tp_flags")?,
            type_flags::READY | type_flags::BASE_TYPE,
        );
    }
    Ok(ty)
}

fn bootstrap(offsets: &TypeOffsets, state: &mut SimState) -> NativeResult<Builtins> {
    let type_type = builtin_type(offsets, state, 0, "type")?;
    // SAFETY: `type` is its own type.
    unsafe { write_word(as_ptr(type_type), offsets.type_offset(), type_type) };
    let mut builtins = Builtins {
        type_type,
        ..Builtins::default()
    };
    builtins.object_type = builtin_type(offsets, state, type_type, "object")?;
    builtins.none_type = builtin_type(offsets, state, type_type, "NoneType")?;
    builtins.not_implemented_type = builtin_type(offsets, state, type_type, "NotImplementedType")?;
    builtins.bool_type = builtin_type(offsets, state, type_type, "bool")?;
    builtins.int_type = builtin_type(offsets, state, type_type, "int")?;
    builtins.float_type = builtin_type(offsets, state, type_type, "float")?;
    builtins.str_type = builtin_type(offsets, state, type_type, "str")?;
    builtins.tuple_type = builtin_type(offsets, state, type_type, "tuple")?;
    builtins.dict_type = builtin_type(offsets, state, type_type, "dict")?;
    builtins.capsule_type = builtin_type(offsets, state, type_type, "PyCapsule")?;
    builtins.module_type = builtin_type(offsets, state, type_type, "module")?;
    builtins.function_type = builtin_type(offsets, state, type_type, "builtin_function_or_method")?;

    let header = offsets.object_header_size();
    builtins.none = raw_object(offsets, state, builtins.none_type, header, Payload::None, true)?;
    builtins.not_implemented = raw_object(
        offsets,
        state,
        builtins.not_implemented_type,
        header,
        Payload::NotImplemented,
        true,
    )?;
    builtins.true_ = raw_object(offsets, state, builtins.bool_type, header, Payload::Bool(true), true)?;
    builtins.false_ = raw_object(offsets, state, builtins.bool_type, header, Payload::Bool(false), true)?;
    Ok(builtins)
}

impl Drop for SimInterpreter {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let objects = state.objects.len();
        for (address, object) in state.objects.drain() {
            // SAFETY: the interpreter owns every allocation it still tracks.
            unsafe { object::release(address, object.layout) };
        }
        for (address, layout) in state.blocks.drain() {
            // SAFETY: as above.
            unsafe { object::release(address, layout) };
        }
        debug!(objects, "simulated interpreter dropped");
    }
}

// ============================================================================
// Built-in behavior
// ============================================================================

impl SimInterpreter {
    fn builtin_repr(&self, address: usize) -> NativeResult<String> {
        Ok(match self.payload(address) {
            Some(Payload::None) => "None".to_string(),
            Some(Payload::NotImplemented) => "NotImplemented".to_string(),
            Some(Payload::Bool(true)) => "True".to_string(),
            Some(Payload::Bool(false)) => "False".to_string(),
            Some(Payload::Int(value)) => value.to_string(),
            Some(Payload::Float(value)) => format!("{value:?}"),
            Some(Payload::Str(value)) => format!("'{value}'"),
            Some(Payload::Tuple(items)) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    let repr = self.object_repr(self.borrowed(*item))?;
                    parts.push(self.unicode_as_string(repr.borrow())?);
                }
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Some(Payload::Dict(entries)) => {
                let mut parts = Vec::with_capacity(entries.len());
                for (key, value) in &entries {
                    let key = self.object_repr(self.borrowed(*key))?;
                    let value = self.object_repr(self.borrowed(*value))?;
                    parts.push(format!(
                        "{}: {}",
                        self.unicode_as_string(key.borrow())?,
                        self.unicode_as_string(value.borrow())?
                    ));
                }
                format!("{{{}}}", parts.join(", "))
            }
            Some(Payload::Type { name }) => format!("<class '{name}'>"),
            Some(Payload::Module { name, .. }) => format!("<module '{name}'>"),
            Some(Payload::Function { name, .. }) => format!("<built-in function {name}>"),
            Some(Payload::Capsule(_)) => format!("<capsule object at {address:#x}>"),
            Some(Payload::Plain) | None => {
                format!("<{} object at {address:#x}>", self.type_name_of(address))
            }
        })
    }

    fn number_value(&self, address: usize) -> Option<f64> {
        match self.payload(address)? {
            Payload::Int(value) => Some(value as f64),
            Payload::Float(value) => Some(value),
            Payload::Bool(value) => Some(if value { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn builtin_compare(&self, left: usize, right: usize, op: CompareOp) -> NativeResult<bool> {
        let ordering = match (self.payload(left), self.payload(right)) {
            (Some(Payload::Int(a)), Some(Payload::Int(b))) => Some(a.cmp(&b)),
            (Some(Payload::Str(a)), Some(Payload::Str(b))) => Some(a.cmp(&b)),
            _ => match (self.number_value(left), self.number_value(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        };
        match (ordering, op) {
            (Some(ordering), _) => Ok(op.matches(ordering)),
            (None, CompareOp::Eq) => Ok(left == right),
            (None, CompareOp::Ne) => Ok(left != right),
            (None, _) => exception(
                ExceptionKind::TypeError,
                format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    compare_symbol(op),
                    self.type_name_of(left),
                    self.type_name_of(right)
                ),
            ),
        }
    }

    fn builtin_number(&self, op: NumberOp, left: usize, right: usize) -> NativeResult<OwnedRef> {
        let unsupported = || {
            exception(
                ExceptionKind::TypeError,
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    self.type_name_of(left),
                    self.type_name_of(right)
                ),
            )
        };
        match (self.payload(left), self.payload(right)) {
            (Some(Payload::Int(a)), Some(Payload::Int(b))) => self.int_number(op, a, b),
            (Some(Payload::Str(a)), Some(Payload::Str(b))) if op == NumberOp::Add => {
                self.unicode_from_str(&format!("{a}{b}"))
            }
            _ => match (self.number_value(left), self.number_value(right)) {
                (Some(a), Some(b)) => {
                    let value = match op {
                        NumberOp::Add => a + b,
                        NumberOp::Subtract => a - b,
                        NumberOp::Multiply => a * b,
                        NumberOp::TrueDivide | NumberOp::FloorDivide | NumberOp::Remainder if b == 0.0 => {
                            return named_exception("ZeroDivisionError", "float division by zero")
                        }
                        NumberOp::TrueDivide => a / b,
                        NumberOp::FloorDivide => (a / b).floor(),
                        NumberOp::Remainder => a - b * (a / b).floor(),
                        _ => return unsupported(),
                    };
                    self.float_from_f64(value)
                }
                _ => unsupported(),
            },
        }
    }

    fn int_number(&self, op: NumberOp, a: i64, b: i64) -> NativeResult<OwnedRef> {
        let overflow = || named_exception::<OwnedRef>("OverflowError", "integer overflow");
        let value = match op {
            NumberOp::Add => a.checked_add(b),
            NumberOp::Subtract => a.checked_sub(b),
            NumberOp::Multiply => a.checked_mul(b),
            NumberOp::TrueDivide => {
                if b == 0 {
                    return named_exception("ZeroDivisionError", "division by zero");
                }
                return self.float_from_f64(a as f64 / b as f64);
            }
            NumberOp::FloorDivide | NumberOp::Remainder if b == 0 => {
                return named_exception("ZeroDivisionError", "integer division or modulo by zero");
            }
            NumberOp::FloorDivide => a.checked_div(b).map(|q| {
                if a % b != 0 && ((a < 0) != (b < 0)) {
                    q - 1
                } else {
                    q
                }
            }),
            NumberOp::Remainder => a.checked_rem(b).map(|r| {
                if r != 0 && ((r < 0) != (b < 0)) {
                    r + b
                } else {
                    r
                }
            }),
            NumberOp::And => Some(a & b),
            NumberOp::Or => Some(a | b),
            NumberOp::Xor => Some(a ^ b),
            NumberOp::LeftShift | NumberOp::RightShift if b < 0 => {
                return exception(ExceptionKind::ValueError, "negative shift count");
            }
            NumberOp::LeftShift => u32::try_from(b).ok().and_then(|shift| a.checked_shl(shift)),
            NumberOp::RightShift => Some(a >> b.min(63)),
        };
        match value {
            Some(value) => self.long_from_i64(value),
            None => overflow(),
        }
    }

    /// Call a binary slot on `ty`; `None` when the slot is empty or answered
    /// NotImplemented.
    fn try_binary(&self, ty: usize, slot: &str, left: usize, right: usize) -> NativeResult<Option<OwnedRef>> {
        let function = self.type_slot(ty, slot);
        if function == 0 {
            return Ok(None);
        }
        // SAFETY: a non-zero binary slot has the binary signature.
        let function: BinaryFn = unsafe { std::mem::transmute(function) };
        let result = unsafe { function(as_ptr(left), as_ptr(right)) };
        let result = self.slot_result(result, slot)?;
        if result.addr() == self.builtins.not_implemented {
            self.decref_addr(result.into_raw() as usize);
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn try_compare(&self, ty: usize, left: usize, right: usize, op: CompareOp) -> NativeResult<Option<OwnedRef>> {
        let function = self.type_slot(ty, "tp_richcompare");
        if function == 0 {
            return Ok(None);
        }
        // SAFETY: a non-zero tp_richcompare has the rich-compare signature.
        let function: RichCompareFn = unsafe { std::mem::transmute(function) };
        let result = unsafe { function(as_ptr(left), as_ptr(right), op.to_raw()) };
        let result = self.slot_result(result, "tp_richcompare")?;
        if result.addr() == self.builtins.not_implemented {
            self.decref_addr(result.into_raw() as usize);
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn dict_entries(&self, dict: usize) -> NativeResult<Vec<(usize, usize)>> {
        match self.payload(dict) {
            Some(Payload::Dict(entries)) => Ok(entries),
            _ => exception(
                ExceptionKind::TypeError,
                format!("expected dict, got '{}'", self.type_name_of(dict)),
            ),
        }
    }

    fn tuple_items(&self, tuple: usize) -> NativeResult<Vec<usize>> {
        match self.payload(tuple) {
            Some(Payload::Tuple(items)) => Ok(items),
            _ => exception(
                ExceptionKind::TypeError,
                format!("expected tuple, got '{}'", self.type_name_of(tuple)),
            ),
        }
    }
}

// ============================================================================
// NativeApi
// ============================================================================

impl NativeApi for SimInterpreter {
    fn version(&self) -> String {
        self.config.version.clone()
    }

    fn abi_flags(&self) -> String {
        self.config.abi_flags.clone()
    }

    fn incref(&self, ob: BorrowedRef<'_>) {
        self.incref_addr(ob.addr());
    }

    fn decref(&self, ob: StolenRef) {
        let address = ob.into_raw_nullable() as usize;
        if address != 0 {
            self.decref_addr(address);
        }
    }

    fn refcount(&self, ob: BorrowedRef<'_>) -> isize {
        self.word(ob.addr(), self.offsets.refcount_offset()) as isize
    }

    fn type_of<'a>(&self, ob: BorrowedRef<'a>) -> BorrowedRef<'a> {
        let ty = self.type_addr(ob.addr());
        // SAFETY: every live object's type outlives it.
        match unsafe { BorrowedRef::from_nullable(as_ptr(ty)) } {
            Some(ty) => ty,
            None => panic!("simulated object at {:#x} has no type", ob.addr()),
        }
    }

    fn type_name(&self, ty: BorrowedRef<'_>) -> String {
        match self.payload(ty.addr()) {
            Some(Payload::Type { name }) => name,
            _ => "<unknown>".to_string(),
        }
    }

    fn alloc_type(&self, name: &str, basicsize: usize) -> NativeResult<OwnedRef> {
        let ty = {
            let mut state = self.state.lock();
            raw_object(
                self.offsets,
                &mut state,
                self.builtins.type_type,
                self.offsets.heap_type_size(),
                Payload::Type { name: name.to_string() },
                false,
            )?
        };
        self.set_type_word(ty, "tp_basicsize", basicsize)?;
        self.set_type_word(ty, "tp_flags", type_flags::HEAP_TYPE)?;
        trace!(name, basicsize, "allocated heap type");
        Ok(self.adopt(ty))
    }

    fn type_ready(&self, ty: BorrowedRef<'_>) -> NativeResult<()> {
        let ty = ty.addr();
        let base = self.type_word(ty, "tp_base")?;
        if base != 0 && self.type_word(base, "tp_flags")? & type_flags::BASE_TYPE == 0 {
            return exception(
                ExceptionKind::TypeError,
                format!("type '{}' is not an acceptable base type", self.type_name(self.borrowed(base))),
            );
        }
        let flags = self.type_word(ty, "tp_flags")?;
        self.set_type_word(ty, "tp_flags", flags | type_flags::READY)
    }

    fn generic_alloc(&self, ty: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        if !matches!(self.payload(ty.addr()), Some(Payload::Type { .. })) {
            return exception(ExceptionKind::TypeError, "generic_alloc needs a type object");
        }
        if self.type_word(ty.addr(), "tp_flags")? & type_flags::READY == 0 {
            return exception(
                ExceptionKind::SystemError,
                format!("type '{}' is not ready", self.type_name(ty)),
            );
        }
        let basicsize = self.type_word(ty.addr(), "tp_basicsize")?;
        let address = self.alloc_object(ty.addr(), basicsize, Payload::Plain)?;
        Ok(self.adopt(address))
    }

    unsafe fn object_free(&self, ob: *mut PyObject) {
        let removed = self.state.lock().objects.remove(&(ob as usize));
        match removed {
            // SAFETY: the entry is gone, so nothing refers to the memory.
            Some(object) => unsafe { object::release(ob as usize, object.layout) },
            None => warn!(address = ob as usize, "free of an unknown object"),
        }
    }

    fn builtin_kind(&self, ob: BorrowedRef<'_>) -> Option<BuiltinKind> {
        match self.payload(ob.addr())? {
            Payload::None => Some(BuiltinKind::None),
            Payload::NotImplemented => Some(BuiltinKind::NotImplemented),
            Payload::Bool(_) => Some(BuiltinKind::Bool),
            Payload::Int(_) => Some(BuiltinKind::Int),
            Payload::Float(_) => Some(BuiltinKind::Float),
            Payload::Str(_) => Some(BuiltinKind::Str),
            Payload::Tuple(_) => Some(BuiltinKind::Tuple),
            Payload::Dict(_) => Some(BuiltinKind::Dict),
            Payload::Type { .. } => Some(BuiltinKind::Type),
            Payload::Capsule(_) => Some(BuiltinKind::Capsule),
            Payload::Module { .. } => Some(BuiltinKind::Module),
            Payload::Plain | Payload::Function { .. } => None,
        }
    }

    fn none(&self) -> BorrowedRef<'_> {
        self.borrowed(self.builtins.none)
    }

    fn not_implemented(&self) -> BorrowedRef<'_> {
        self.borrowed(self.builtins.not_implemented)
    }

    fn bool_from(&self, value: bool) -> OwnedRef {
        self.new_ref(if value { self.builtins.true_ } else { self.builtins.false_ })
    }

    fn long_from_i64(&self, value: i64) -> NativeResult<OwnedRef> {
        self.alloc_value(self.builtins.int_type, Payload::Int(value))
    }

    fn long_as_i64(&self, ob: BorrowedRef<'_>) -> NativeResult<i64> {
        match self.payload(ob.addr()) {
            Some(Payload::Int(value)) => Ok(value),
            Some(Payload::Bool(value)) => Ok(i64::from(value)),
            _ => exception(
                ExceptionKind::TypeError,
                format!("an integer is required (got type {})", self.type_name_of(ob.addr())),
            ),
        }
    }

    fn float_from_f64(&self, value: f64) -> NativeResult<OwnedRef> {
        self.alloc_value(self.builtins.float_type, Payload::Float(value))
    }

    fn float_as_f64(&self, ob: BorrowedRef<'_>) -> NativeResult<f64> {
        match self.number_value(ob.addr()) {
            Some(value) => Ok(value),
            None => exception(
                ExceptionKind::TypeError,
                format!("must be real number, not {}", self.type_name_of(ob.addr())),
            ),
        }
    }

    fn unicode_from_str(&self, value: &str) -> NativeResult<OwnedRef> {
        self.alloc_value(self.builtins.str_type, Payload::Str(value.to_string()))
    }

    fn unicode_as_string(&self, ob: BorrowedRef<'_>) -> NativeResult<String> {
        match self.payload(ob.addr()) {
            Some(Payload::Str(value)) => Ok(value),
            _ => exception(
                ExceptionKind::TypeError,
                format!("expected str, got {}", self.type_name_of(ob.addr())),
            ),
        }
    }

    fn is_true(&self, ob: BorrowedRef<'_>) -> NativeResult<bool> {
        Ok(match self.payload(ob.addr()) {
            Some(Payload::None) => false,
            Some(Payload::Bool(value)) => value,
            Some(Payload::Int(value)) => value != 0,
            Some(Payload::Float(value)) => value != 0.0,
            Some(Payload::Str(value)) => !value.is_empty(),
            Some(Payload::Tuple(items)) => !items.is_empty(),
            Some(Payload::Dict(entries)) => !entries.is_empty(),
            _ => true,
        })
    }

    fn tuple_new(&self, len: usize) -> NativeResult<OwnedRef> {
        self.alloc_value(self.builtins.tuple_type, Payload::Tuple(vec![0; len]))
    }

    fn tuple_size(&self, tuple: BorrowedRef<'_>) -> NativeResult<usize> {
        Ok(self.tuple_items(tuple.addr())?.len())
    }

    fn tuple_get_item<'a>(&self, tuple: BorrowedRef<'a>, index: usize) -> NativeResult<BorrowedRef<'a>> {
        let items = self.tuple_items(tuple.addr())?;
        match items.get(index) {
            None => exception(ExceptionKind::IndexError, "tuple index out of range"),
            Some(0) => exception(ExceptionKind::SystemError, format!("tuple item {index} is not set")),
            // SAFETY: the tuple owns a reference to each item for `'a`.
            Some(item) => unsafe { BorrowedRef::from_ptr(as_ptr(*item)) },
        }
    }

    fn tuple_set_item(&self, tuple: BorrowedRef<'_>, index: usize, item: StolenRef) -> NativeResult<()> {
        let item = item.into_raw_nullable() as usize;
        let replaced = {
            let mut state = self.state.lock();
            match state.objects.get_mut(&tuple.addr()).map(|object| &mut object.payload) {
                Some(Payload::Tuple(items)) if index < items.len() => Ok(std::mem::replace(&mut items[index], item)),
                Some(Payload::Tuple(_)) => Err(ExceptionKind::IndexError),
                _ => Err(ExceptionKind::TypeError),
            }
        };
        match replaced {
            Ok(previous) => {
                if previous != 0 {
                    self.decref_addr(previous);
                }
                Ok(())
            }
            Err(kind) => {
                if item != 0 {
                    self.decref_addr(item);
                }
                exception(kind, "tuple assignment failed")
            }
        }
    }

    fn dict_new(&self) -> NativeResult<OwnedRef> {
        self.alloc_value(self.builtins.dict_type, Payload::Dict(Vec::new()))
    }

    fn dict_set_item(&self, dict: BorrowedRef<'_>, key: &str, value: BorrowedRef<'_>) -> NativeResult<()> {
        let existing = self.dict_entries(dict.addr())?.into_iter().find(|(candidate, _)| {
            matches!(self.payload(*candidate), Some(Payload::Str(text)) if text == key)
        });
        self.incref_addr(value.addr());
        let replaced = match existing {
            Some((key, _)) => {
                let mut state = self.state.lock();
                match state.objects.get_mut(&dict.addr()).map(|object| &mut object.payload) {
                    Some(Payload::Dict(entries)) => entries
                        .iter_mut()
                        .find(|(candidate, _)| *candidate == key)
                        .map(|entry| std::mem::replace(&mut entry.1, value.addr())),
                    _ => None,
                }
            }
            None => {
                let key = self.unicode_from_str(key)?.into_raw() as usize;
                let mut state = self.state.lock();
                let payload = state.objects.get_mut(&dict.addr()).map(|object| &mut object.payload);
                if let Some(Payload::Dict(entries)) = payload {
                    entries.push((key, value.addr()));
                }
                None
            }
        };
        if let Some(previous) = replaced {
            self.decref_addr(previous);
        }
        Ok(())
    }

    fn dict_next<'a>(
        &self,
        dict: BorrowedRef<'a>,
        position: &mut usize,
    ) -> NativeResult<Option<(BorrowedRef<'a>, BorrowedRef<'a>)>> {
        let entries = self.dict_entries(dict.addr())?;
        let Some((key, value)) = entries.get(*position).copied() else {
            return Ok(None);
        };
        *position += 1;
        // SAFETY: the dict owns a reference to each key and value for `'a`.
        let key = unsafe { BorrowedRef::from_ptr(as_ptr(key)) }?;
        let value = unsafe { BorrowedRef::from_ptr(as_ptr(value)) }?;
        Ok(Some((key, value)))
    }

    fn object_repr(&self, ob: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        let function = self.type_slot(self.type_addr(ob.addr()), "tp_repr");
        if function != 0 {
            // SAFETY: a non-zero tp_repr has the unary signature.
            let function: UnaryFn = unsafe { std::mem::transmute(function) };
            return self.slot_result(unsafe { function(ob.as_ptr()) }, "tp_repr");
        }
        let text = self.builtin_repr(ob.addr())?;
        self.unicode_from_str(&text)
    }

    fn object_str(&self, ob: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        let function = self.type_slot(self.type_addr(ob.addr()), "tp_str");
        if function != 0 {
            // SAFETY: a non-zero tp_str has the unary signature.
            let function: UnaryFn = unsafe { std::mem::transmute(function) };
            return self.slot_result(unsafe { function(ob.as_ptr()) }, "tp_str");
        }
        match self.payload(ob.addr()) {
            Some(Payload::Str(_)) => Ok(self.new_ref(ob.addr())),
            _ => self.object_repr(ob),
        }
    }

    fn object_hash(&self, ob: BorrowedRef<'_>) -> NativeResult<isize> {
        let function = self.type_slot(self.type_addr(ob.addr()), "tp_hash");
        if function != 0 {
            // SAFETY: a non-zero tp_hash has the hash signature.
            let function: HashFn = unsafe { std::mem::transmute(function) };
            let hash = unsafe { function(ob.as_ptr()) };
            if hash == -1 {
                return Err(self.take_error("tp_hash"));
            }
            return Ok(hash);
        }
        let hash = match self.payload(ob.addr()) {
            Some(Payload::Int(value)) => value as isize,
            Some(Payload::Bool(value)) => isize::from(value),
            Some(Payload::Str(value)) => {
                let mut hasher = FxHasher::default();
                value.hash(&mut hasher);
                hasher.finish() as isize
            }
            Some(Payload::Float(value)) => value.to_bits() as isize,
            _ => (ob.addr() >> 4) as isize,
        };
        Ok(if hash == -1 { -2 } else { hash })
    }

    fn object_get_attr(&self, ob: BorrowedRef<'_>, name: &str) -> NativeResult<OwnedRef> {
        let function = self.type_slot(self.type_addr(ob.addr()), "tp_getattro");
        if function != 0 {
            let key = self.unicode_from_str(name)?;
            // SAFETY: a non-zero tp_getattro has the binary signature.
            let function: BinaryFn = unsafe { std::mem::transmute(function) };
            let result = unsafe { function(ob.as_ptr(), key.as_ptr()) };
            self.decref_addr(key.into_raw() as usize);
            return self.slot_result(result, "tp_getattro");
        }
        let found = match self.payload(ob.addr()) {
            Some(Payload::Module { attrs, .. }) => attrs.get(name).copied(),
            Some(Payload::Type { name: type_name }) if name == "__name__" => {
                return self.unicode_from_str(&type_name);
            }
            _ => None,
        };
        match found {
            Some(value) => Ok(self.new_ref(value)),
            None => exception(
                ExceptionKind::AttributeError,
                format!("'{}' object has no attribute '{name}'", self.type_name_of(ob.addr())),
            ),
        }
    }

    fn object_set_attr(&self, ob: BorrowedRef<'_>, name: &str, value: Option<BorrowedRef<'_>>) -> NativeResult<()> {
        let function = self.type_slot(self.type_addr(ob.addr()), "tp_setattro");
        if function != 0 {
            let key = self.unicode_from_str(name)?;
            let value = value.map_or(std::ptr::null_mut(), |value| value.as_ptr());
            // SAFETY: a non-zero tp_setattro has the setattr signature.
            let function: ObjObjArgFn = unsafe { std::mem::transmute(function) };
            let status = unsafe { function(ob.as_ptr(), key.as_ptr(), value) };
            self.decref_addr(key.into_raw() as usize);
            return self.status(status, "tp_setattro");
        }
        if let Some(value) = value {
            self.incref_addr(value.addr());
        }
        let outcome = {
            let mut state = self.state.lock();
            match state.objects.get_mut(&ob.addr()).map(|object| &mut object.payload) {
                Some(Payload::Module { attrs, .. }) => Ok(match value {
                    Some(value) => attrs.insert(name.to_string(), value.addr()),
                    None => attrs.shift_remove(name),
                }),
                _ => Err(()),
            }
        };
        match outcome {
            Ok(previous) => {
                if let Some(previous) = previous {
                    self.decref_addr(previous);
                }
                Ok(())
            }
            Err(()) => {
                if let Some(value) = value {
                    self.decref_addr(value.addr());
                }
                exception(
                    ExceptionKind::AttributeError,
                    format!("'{}' object has no attribute '{name}'", self.type_name_of(ob.addr())),
                )
            }
        }
    }

    fn object_call_kw(
        &self,
        callable: BorrowedRef<'_>,
        args: BorrowedRef<'_>,
        kwargs: Option<BorrowedRef<'_>>,
    ) -> NativeResult<OwnedRef> {
        let function = self.type_slot(self.type_addr(callable.addr()), "tp_call");
        if function != 0 {
            let kwargs = kwargs.map_or(std::ptr::null_mut(), |kwargs| kwargs.as_ptr());
            // SAFETY: a non-zero tp_call has the ternary signature.
            let function: TernaryFn = unsafe { std::mem::transmute(function) };
            let result = unsafe { function(callable.as_ptr(), args.as_ptr(), kwargs) };
            return self.slot_result(result, "tp_call");
        }
        let has_keywords = match kwargs {
            Some(kwargs) => self.object_length(kwargs)? > 0,
            None => false,
        };
        match self.payload(callable.addr()) {
            Some(Payload::Function { name, .. }) if has_keywords => {
                exception(ExceptionKind::TypeError, format!("{name}() takes no keyword arguments"))
            }
            Some(Payload::Function { body, .. }) => {
                let items = self.tuple_items(args.addr())?;
                let borrowed: Vec<BorrowedRef<'_>> = items.iter().map(|item| self.borrowed(*item)).collect();
                body(self, &borrowed)
            }
            _ => exception(
                ExceptionKind::TypeError,
                format!("'{}' object is not callable", self.type_name_of(callable.addr())),
            ),
        }
    }

    fn object_rich_compare(
        &self,
        left: BorrowedRef<'_>,
        right: BorrowedRef<'_>,
        op: CompareOp,
    ) -> NativeResult<OwnedRef> {
        let left_type = self.type_addr(left.addr());
        let right_type = self.type_addr(right.addr());
        if let Some(result) = self.try_compare(left_type, left.addr(), right.addr(), op)? {
            return Ok(result);
        }
        if right_type != left_type {
            if let Some(result) = self.try_compare(right_type, right.addr(), left.addr(), op.swapped())? {
                return Ok(result);
            }
        }
        let outcome = self.builtin_compare(left.addr(), right.addr(), op)?;
        Ok(self.bool_from(outcome))
    }

    fn object_get_item(&self, ob: BorrowedRef<'_>, key: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        let function = self.type_slot(self.type_addr(ob.addr()), "mp_subscript");
        if function != 0 {
            // SAFETY: a non-zero mp_subscript has the binary signature.
            let function: BinaryFn = unsafe { std::mem::transmute(function) };
            return self.slot_result(unsafe { function(ob.as_ptr(), key.as_ptr()) }, "mp_subscript");
        }
        if let Some(Payload::Tuple(items)) = self.payload(ob.addr()) {
            let index = self.long_as_i64(key)?;
            let resolved = if index < 0 { index + items.len() as i64 } else { index };
            return match usize::try_from(resolved).ok().and_then(|index| items.get(index)) {
                Some(item) => Ok(self.new_ref(*item)),
                None => exception(ExceptionKind::IndexError, "tuple index out of range"),
            };
        }
        exception(
            ExceptionKind::TypeError,
            format!("'{}' object is not subscriptable", self.type_name_of(ob.addr())),
        )
    }

    fn object_set_item(
        &self,
        ob: BorrowedRef<'_>,
        key: BorrowedRef<'_>,
        value: Option<BorrowedRef<'_>>,
    ) -> NativeResult<()> {
        let function = self.type_slot(self.type_addr(ob.addr()), "mp_ass_subscript");
        if function == 0 {
            return exception(
                ExceptionKind::TypeError,
                format!("'{}' object does not support item assignment", self.type_name_of(ob.addr())),
            );
        }
        let value = value.map_or(std::ptr::null_mut(), |value| value.as_ptr());
        // SAFETY: a non-zero mp_ass_subscript has the setitem signature.
        let function: ObjObjArgFn = unsafe { std::mem::transmute(function) };
        let status = unsafe { function(ob.as_ptr(), key.as_ptr(), value) };
        self.status(status, "mp_ass_subscript")
    }

    fn object_length(&self, ob: BorrowedRef<'_>) -> NativeResult<usize> {
        let ty = self.type_addr(ob.addr());
        for slot in ["mp_length", "sq_length"] {
            let function = self.type_slot(ty, slot);
            if function != 0 {
                // SAFETY: a non-zero length slot has the length signature.
                let function: LenFn = unsafe { std::mem::transmute(function) };
                let len = unsafe { function(ob.as_ptr()) };
                if len < 0 {
                    return Err(self.take_error(slot));
                }
                return Ok(len as usize);
            }
        }
        match self.payload(ob.addr()) {
            Some(Payload::Str(value)) => Ok(value.chars().count()),
            Some(Payload::Tuple(items)) => Ok(items.len()),
            Some(Payload::Dict(entries)) => Ok(entries.len()),
            _ => exception(
                ExceptionKind::TypeError,
                format!("object of type '{}' has no len()", self.type_name_of(ob.addr())),
            ),
        }
    }

    fn sequence_contains(&self, ob: BorrowedRef<'_>, item: BorrowedRef<'_>) -> NativeResult<bool> {
        let function = self.type_slot(self.type_addr(ob.addr()), "sq_contains");
        if function != 0 {
            // SAFETY: a non-zero sq_contains has the objobj signature.
            let function: ObjObjFn = unsafe { std::mem::transmute(function) };
            let status = unsafe { function(ob.as_ptr(), item.as_ptr()) };
            self.status(status, "sq_contains")?;
            return Ok(status == 1);
        }
        if let Some(Payload::Tuple(items)) = self.payload(ob.addr()) {
            for candidate in items {
                let equal = self.object_rich_compare(self.borrowed(candidate), item, CompareOp::Eq)?;
                let found = self.is_true(equal.borrow())?;
                self.decref_addr(equal.into_raw() as usize);
                if found {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        exception(
            ExceptionKind::TypeError,
            format!("argument of type '{}' is not iterable", self.type_name_of(ob.addr())),
        )
    }

    fn object_get_iter(&self, ob: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        let function = self.type_slot(self.type_addr(ob.addr()), "tp_iter");
        if function == 0 {
            return exception(
                ExceptionKind::TypeError,
                format!("'{}' object is not iterable", self.type_name_of(ob.addr())),
            );
        }
        // SAFETY: a non-zero tp_iter has the unary signature.
        let function: UnaryFn = unsafe { std::mem::transmute(function) };
        self.slot_result(unsafe { function(ob.as_ptr()) }, "tp_iter")
    }

    fn iter_next(&self, iterator: BorrowedRef<'_>) -> NativeResult<Option<OwnedRef>> {
        let function = self.type_slot(self.type_addr(iterator.addr()), "tp_iternext");
        if function == 0 {
            return exception(
                ExceptionKind::TypeError,
                format!("'{}' object is not an iterator", self.type_name_of(iterator.addr())),
            );
        }
        // SAFETY: a non-zero tp_iternext has the unary signature.
        let function: UnaryFn = unsafe { std::mem::transmute(function) };
        let result = unsafe { function(iterator.as_ptr()) };
        if !result.is_null() {
            return Ok(Some(self.adopt(result as usize)));
        }
        match self.err_fetch() {
            None => Ok(None),
            Some(pending) if pending.is(ExceptionKind::StopIteration) => Ok(None),
            Some(pending) => Err(NativeError::Exception(pending)),
        }
    }

    fn number_binary(&self, op: NumberOp, left: BorrowedRef<'_>, right: BorrowedRef<'_>) -> NativeResult<OwnedRef> {
        let slot = op.slot_name();
        let left_type = self.type_addr(left.addr());
        let right_type = self.type_addr(right.addr());
        if let Some(result) = self.try_binary(left_type, slot, left.addr(), right.addr())? {
            return Ok(result);
        }
        if right_type != left_type {
            if let Some(result) = self.try_binary(right_type, slot, left.addr(), right.addr())? {
                return Ok(result);
            }
        }
        self.builtin_number(op, left.addr(), right.addr())
    }

    fn import_module(&self, name: &str) -> NativeResult<OwnedRef> {
        let module = self.state.lock().modules.get(name).copied();
        match module {
            Some(module) => Ok(self.new_ref(module)),
            None => exception(ExceptionKind::ModuleNotFoundError, format!("No module named '{name}'")),
        }
    }

    fn sys_get_object(&self, name: &str) -> Option<BorrowedRef<'_>> {
        let address = self.state.lock().sys.get(name).copied()?;
        Some(self.borrowed(address))
    }

    fn sys_set_object(&self, name: &str, value: Option<BorrowedRef<'_>>) -> NativeResult<()> {
        if let Some(value) = value {
            self.incref_addr(value.addr());
        }
        let previous = {
            let mut state = self.state.lock();
            match value {
                Some(value) => state.sys.insert(name.to_string(), value.addr()),
                None => state.sys.shift_remove(name),
            }
        };
        if let Some(previous) = previous {
            self.decref_addr(previous);
        }
        Ok(())
    }

    fn capsule_new(&self, pointer: NonNull<c_void>) -> NativeResult<OwnedRef> {
        self.alloc_value(self.builtins.capsule_type, Payload::Capsule(pointer.as_ptr() as usize))
    }

    fn capsule_get_pointer(&self, capsule: BorrowedRef<'_>) -> NativeResult<NonNull<c_void>> {
        match self.payload(capsule.addr()) {
            Some(Payload::Capsule(pointer)) => NonNull::new(pointer as *mut c_void)
                .ok_or_else(|| NativeError::exception(ExceptionKind::ValueError, "capsule holds a null pointer")),
            _ => exception(
                ExceptionKind::ValueError,
                "capsule_get_pointer called with invalid capsule object",
            ),
        }
    }

    fn mem_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let (address, layout) = object::allocate(size)?;
        self.state.lock().blocks.insert(address, layout);
        NonNull::new(address as *mut u8)
    }

    unsafe fn mem_free(&self, block: NonNull<u8>) {
        let address = block.as_ptr() as usize;
        let layout = self.state.lock().blocks.remove(&address);
        match layout {
            // SAFETY: the block was allocated by `mem_malloc` and is now untracked.
            Some(layout) => unsafe { object::release(address, layout) },
            None => warn!(address, "free of an unknown memory block"),
        }
    }

    fn err_set(&self, exception: &NativeException) {
        self.state.lock().error = Some(exception.clone());
    }

    fn err_occurred(&self) -> bool {
        self.state.lock().error.is_some()
    }

    fn err_fetch(&self) -> Option<NativeException> {
        self.state.lock().error.take()
    }

    fn err_clear(&self) {
        self.state.lock().error = None;
    }

    fn gil_ensure(&self) -> GilToken {
        self.state.lock().threads.insert(current_thread());
        self.gil.ensure()
    }

    fn gil_release(&self, token: GilToken) {
        self.gil.release(token);
    }

    fn save_thread(&self) -> ThreadStateToken {
        self.gil.save()
    }

    fn restore_thread(&self, state: ThreadStateToken) {
        self.gil.restore(state);
    }

    fn thread_id(&self) -> u64 {
        current_thread()
    }

    fn set_async_exc(&self, thread_id: u64, kind: ExceptionKind) -> usize {
        let mut state = self.state.lock();
        if state.threads.contains(&thread_id) {
            state.async_exc.insert(thread_id, kind);
            1
        } else {
            0
        }
    }

    fn check_signals(&self) -> NativeResult<()> {
        let pending = self.state.lock().async_exc.remove(&current_thread());
        match pending {
            Some(kind) => exception(kind, ""),
            None => Ok(()),
        }
    }
}
