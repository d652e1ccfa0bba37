//! Slot adapters.
//!
//! One `extern "C"` function per [`SlotKind`]. Each enters from native code,
//! looks up the attached engine, and dispatches through the slot binding of
//! the receiver's descriptor. Errors and panics never unwind into native
//! code: they become the pending native exception and the adapter returns
//! the slot's failure value.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use libc::{c_int, c_void};
use pyclr_native::ffi::{
    BinaryFn, DestructorFn, HashFn, InquiryFn, LenFn, ObjObjArgFn, ObjObjFn, RichCompareFn, TernaryFn, TraverseFn,
    UnaryFn, VisitFn,
};
use pyclr_native::{api, gil, BorrowedRef, BuiltinKind, CompareOp, ExceptionKind, NumberOp, OwnedRef, PyObject};
use smol_str::SmolStr;
use tracing::{error, warn};

use crate::convert::{args_from_tuple, from_native, keywords_from_dict, to_native};
use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::managed::{InstanceId, ManagedRef, Member, Value};
use crate::maybe::MaybeMember;
use crate::projection::{Projection, SlotBinding, SlotKind, TypeDescriptor};
use crate::registry::{BridgeTarget, HeldInstance, OverloadFilter};
use crate::stash;

// ============================================================================
// Boundary helpers
// ============================================================================

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn raise(err: &BridgeError) {
    match api::try_get() {
        Some(native) => err.raise(native.as_ref()),
        None => error!(%err, "no interpreter installed to raise into"),
    }
}

/// Run a slot body against the attached engine.
fn guarded<R>(failure: R, body: impl FnOnce(&Engine) -> BridgeResult<R>) -> R {
    let _entry = gil::enter_from_native();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let engine = Engine::current()?;
        body(&engine)
    }));
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            raise(&err);
            failure
        }
        Err(payload) => {
            let err = BridgeError::Panic {
                message: panic_message(payload),
            };
            error!(%err, "panic caught at slot boundary");
            raise(&err);
            failure
        }
    }
}

fn borrowed<'a>(ob: *mut PyObject) -> BridgeResult<BorrowedRef<'a>> {
    // SAFETY: native callers pass live objects for the duration of the slot call.
    Ok(unsafe { BorrowedRef::from_ptr(ob) }?)
}

fn status(result: BridgeResult<()>) -> BridgeResult<c_int> {
    result.map(|()| 0)
}

// ============================================================================
// extern "C" slots
// ============================================================================

unsafe extern "C" fn tp_dealloc(ob: *mut PyObject) {
    let _entry = gil::enter_from_native();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match Engine::try_current() {
        Some(engine) => engine.finalize(ob),
        None => free_detached(ob),
    }));
    if let Err(payload) = outcome {
        error!(message = %panic_message(payload), "panic while deallocating bridge object");
    }
}

unsafe extern "C" fn tp_repr(ob: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        Ok(repr(engine, borrowed(ob)?, SlotKind::Repr)?.into_raw())
    })
}

unsafe extern "C" fn tp_str(ob: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        Ok(repr(engine, borrowed(ob)?, SlotKind::Str)?.into_raw())
    })
}

unsafe extern "C" fn tp_hash(ob: *mut PyObject) -> isize {
    guarded(-1, |engine| hash(engine, borrowed(ob)?))
}

unsafe extern "C" fn tp_call(ob: *mut PyObject, args: *mut PyObject, kwargs: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        let callable = borrowed(ob)?;
        // SAFETY: args is null or a live tuple, kwargs null or a live dict.
        let args = unsafe { BorrowedRef::from_nullable(args) };
        let kwargs = unsafe { BorrowedRef::from_nullable(kwargs) };
        Ok(call(engine, callable, args, kwargs)?.into_raw())
    })
}

unsafe extern "C" fn tp_getattro(ob: *mut PyObject, name: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        Ok(get_attr(engine, borrowed(ob)?, borrowed(name)?)?.into_raw())
    })
}

unsafe extern "C" fn tp_setattro(ob: *mut PyObject, name: *mut PyObject, value: *mut PyObject) -> c_int {
    guarded(-1, |engine| {
        // SAFETY: value is null (delete) or a live object.
        let value = unsafe { BorrowedRef::from_nullable(value) };
        status(set_attr(engine, borrowed(ob)?, borrowed(name)?, value))
    })
}

unsafe extern "C" fn tp_richcompare(left: *mut PyObject, right: *mut PyObject, op: c_int) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        let op = CompareOp::from_raw(op).ok_or_else(|| BridgeError::contract(format!("unknown comparison {op}")))?;
        Ok(rich_compare(engine, borrowed(left)?, borrowed(right)?, op)?.into_raw())
    })
}

unsafe extern "C" fn tp_iter(ob: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| Ok(iter(engine, borrowed(ob)?)?.into_raw()))
}

unsafe extern "C" fn tp_iternext(ob: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        Ok(iter_next(engine, borrowed(ob)?)?.map_or(ptr::null_mut(), OwnedRef::into_raw))
    })
}

unsafe extern "C" fn mp_length(ob: *mut PyObject) -> isize {
    guarded(-1, |engine| {
        let len = length(engine, borrowed(ob)?)?;
        isize::try_from(len).map_err(|_| BridgeError::conversion("length", "Py_ssize_t"))
    })
}

unsafe extern "C" fn sq_contains(ob: *mut PyObject, item: *mut PyObject) -> c_int {
    guarded(-1, |engine| {
        contains(engine, borrowed(ob)?, borrowed(item)?).map(c_int::from)
    })
}

unsafe extern "C" fn mp_subscript(ob: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    guarded(ptr::null_mut(), |engine| {
        Ok(subscript(engine, borrowed(ob)?, borrowed(key)?)?.into_raw())
    })
}

unsafe extern "C" fn mp_ass_subscript(ob: *mut PyObject, key: *mut PyObject, value: *mut PyObject) -> c_int {
    guarded(-1, |engine| {
        // SAFETY: value is null (delete) or a live object.
        let value = unsafe { BorrowedRef::from_nullable(value) };
        status(assign_subscript(engine, borrowed(ob)?, borrowed(key)?, value))
    })
}

unsafe extern "C" fn tp_traverse(ob: *mut PyObject, visit: VisitFn, arg: *mut c_void) -> c_int {
    let _entry = gil::enter_from_native();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> c_int {
        let Some(engine) = Engine::try_current() else {
            return 0;
        };
        let Ok(object) = borrowed(ob) else {
            return 0;
        };
        match engine.bridge_target(object) {
            Ok(Some((_, BridgeTarget::Instance(HeldInstance::Live(instance))))) => {
                let mut result = 0;
                instance.visit_native(&mut |referent| {
                    if result == 0 {
                        // SAFETY: the collector supplied `visit` and `arg` for this traversal.
                        result = unsafe { visit(referent.as_ptr(), arg) };
                    }
                });
                result
            }
            _ => 0,
        }
    }));
    outcome.unwrap_or(0)
}

unsafe extern "C" fn tp_clear(_ob: *mut PyObject) -> c_int {
    // managed instances drop their native references themselves
    0
}

macro_rules! number_adapters {
    ($($name:ident => $op:expr),* $(,)?) => {
        $(
            unsafe extern "C" fn $name(left: *mut PyObject, right: *mut PyObject) -> *mut PyObject {
                guarded(ptr::null_mut(), |engine| {
                    Ok(number(engine, $op, borrowed(left)?, borrowed(right)?)?.into_raw())
                })
            }
        )*
    };
}

number_adapters! {
    nb_add => NumberOp::Add,
    nb_subtract => NumberOp::Subtract,
    nb_multiply => NumberOp::Multiply,
    nb_true_divide => NumberOp::TrueDivide,
    nb_floor_divide => NumberOp::FloorDivide,
    nb_remainder => NumberOp::Remainder,
    nb_and => NumberOp::And,
    nb_or => NumberOp::Or,
    nb_xor => NumberOp::Xor,
    nb_lshift => NumberOp::LeftShift,
    nb_rshift => NumberOp::RightShift,
}

/// Address of the adapter for a slot kind.
pub(crate) fn address_of(kind: SlotKind) -> usize {
    match kind {
        SlotKind::Dealloc => tp_dealloc as DestructorFn as usize,
        SlotKind::Repr => tp_repr as UnaryFn as usize,
        SlotKind::Str => tp_str as UnaryFn as usize,
        SlotKind::Hash => tp_hash as HashFn as usize,
        SlotKind::Call => tp_call as TernaryFn as usize,
        SlotKind::GetAttr => tp_getattro as BinaryFn as usize,
        SlotKind::SetAttr => tp_setattro as ObjObjArgFn as usize,
        SlotKind::RichCompare => tp_richcompare as RichCompareFn as usize,
        SlotKind::Iter => tp_iter as UnaryFn as usize,
        SlotKind::IterNext => tp_iternext as UnaryFn as usize,
        SlotKind::Length => mp_length as LenFn as usize,
        SlotKind::Contains => sq_contains as ObjObjFn as usize,
        SlotKind::Subscript => mp_subscript as BinaryFn as usize,
        SlotKind::AssignSubscript => mp_ass_subscript as ObjObjArgFn as usize,
        SlotKind::Traverse => tp_traverse as TraverseFn as usize,
        SlotKind::Clear => tp_clear as InquiryFn as usize,
        SlotKind::Number(op) => match op {
            NumberOp::Add => nb_add as BinaryFn as usize,
            NumberOp::Subtract => nb_subtract as BinaryFn as usize,
            NumberOp::Multiply => nb_multiply as BinaryFn as usize,
            NumberOp::TrueDivide => nb_true_divide as BinaryFn as usize,
            NumberOp::FloorDivide => nb_floor_divide as BinaryFn as usize,
            NumberOp::Remainder => nb_remainder as BinaryFn as usize,
            NumberOp::And => nb_and as BinaryFn as usize,
            NumberOp::Or => nb_or as BinaryFn as usize,
            NumberOp::Xor => nb_xor as BinaryFn as usize,
            NumberOp::LeftShift => nb_lshift as BinaryFn as usize,
            NumberOp::RightShift => nb_rshift as BinaryFn as usize,
        },
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Free a bridge object that died while no engine was attached.
fn free_detached(ob: *mut PyObject) {
    let Some(native) = api::try_get() else {
        warn!(addr = ob as usize, "no interpreter installed; bridge object leaked");
        return;
    };
    let Ok(object) = borrowed(ob) else {
        return;
    };
    let ty = native.type_of(object).as_ptr();
    stash::note_detached_free(ob as usize);
    // SAFETY: called from the deallocation slot of `ob`.
    unsafe { native.object_free(ob) };
    // SAFETY: every instance owns one reference to its type.
    drop(unsafe { OwnedRef::from_raw(ty) });
}

fn instance_of(
    engine: &Engine,
    ob: BorrowedRef<'_>,
) -> BridgeResult<(Arc<TypeDescriptor>, Arc<Projection>, HeldInstance)> {
    let (descriptor, target) = engine.resolve_bridge(ob)?;
    let projection = descriptor.projection()?;
    match target {
        BridgeTarget::Instance(held) => Ok((descriptor, projection, held)),
        BridgeTarget::BoundMethod { .. } => Err(BridgeError::contract(format!(
            "bound method reached an instance slot of `{}`",
            descriptor.name()
        ))),
    }
}

fn bound_member<'p>(projection: &'p Projection, index: usize) -> BridgeResult<&'p Member> {
    projection
        .member(index)
        .ok_or_else(|| BridgeError::contract(format!("slot bound to missing member #{index}")))
}

fn invoke(projection: &Projection, index: usize, target: Option<&ManagedRef>, args: &[Value]) -> BridgeResult<Value> {
    Ok(bound_member(projection, index)?.invoke(target, args)?)
}

/// Read a property-backed slot, or call a method-backed one.
fn read_or_invoke(projection: &Projection, index: usize, target: &ManagedRef, args: &[Value]) -> BridgeResult<Value> {
    let member = bound_member(projection, index)?;
    if member.is_readable() && args.is_empty() {
        Ok(member.get(Some(target))?)
    } else {
        Ok(member.invoke(Some(target), args)?)
    }
}

fn repr(engine: &Engine, ob: BorrowedRef<'_>, kind: SlotKind) -> BridgeResult<OwnedRef> {
    let native = engine.native();
    let (descriptor, target) = engine.resolve_bridge(ob)?;
    match target {
        BridgeTarget::BoundMethod { receiver, member, .. } => {
            let text = format!(
                "<bound method {}.{} of {} object>",
                member.declaring_type(),
                member.member_name(),
                receiver.type_name()
            );
            Ok(native.unicode_from_str(&text)?)
        }
        BridgeTarget::Instance(held) => {
            let projection = descriptor.projection()?;
            let instance = held.live()?;
            match projection.slot(kind) {
                Some(SlotBinding::Member(index)) => match invoke(&projection, index, Some(instance), &[])? {
                    Value::Str(text) => Ok(native.unicode_from_str(&text)?),
                    other => {
                        let object = to_native(engine, &other)?;
                        Ok(native.object_str(object.borrow())?)
                    }
                },
                _ => Ok(native.unicode_from_str(&format!(
                    "<{} object at {:#x}>",
                    descriptor.name(),
                    ob.addr()
                ))?),
            }
        }
    }
}

fn hash(engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<isize> {
    let (_, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    let value = match projection.slot(SlotKind::Hash) {
        Some(SlotBinding::Member(index)) => invoke(&projection, index, Some(instance), &[])?
            .as_int()
            .ok_or_else(|| BridgeError::conversion("GetHashCode result", "int"))? as isize,
        _ => (InstanceId::of(instance).as_usize() >> 4) as isize,
    };
    // -1 signals an error to native callers
    Ok(if value == -1 { -2 } else { value })
}

fn rich_compare(engine: &Engine, left: BorrowedRef<'_>, right: BorrowedRef<'_>, op: CompareOp) -> BridgeResult<OwnedRef> {
    let native = engine.native();
    let (_, projection, held) = instance_of(engine, left)?;
    let instance = held.live()?;
    let other = from_native(engine, right)?;
    let equality = matches!(op, CompareOp::Eq | CompareOp::Ne);
    let outcome = match projection.slot(SlotKind::RichCompare) {
        Some(SlotBinding::Compare {
            equals: Some(index), ..
        }) if equality => {
            let equal = invoke(&projection, index, Some(instance), &[other])?.is_truthy();
            Some(equal == (op == CompareOp::Eq))
        }
        Some(SlotBinding::Compare {
            compare_to: Some(index),
            ..
        }) if !equality => {
            let ordering = invoke(&projection, index, Some(instance), &[other])?
                .as_int()
                .ok_or_else(|| BridgeError::conversion("CompareTo result", "int"))?;
            Some(op.matches(ordering.cmp(&0)))
        }
        _ if equality => {
            let same = matches!(&other, Value::Object(o) if InstanceId::of(o) == InstanceId::of(instance));
            Some(same == (op == CompareOp::Eq))
        }
        _ => None,
    };
    Ok(match outcome {
        Some(flag) => native.bool_from(flag),
        None => native.not_implemented().to_owned(),
    })
}

fn get_attr(engine: &Engine, ob: BorrowedRef<'_>, name: BorrowedRef<'_>) -> BridgeResult<OwnedRef> {
    let native = engine.native();
    let name = native.unicode_as_string(name)?;
    let (descriptor, target) = engine.resolve_bridge(ob)?;
    match target {
        BridgeTarget::BoundMethod {
            receiver,
            member,
            overload,
        } => match name.as_str() {
            "__name__" => Ok(native.unicode_from_str(member.member_name())?),
            "__overloads__" if overload == OverloadFilter::Any => {
                engine.bind_method(receiver, member, OverloadFilter::Mapper)
            }
            "__qualname__" => Ok(native.unicode_from_str(&format!(
                "{}.{}",
                member.declaring_type().name(),
                member.member_name()
            ))?),
            _ => Err(BridgeError::attribute_not_found(descriptor.name(), name)),
        },
        BridgeTarget::Instance(held) => {
            let projection = descriptor.projection()?;
            let instance = held.live()?;
            if projection.has_method(&name) {
                let member = MaybeMember::new(projection.managed_type(), &name);
                return engine.bind_method(held.clone(), member, OverloadFilter::Any);
            }
            match projection.attribute(&name) {
                Some(member) if member.is_readable() => {
                    let value = member.get(Some(instance))?;
                    to_native(engine, &value)
                }
                _ => Err(BridgeError::attribute_not_found(descriptor.name(), name)),
            }
        }
    }
}

fn set_attr(
    engine: &Engine,
    ob: BorrowedRef<'_>,
    name: BorrowedRef<'_>,
    value: Option<BorrowedRef<'_>>,
) -> BridgeResult<()> {
    let name = engine.native().unicode_as_string(name)?;
    let (descriptor, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    let Some(value) = value else {
        return Err(BridgeError::not_supported(
            descriptor.name(),
            format!("deleting attribute '{name}'"),
        ));
    };
    match projection.attribute(&name) {
        Some(member) if member.is_writable() => {
            let value = from_native(engine, value)?;
            member.set(Some(instance), value)?;
            Ok(())
        }
        Some(_) => Err(BridgeError::read_only(descriptor.name(), name)),
        None if projection.has_method(&name) => Err(BridgeError::read_only(descriptor.name(), name)),
        None => Err(BridgeError::attribute_not_found(descriptor.name(), name)),
    }
}

fn arity_error(member: &str, candidates: &[&Member], given: usize) -> BridgeError {
    let mut arities: Vec<String> = candidates
        .iter()
        .filter_map(|candidate| candidate.arity())
        .map(|arity| arity.to_string())
        .collect();
    arities.dedup();
    BridgeError::ArgumentCount {
        member: member.to_string(),
        expected: arities.join(" or "),
        actual: given,
    }
}

/// Pick the overload for the arguments and arrange them in its parameter
/// order. An overload whose declared parameter types match wins over one
/// that only binds.
fn select_overload<'m>(
    name: &str,
    candidates: &[&'m Member],
    args: &[Value],
    keywords: &[(SmolStr, Value)],
) -> BridgeResult<(&'m Member, Vec<Value>)> {
    let mut fallback = None;
    let mut mismatch = None;
    for candidate in candidates {
        match candidate.bind_arguments(args, keywords) {
            Ok(bound) if candidate.admits(&bound) => return Ok((*candidate, bound)),
            Ok(bound) => {
                if fallback.is_none() {
                    fallback = Some((*candidate, bound));
                }
            }
            Err(message) => {
                if mismatch.is_none() {
                    mismatch = Some(message);
                }
            }
        }
    }
    match (fallback, mismatch) {
        (Some(found), _) => Ok(found),
        (None, Some(message)) if !keywords.is_empty() => Err(BridgeError::ArgumentBinding {
            member: name.to_string(),
            message,
        }),
        _ => Err(arity_error(name, candidates, args.len())),
    }
}

fn call(
    engine: &Engine,
    ob: BorrowedRef<'_>,
    args: Option<BorrowedRef<'_>>,
    kwargs: Option<BorrowedRef<'_>>,
) -> BridgeResult<OwnedRef> {
    let (descriptor, target) = engine.resolve_bridge(ob)?;
    let values = args_from_tuple(engine, args)?;
    let keywords = keywords_from_dict(engine, kwargs)?;
    let result = match target {
        BridgeTarget::BoundMethod {
            receiver,
            member,
            overload,
        } => {
            let candidates: Vec<&Member> = member
                .candidates(engine.filter())?
                .into_iter()
                .filter(|candidate| overload.admits(candidate))
                .collect();
            let (chosen, bound) = select_overload(member.member_name(), &candidates, &values, &keywords)?;
            if chosen.is_static() {
                chosen.invoke(None, &bound)?
            } else {
                chosen.invoke(Some(receiver.live()?), &bound)?
            }
        }
        BridgeTarget::Instance(held) => {
            let projection = descriptor.projection()?;
            let instance = held.live()?;
            match projection.slot(SlotKind::Call) {
                Some(SlotBinding::Member(index)) => {
                    let member = bound_member(&projection, index)?;
                    let (_, bound) = select_overload(member.name(), &[member], &values, &keywords)?;
                    member.invoke(Some(instance), &bound)?
                }
                _ => return Err(BridgeError::not_supported(descriptor.name(), "calls")),
            }
        }
    };
    to_native(engine, &result)
}

/// Parameter type labels named by an `__overloads__` key: a type, a type
/// name, or a tuple of either.
fn signature_labels(engine: &Engine, key: BorrowedRef<'_>) -> BridgeResult<Vec<SmolStr>> {
    let native = engine.native();
    let label = |item: BorrowedRef<'_>| -> BridgeResult<SmolStr> {
        match native.builtin_kind(item) {
            Some(BuiltinKind::Type) => Ok(SmolStr::from(native.type_name(item))),
            Some(BuiltinKind::Str) => Ok(SmolStr::from(native.unicode_as_string(item)?)),
            _ => Err(BridgeError::conversion(
                native.type_name(native.type_of(item)),
                "an overload signature",
            )),
        }
    };
    if native.builtin_kind(key) != Some(BuiltinKind::Tuple) {
        return Ok(vec![label(key)?]);
    }
    let len = native.tuple_size(key)?;
    let mut labels = Vec::with_capacity(len);
    for index in 0..len {
        labels.push(label(native.tuple_get_item(key, index)?)?);
    }
    Ok(labels)
}

/// `method.__overloads__[types]`: a bound method restricted to one overload.
fn select_signature(
    engine: &Engine,
    receiver: HeldInstance,
    member: MaybeMember,
    key: BorrowedRef<'_>,
) -> BridgeResult<OwnedRef> {
    let labels = signature_labels(engine, key)?;
    let declared = member
        .candidates(engine.filter())?
        .iter()
        .any(|candidate| candidate.signature().as_deref() == Some(labels.as_slice()));
    if !declared {
        return Err(BridgeError::NoMatchingOverload {
            member: member.member_name().to_string(),
            signature: labels.join(", "),
        });
    }
    engine.bind_method(receiver, member, OverloadFilter::Signature(labels))
}

fn iter(engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<OwnedRef> {
    let (descriptor, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    match projection.slot(SlotKind::Iter) {
        Some(SlotBinding::Member(index)) => {
            let enumerator = invoke(&projection, index, Some(instance), &[])?;
            to_native(engine, &enumerator)
        }
        Some(_) => Ok(ob.to_owned()),
        None => Err(BridgeError::not_supported(descriptor.name(), "iteration")),
    }
}

/// The managed side signalled the end of iteration by throwing.
fn is_exhaustion(err: &BridgeError) -> bool {
    match err {
        BridgeError::Managed(exception) => exception
            .native
            .as_ref()
            .map_or(false, |native| native.is(ExceptionKind::StopIteration)),
        BridgeError::Native(native) => native.is_exception_of(ExceptionKind::StopIteration),
        _ => false,
    }
}

fn iter_next(engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<Option<OwnedRef>> {
    let (descriptor, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    let Some(SlotBinding::IterNext { move_next, current }) = projection.slot(SlotKind::IterNext) else {
        return Err(BridgeError::not_supported(descriptor.name(), "iteration"));
    };
    let advanced = match invoke(&projection, move_next, Some(instance), &[]) {
        Ok(value) => value.is_truthy(),
        Err(err) if is_exhaustion(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    if !advanced {
        return Ok(None);
    }
    let value = bound_member(&projection, current)?.get(Some(instance))?;
    Ok(Some(to_native(engine, &value)?))
}

fn length(engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<usize> {
    let (descriptor, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    let Some(SlotBinding::Member(index)) = projection.slot(SlotKind::Length) else {
        return Err(BridgeError::not_supported(descriptor.name(), "len()"));
    };
    let count = read_or_invoke(&projection, index, instance, &[])?
        .as_int()
        .ok_or_else(|| BridgeError::conversion("length", "int"))?;
    usize::try_from(count).map_err(|_| BridgeError::conversion(format!("negative length {count}"), "usize"))
}

fn contains(engine: &Engine, ob: BorrowedRef<'_>, item: BorrowedRef<'_>) -> BridgeResult<bool> {
    let (descriptor, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    let Some(SlotBinding::Member(index)) = projection.slot(SlotKind::Contains) else {
        return Err(BridgeError::not_supported(descriptor.name(), "membership tests"));
    };
    let item = from_native(engine, item)?;
    Ok(invoke(&projection, index, Some(instance), &[item])?.is_truthy())
}

fn subscript(engine: &Engine, ob: BorrowedRef<'_>, key: BorrowedRef<'_>) -> BridgeResult<OwnedRef> {
    let (descriptor, target) = engine.resolve_bridge(ob)?;
    let held = match target {
        BridgeTarget::BoundMethod {
            receiver,
            member,
            overload: OverloadFilter::Mapper,
        } => return select_signature(engine, receiver, member, key),
        BridgeTarget::BoundMethod { .. } => {
            return Err(BridgeError::not_supported(descriptor.name(), "subscripting"))
        }
        BridgeTarget::Instance(held) => held,
    };
    let projection = descriptor.projection()?;
    let instance = held.live()?;
    let Some(SlotBinding::Member(index)) = projection.slot(SlotKind::Subscript) else {
        return Err(BridgeError::not_supported(descriptor.name(), "subscripting"));
    };
    let key = from_native(engine, key)?;
    let value = invoke(&projection, index, Some(instance), &[key])?;
    to_native(engine, &value)
}

fn assign_subscript(
    engine: &Engine,
    ob: BorrowedRef<'_>,
    key: BorrowedRef<'_>,
    value: Option<BorrowedRef<'_>>,
) -> BridgeResult<()> {
    let (descriptor, projection, held) = instance_of(engine, ob)?;
    let instance = held.live()?;
    let (Some(SlotBinding::Member(index)), Some(value)) = (projection.slot(SlotKind::AssignSubscript), value) else {
        return Err(BridgeError::not_supported(descriptor.name(), "item assignment"));
    };
    let key = from_native(engine, key)?;
    let value = from_native(engine, value)?;
    invoke(&projection, index, Some(instance), &[key, value])?;
    Ok(())
}

fn operand_descriptor(engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<Option<Arc<TypeDescriptor>>> {
    Ok(match engine.bridge_target(ob)? {
        Some((descriptor, BridgeTarget::Instance(_))) => Some(descriptor),
        _ => None,
    })
}

fn number(engine: &Engine, op: NumberOp, left: BorrowedRef<'_>, right: BorrowedRef<'_>) -> BridgeResult<OwnedRef> {
    for operand in [left, right] {
        let Some(descriptor) = operand_descriptor(engine, operand)? else {
            continue;
        };
        let projection = descriptor.projection()?;
        if let Some(SlotBinding::Member(index)) = projection.slot(SlotKind::Number(op)) {
            let args = [from_native(engine, left)?, from_native(engine, right)?];
            let value = invoke(&projection, index, None, &args)?;
            return to_native(engine, &value);
        }
    }
    Ok(engine.native().not_implemented().to_owned())
}
