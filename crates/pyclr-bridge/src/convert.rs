//! Value conversion across the boundary.
//!
//! Scalars are copied. Managed instances cross as bridge objects and come
//! back unwrapped, unless a registered codec claims them. Any other native
//! object crosses as a [`NativeObject`] holding its own reference.

use std::sync::Arc;

use pyclr_native::{gil, BorrowedRef, BuiltinKind, NativeObject, OwnedRef};
use smol_str::SmolStr;

use crate::engine::Engine;
use crate::error::BridgeResult;
use crate::managed::Value;

/// A new native reference for `value`.
pub fn to_native(engine: &Engine, value: &Value) -> BridgeResult<OwnedRef> {
    gil::assert_held("to_native");
    let native = engine.native();
    Ok(match value {
        Value::None => native.none().to_owned(),
        Value::Bool(flag) => native.bool_from(*flag),
        Value::Int(number) => native.long_from_i64(*number)?,
        Value::Float(number) => native.float_from_f64(*number)?,
        Value::Str(text) => native.unicode_from_str(text)?,
        Value::Object(instance) => match engine.encode(instance)? {
            Some(encoded) => encoded,
            None => engine.wrap(instance)?,
        },
        Value::Native(object) => NativeObject::to_owned(object),
    })
}

pub fn from_native(engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<Value> {
    gil::assert_held("from_native");
    let native = engine.native();
    Ok(match native.builtin_kind(ob) {
        Some(BuiltinKind::None) => Value::None,
        Some(BuiltinKind::Bool) => Value::Bool(native.is_true(ob)?),
        Some(BuiltinKind::Int) => Value::Int(native.long_as_i64(ob)?),
        Some(BuiltinKind::Float) => Value::Float(native.float_as_f64(ob)?),
        Some(BuiltinKind::Str) => Value::from(native.unicode_as_string(ob)?),
        _ => match engine.unwrap(ob)? {
            Some(instance) => Value::Object(instance),
            None => match engine.decode(ob)? {
                Some(value) => value,
                None => Value::Native(Arc::new(ob.to_owned().into_managed())),
            },
        },
    })
}

/// Convert a native argument tuple. A null tuple means no arguments.
pub fn args_from_tuple(engine: &Engine, args: Option<BorrowedRef<'_>>) -> BridgeResult<Vec<Value>> {
    let Some(args) = args else {
        return Ok(Vec::new());
    };
    let native = engine.native();
    let len = native.tuple_size(args)?;
    let mut values = Vec::with_capacity(len);
    for index in 0..len {
        let item = native.tuple_get_item(args, index)?;
        values.push(from_native(engine, item)?);
    }
    Ok(values)
}

/// Convert a native keyword dict. A null dict means no keywords.
pub fn keywords_from_dict(engine: &Engine, kwargs: Option<BorrowedRef<'_>>) -> BridgeResult<Vec<(SmolStr, Value)>> {
    let Some(kwargs) = kwargs else {
        return Ok(Vec::new());
    };
    let native = engine.native();
    let mut keywords = Vec::new();
    let mut position = 0;
    while let Some((key, value)) = native.dict_next(kwargs, &mut position)? {
        keywords.push((SmolStr::from(native.unicode_as_string(key)?), from_native(engine, value)?));
    }
    Ok(keywords)
}

/// Build a native keyword dict.
pub fn dict_from_keywords(engine: &Engine, keywords: &[(SmolStr, Value)]) -> BridgeResult<OwnedRef> {
    let native = engine.native();
    let dict = native.dict_new()?;
    for (key, value) in keywords {
        let item = to_native(engine, value)?;
        native.dict_set_item(dict.borrow(), key, item.borrow())?;
    }
    Ok(dict)
}

/// Build a native argument tuple.
pub fn tuple_from_values(engine: &Engine, values: &[Value]) -> BridgeResult<OwnedRef> {
    let native = engine.native();
    let tuple = native.tuple_new(values.len())?;
    for (index, value) in values.iter().enumerate() {
        let item = to_native(engine, value)?;
        native.tuple_set_item(tuple.borrow(), index, item.steal())?;
    }
    Ok(tuple)
}
