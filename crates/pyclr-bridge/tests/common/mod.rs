//! Shared fixtures: a small managed domain and an attached engine running
//! against the simulated interpreter.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex, MutexGuard};
use pyclr_bridge::convert::tuple_from_values;
use pyclr_bridge::{
    downcast, BridgeConfig, Domain, Engine, ManagedException, ManagedObject, ManagedRef, ManagedType, Param,
    RestoreStats, ShutdownMode, StashStats, StaticDomain, TypeName, Value,
};
use pyclr_native::{BorrowedRef, ExceptionKind, NativeApi, NativeException, NativeObject, NativeResult, OwnedRef};
use pyclr_sim::SimInterpreter;
use serde_json::json;

pub const COUNTER: &str = "Demo.Counter";
pub const BAG: &str = "Demo.Bag";
pub const BAG_ENUMERATOR: &str = "Demo.BagEnumerator";
pub const VECTOR: &str = "Demo.Vector";
pub const TOKEN: &str = "Demo.Token";
pub const HOLDER: &str = "Demo.Holder";
pub const BOX: &str = "Demo.Box`1";
pub const COUNTDOWN: &str = "Demo.Countdown";
pub const FORMATTER: &str = "Demo.Formatter";

/// The engine is process-wide; tests in one binary take turns.
static SERIAL: Mutex<()> = const_mutex(());

// ============================================================================
// Managed instances
// ============================================================================

pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn create(value: i64) -> ManagedRef {
        Arc::new(Counter {
            value: AtomicI64::new(value),
        })
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl ManagedObject for Counter {
    fn type_name(&self) -> TypeName {
        TypeName::parse(COUNTER)
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        Some(json!({ "value": self.value() }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Bag {
    items: Vec<i64>,
}

impl Bag {
    pub fn create(items: Vec<i64>) -> ManagedRef {
        Arc::new(Bag { items })
    }
}

impl ManagedObject for Bag {
    fn type_name(&self) -> TypeName {
        TypeName::parse(BAG)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct BagEnumerator {
    items: Vec<i64>,
    position: Mutex<Option<usize>>,
}

impl ManagedObject for BagEnumerator {
    fn type_name(&self) -> TypeName {
        TypeName::parse(BAG_ENUMERATOR)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Vector {
    pub x: i64,
}

impl Vector {
    pub fn create(x: i64) -> ManagedRef {
        Arc::new(Vector { x })
    }
}

impl ManagedObject for Vector {
    fn type_name(&self) -> TypeName {
        TypeName::parse(VECTOR)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Token;

impl ManagedObject for Token {
    fn type_name(&self) -> TypeName {
        TypeName::parse(TOKEN)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Keeps a native object alive from the managed side.
pub struct Holder {
    pub held: NativeObject,
}

impl ManagedObject for Holder {
    fn type_name(&self) -> TypeName {
        TypeName::parse(HOLDER)
    }

    fn visit_native(&self, visit: &mut dyn FnMut(BorrowedRef<'_>)) {
        visit(self.held.borrow());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Iterates its own remaining count down to 1, then throws from `MoveNext`.
pub struct Countdown {
    remaining: AtomicI64,
}

impl Countdown {
    pub fn create(from: i64) -> ManagedRef {
        Arc::new(Countdown {
            remaining: AtomicI64::new(from + 1),
        })
    }
}

impl ManagedObject for Countdown {
    fn type_name(&self) -> TypeName {
        TypeName::parse(COUNTDOWN)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Formatter;

impl Formatter {
    pub fn create() -> ManagedRef {
        Arc::new(Formatter)
    }
}

impl ManagedObject for Formatter {
    fn type_name(&self) -> TypeName {
        TypeName::parse(FORMATTER)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn receiver<'a, T: ManagedObject>(target: Option<&'a ManagedRef>) -> Result<&'a T, ManagedException> {
    target
        .and_then(|target| downcast::<T>(target))
        .ok_or_else(|| ManagedException::invalid_operation("unexpected receiver"))
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, ManagedException> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| ManagedException::argument(format!("argument {index} must be an int")))
}

// ============================================================================
// Managed types
// ============================================================================

/// `Demo.Counter` with `constant` naming its method that returns 5.
pub fn counter_type(constant: &str) -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(COUNTER))
        .serializable()
        .constructor(1, |_, args| Ok(Value::Object(Counter::create(int_arg(args, 0)?))))
        .method(constant, 0, |_, _| Ok(Value::Int(5)))
        .method("Add", 1, |target, args| {
            let counter = receiver::<Counter>(target)?;
            let amount = int_arg(args, 0)?;
            Ok(Value::Int(counter.value.fetch_add(amount, Ordering::SeqCst) + amount))
        })
        .property_rw(
            "Value",
            |target, _| Ok(Value::Int(receiver::<Counter>(target)?.value())),
            |target, args| {
                let value = int_arg(args, 0)?;
                receiver::<Counter>(target)?.value.store(value, Ordering::SeqCst);
                Ok(Value::None)
            },
        )
        .property("Doubled", |target, _| Ok(Value::Int(receiver::<Counter>(target)?.value() * 2)))
        .method("ToString", 0, |target, _| {
            Ok(Value::from(format!("Counter({})", receiver::<Counter>(target)?.value())))
        })
        .method("Equals", 1, |target, args| {
            let mine = receiver::<Counter>(target)?.value();
            let same = args
                .first()
                .and_then(Value::as_object)
                .and_then(|other| downcast::<Counter>(other))
                .map_or(false, |other| other.value() == mine);
            Ok(Value::Bool(same))
        })
        .method("Fail", 0, |_, _| Err(ManagedException::invalid_operation("counter is broken")))
        .build()
}

pub fn bag_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(BAG))
        .method("get_Item", 1, |target, args| {
            let bag = receiver::<Bag>(target)?;
            let index = int_arg(args, 0)?;
            usize::try_from(index)
                .ok()
                .and_then(|index| bag.items.get(index))
                .map(|item| Value::Int(*item))
                .ok_or_else(|| ManagedException::new("System.ArgumentOutOfRangeException", "index out of range"))
        })
        .method("Contains", 1, |target, args| {
            let bag = receiver::<Bag>(target)?;
            Ok(Value::Bool(bag.items.contains(&int_arg(args, 0)?)))
        })
        .property("Count", |target, _| Ok(Value::Int(receiver::<Bag>(target)?.items.len() as i64)))
        .method("GetEnumerator", 0, |target, _| {
            let bag = receiver::<Bag>(target)?;
            let enumerator: ManagedRef = Arc::new(BagEnumerator {
                items: bag.items.clone(),
                position: Mutex::new(None),
            });
            Ok(Value::Object(enumerator))
        })
        .build()
}

pub fn enumerator_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(BAG_ENUMERATOR))
        .method("MoveNext", 0, |target, _| {
            let enumerator = receiver::<BagEnumerator>(target)?;
            let mut position = enumerator.position.lock();
            let next = position.map_or(0, |current| current + 1);
            *position = Some(next);
            Ok(Value::Bool(next < enumerator.items.len()))
        })
        .property("Current", |target, _| {
            let enumerator = receiver::<BagEnumerator>(target)?;
            let position = *enumerator.position.lock();
            position
                .and_then(|index| enumerator.items.get(index))
                .map(|item| Value::Int(*item))
                .ok_or_else(|| ManagedException::invalid_operation("enumeration has not started"))
        })
        .build()
}

pub fn vector_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(VECTOR))
        .property("X", |target, _| Ok(Value::Int(receiver::<Vector>(target)?.x)))
        .static_method("op_Addition", 2, |_, args| {
            let sum = args
                .iter()
                .map(|arg| {
                    arg.as_object()
                        .and_then(|object| downcast::<Vector>(object))
                        .map(|vector| vector.x)
                        .ok_or_else(|| ManagedException::argument("operands must be vectors"))
                })
                .sum::<Result<i64, _>>()?;
            Ok(Value::Object(Vector::create(sum)))
        })
        .build()
}

pub fn countdown_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(COUNTDOWN))
        .method("MoveNext", 0, |target, _| {
            let countdown = receiver::<Countdown>(target)?;
            if countdown.remaining.fetch_sub(1, Ordering::SeqCst) <= 1 {
                let done = NativeException::new(ExceptionKind::StopIteration, "countdown finished");
                return Err(ManagedException::from_native(done));
            }
            Ok(Value::Bool(true))
        })
        .property("Current", |target, _| {
            Ok(Value::Int(receiver::<Countdown>(target)?.remaining.load(Ordering::SeqCst)))
        })
        .build()
}

/// `Format` is overloaded on `int` and `str`; `Scale` takes an optional factor.
pub fn formatter_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(FORMATTER))
        .method_with_params("Format", vec![Param::new("value", "int")], |_, args| {
            Ok(Value::from(format!("int:{}", int_arg(args, 0)?)))
        })
        .method_with_params("Format", vec![Param::new("value", "str")], |_, args| {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::from(format!("str:{text}")))
        })
        .method_with_params(
            "Scale",
            vec![Param::new("value", "int"), Param::optional("factor", "int", Value::Int(2))],
            |_, args| Ok(Value::Int(int_arg(args, 0)? * int_arg(args, 1)?)),
        )
        .build()
}

pub fn token_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(TOKEN)).sealed().build()
}

pub fn holder_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(HOLDER)).build()
}

pub fn box_type() -> Arc<ManagedType> {
    ManagedType::builder(TypeName::parse(BOX)).build()
}

fn restore_counter(snapshot: &serde_json::Value) -> Option<ManagedRef> {
    snapshot.get("value")?.as_i64().map(Counter::create)
}

fn domain_with(name: &str, constant: &str, with_bag: bool) -> Arc<dyn Domain> {
    let mut domain = StaticDomain::new(name).with_restorable(counter_type(constant), restore_counter);
    if with_bag {
        domain = domain.with_type(bag_type());
    }
    Arc::new(
        domain
            .with_type(enumerator_type())
            .with_type(countdown_type())
            .with_type(formatter_type())
            .with_type(vector_type())
            .with_type(token_type())
            .with_type(holder_type())
            .with_type(box_type()),
    )
}

/// The first generation of the demo domain.
pub fn domain_v1() -> Arc<dyn Domain> {
    domain_with("v1", "M", true)
}

/// Second generation: `Counter.M` was renamed to `N`.
pub fn domain_renamed() -> Arc<dyn Domain> {
    domain_with("v2", "N", true)
}

/// Second generation without `Demo.Bag`.
pub fn domain_without_bag() -> Arc<dyn Domain> {
    domain_with("v2", "M", false)
}

// ============================================================================
// Harness
// ============================================================================

/// An attached engine over a fresh simulated interpreter.
///
/// Detaches on drop; tests acquire the interpreter lock after creating it so
/// their handles are released under the lock first.
pub struct Harness {
    pub sim: Arc<SimInterpreter>,
    pub engine: Arc<Engine>,
    _serial: MutexGuard<'static, ()>,
}

impl Harness {
    pub fn attach(domain: Arc<dyn Domain>) -> Self {
        Self::attach_with(domain, BridgeConfig::default())
    }

    pub fn attach_with(domain: Arc<dyn Domain>, config: BridgeConfig) -> Self {
        let serial = SERIAL.lock();
        let _ = Engine::shutdown(ShutdownMode::Normal);
        let sim = SimInterpreter::with_defaults().expect("simulated interpreter");
        let engine = Engine::initialize(sim.clone(), domain, config).expect("attach");
        Self {
            sim,
            engine,
            _serial: serial,
        }
    }

    /// Stash, detach and re-attach `domain` on the same interpreter.
    pub fn reload(&mut self, domain: Arc<dyn Domain>) -> (StashStats, Option<RestoreStats>) {
        self.reload_with(domain, BridgeConfig::default())
    }

    pub fn reload_with(&mut self, domain: Arc<dyn Domain>, config: BridgeConfig) -> (StashStats, Option<RestoreStats>) {
        let stashed = Engine::shutdown(ShutdownMode::Reload)
            .expect("stash")
            .expect("reload produces stash statistics");
        self.engine = Engine::initialize(self.sim.clone(), domain, config).expect("re-attach");
        (stashed, self.engine.last_restore())
    }

    pub fn wrap(&self, instance: &ManagedRef) -> OwnedRef {
        self.engine.wrap(instance).expect("wrap")
    }

    /// Call a native callable with managed arguments, through the native surface.
    pub fn call(&self, callable: BorrowedRef<'_>, args: &[Value]) -> NativeResult<OwnedRef> {
        let args = tuple_from_values(&self.engine, args).expect("argument tuple");
        self.sim.object_call(callable, args.borrow())
    }

    /// Call a method by attribute lookup, as `ob.name(*args)` would.
    pub fn call_method(&self, ob: BorrowedRef<'_>, name: &str, args: &[Value]) -> NativeResult<OwnedRef> {
        let method = self.sim.object_get_attr(ob, name)?;
        self.call(method.borrow(), args)
    }

    pub fn int(&self, ob: &OwnedRef) -> i64 {
        self.sim.long_as_i64(ob.borrow()).expect("int result")
    }

    pub fn text(&self, ob: &OwnedRef) -> String {
        self.sim.unicode_as_string(ob.borrow()).expect("str result")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = Engine::shutdown(ShutdownMode::Normal);
    }
}
