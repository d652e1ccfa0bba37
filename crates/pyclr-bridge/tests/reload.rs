//! Reload: stashing the bridge graph in the interpreter, detaching, and
//! restoring it against a new generation of the managed domain.

mod common;

use std::sync::Arc;

use common::{domain_renamed, domain_v1, domain_without_bag, Bag, Counter, Harness, Vector, BAG, COUNTER};
use pretty_assertions::assert_eq;
use pyclr_bridge::{downcast, stash, BridgeConfig, BridgeError, Engine, ManagedRef, ShutdownMode, Value};
use pyclr_native::gil::GilGuard;
use pyclr_native::{ExceptionKind, NativeApi};

#[test]
fn test_reload_keeps_objects_and_type_identity() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let object = harness.wrap(&Counter::create(7));
    let type_before = harness.sim.type_of(object.borrow()).addr();

    let (stashed, restored) = harness.reload(domain_v1());
    assert_eq!(stashed.objects, 1);
    assert_eq!(stashed.instances, 1);
    assert_eq!(stashed.placeholders, 0);
    assert!(stashed.bytes > 0);
    let restored = restored.expect("stash restored on attach");
    assert_eq!(restored.objects, 1);
    assert_eq!(restored.tombstoned_types, 0);
    assert_eq!(restored.tombstoned_instances, 0);

    assert_eq!(harness.sim.type_of(object.borrow()).addr(), type_before);
    let value = harness.sim.object_get_attr(object.borrow(), "Value").unwrap();
    assert_eq!(harness.int(&value), 7);
    let back = harness.engine.unwrap(object.borrow()).unwrap().unwrap();
    assert_eq!(downcast::<Counter>(&back).unwrap().value(), 7);
    assert!(!stash::has_stash(harness.sim.as_ref(), &harness.engine.config().stash_slot));
}

#[test]
fn test_renamed_member_becomes_tombstone() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let object = harness.wrap(&Counter::create(7));
    let bound = harness.sim.object_get_attr(object.borrow(), "M").unwrap();

    let (_, restored) = harness.reload(domain_renamed());
    let restored = restored.unwrap();
    assert_eq!(restored.tombstoned_members, 1);

    let err = harness.call(bound.borrow(), &[]).unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::RuntimeError));
    assert!(err.to_string().contains("The managed member Demo.Counter.M no longer exists"));

    let constant = harness.call_method(object.borrow(), "N", &[]).unwrap();
    assert_eq!(harness.int(&constant), 5);
    let value = harness.sim.object_get_attr(object.borrow(), "Value").unwrap();
    assert_eq!(harness.int(&value), 7);

    let err = harness.call_method(object.borrow(), "M", &[]).unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::AttributeError));
}

#[test]
fn test_removed_type_becomes_tombstone() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let bag = harness.wrap(&Bag::create(vec![1, 2]));
    let counter = harness.wrap(&Counter::create(1));

    let (_, restored) = harness.reload(domain_without_bag());
    let restored = restored.unwrap();
    assert_eq!(restored.tombstoned_types, 1);
    assert_eq!(restored.objects, 2);

    let err = harness.sim.object_get_attr(bag.borrow(), "Count").unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::RuntimeError));
    assert!(err.to_string().contains(&format!("The managed type {BAG} no longer exists")));
    let err = harness.sim.object_length(bag.borrow()).unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::RuntimeError));

    let descriptor = harness.engine.types().get(&pyclr_bridge::TypeName::parse(BAG)).unwrap();
    assert!(descriptor.is_tombstone());
    assert!(matches!(descriptor.check_live(), Err(BridgeError::TypeTombstoned { .. })));

    // the rest of the graph is unaffected
    let doubled = harness.sim.object_get_attr(counter.borrow(), "Doubled").unwrap();
    assert_eq!(harness.int(&doubled), 2);
}

#[test]
fn test_unserializable_instance_becomes_tombstone() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let vector = harness.wrap(&Vector::create(4));

    let (stashed, restored) = harness.reload(domain_v1());
    assert_eq!(stashed.placeholders, 1);
    assert_eq!(restored.unwrap().tombstoned_instances, 1);

    let err = harness.engine.unwrap(vector.borrow()).err().unwrap();
    assert!(matches!(err, BridgeError::InstanceTombstoned { .. }));
    let err = harness.sim.object_get_attr(vector.borrow(), "X").unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::RuntimeError));
    assert!(err.to_string().contains("The managed instance of Demo.Vector no longer exists"));

    // new instances of the same type work normally
    let fresh = harness.wrap(&Vector::create(9));
    let x = harness.sim.object_get_attr(fresh.borrow(), "X").unwrap();
    assert_eq!(harness.int(&x), 9);
}

#[test]
fn test_object_freed_while_detached_is_dropped() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let kept = harness.wrap(&Counter::create(1));
    let doomed = harness.wrap(&Counter::create(2));

    let stashed = Engine::shutdown(ShutdownMode::Reload).unwrap().unwrap();
    assert_eq!(stashed.objects, 2);
    drop(doomed);
    harness.engine = Engine::initialize(harness.sim.clone(), domain_v1(), BridgeConfig::default()).unwrap();

    let restored = harness.engine.last_restore().unwrap();
    assert_eq!(restored.dropped_objects, 1);
    assert_eq!(restored.objects, 1);
    assert_eq!(harness.engine.live_bridges(), 1);
    let value = harness.sim.object_get_attr(kept.borrow(), "Value").unwrap();
    assert_eq!(harness.int(&value), 1);
}

#[test]
fn test_restore_can_be_disabled() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let object = harness.wrap(&Counter::create(1));

    let config = BridgeConfig::default().with_restore_on_attach(false);
    let (_, restored) = harness.reload_with(domain_v1(), config);
    assert_eq!(restored, None);
    assert!(!stash::has_stash(harness.sim.as_ref(), &harness.engine.config().stash_slot));
    assert_eq!(harness.engine.live_bridges(), 0);

    let err = harness.sim.object_get_attr(object.borrow(), "Value").unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::RuntimeError));
    assert!(err.to_string().contains(&format!("The managed type {COUNTER} no longer exists")));
}

#[test]
fn test_imports_and_generics_survive_reload() {
    let mut harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    harness.engine.import_namespace("Demo").unwrap();
    let generics = harness.engine.generic_names();

    let (_, restored) = harness.reload(domain_without_bag());
    assert_eq!(restored.unwrap().namespaces, 1);
    assert!(harness.engine.is_imported("Demo"));
    assert_eq!(harness.engine.generic_names(), generics);
}

#[test]
fn test_shared_instance_is_stashed_once() {
    let mut harness = Harness::attach_with(domain_v1(), BridgeConfig::default().with_identity_cache(false));
    let _gil = GilGuard::acquire().unwrap();
    let counter: ManagedRef = Counter::create(3);
    let first = harness.wrap(&counter);
    let second = harness.wrap(&counter);
    let bound = harness.sim.object_get_attr(first.borrow(), "Add").unwrap();

    let (stashed, restored) = harness.reload(domain_v1());
    assert_eq!(stashed.objects, 3);
    assert_eq!(stashed.instances, 1);
    assert_eq!(restored.unwrap().objects, 3);

    // all three share one restored instance
    harness.call(bound.borrow(), &[Value::Int(4)]).unwrap();
    let a = harness.engine.unwrap(first.borrow()).unwrap().unwrap();
    let b = harness.engine.unwrap(second.borrow()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(downcast::<Counter>(&a).unwrap().value(), 7);
}

#[test]
fn test_every_handle_to_a_removed_type_becomes_tombstone() {
    let config = BridgeConfig::default().with_identity_cache(false);
    let mut harness = Harness::attach_with(domain_v1(), config.clone());
    let _gil = GilGuard::acquire().unwrap();
    let bag: ManagedRef = Bag::create(vec![5]);
    let first = harness.wrap(&bag);
    let second = harness.wrap(&bag);
    assert_ne!(first.addr(), second.addr());

    let (stashed, restored) = harness.reload_with(domain_without_bag(), config);
    assert_eq!(stashed.objects, 2);
    assert_eq!(stashed.instances, 1);
    let restored = restored.unwrap();
    assert_eq!(restored.tombstoned_types, 1);
    assert_eq!(restored.objects, 2);

    for handle in [&first, &second] {
        let err = harness.sim.object_get_attr(handle.borrow(), "Count").unwrap_err();
        assert!(err.is_exception_of(ExceptionKind::RuntimeError));
        assert!(err.to_string().contains(&format!("The managed type {BAG} no longer exists")));
    }
    assert!(!harness.sim.err_occurred());
}
