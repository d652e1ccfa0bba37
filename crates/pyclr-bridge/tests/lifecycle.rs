//! Attach, detach, wrapping and deallocation of bridge objects.

mod common;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{domain_v1, Counter, Harness, COUNTER};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use pyclr_bridge::{BridgeConfig, BridgeError, Engine, InstanceId, ShutdownMode, TypeName};
use pyclr_native::gil::{self, GilGuard};
use pyclr_native::loader::{library_file_name, REQUIRED_SYMBOLS};
use pyclr_native::{
    ExceptionKind, LibraryHandle, LibraryLoader, NativeApi, NativeError, NativeResult, PythonVersion,
};

/// Loader serving one library with a fixed symbol table.
struct FixedLoader {
    library: String,
    symbols: Vec<&'static str>,
    freed: Mutex<Vec<String>>,
}

impl FixedLoader {
    fn new(symbols: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            library: library_file_name(PythonVersion::new(3, 11, 4), false),
            symbols: symbols.to_vec(),
            freed: Mutex::new(Vec::new()),
        })
    }
}

impl LibraryLoader for FixedLoader {
    fn load(&self, name: &str) -> NativeResult<LibraryHandle> {
        if name == self.library {
            Ok(LibraryHandle::named(name))
        } else {
            Err(NativeError::library_load(name, "not found"))
        }
    }

    fn symbol(&self, library: &LibraryHandle, name: &str) -> NativeResult<NonNull<c_void>> {
        if self.symbols.contains(&name) {
            Ok(NonNull::dangling())
        } else {
            Err(NativeError::symbol_not_found(name, library.name()))
        }
    }

    fn free(&self, library: LibraryHandle) {
        self.freed.lock().push(library.name().to_string());
    }
}

#[test]
fn test_attach_is_exclusive() {
    let harness = Harness::attach(domain_v1());
    assert!(Engine::is_attached());
    let again = Engine::initialize(harness.sim.clone(), domain_v1(), BridgeConfig::default());
    assert!(matches!(again, Err(BridgeError::AlreadyAttached)));
    assert_eq!(harness.engine.domain().name(), "v1");
}

#[test]
fn test_shutdown_detaches() {
    let harness = Harness::attach(domain_v1());
    assert_eq!(Engine::shutdown(ShutdownMode::Normal).unwrap(), None);
    assert!(!Engine::is_attached());
    assert!(matches!(Engine::current(), Err(BridgeError::NotAttached)));
    // a second shutdown is a no-op
    assert_eq!(Engine::shutdown(ShutdownMode::Normal).unwrap(), None);
    drop(harness);
}

#[test]
fn test_invalid_config_is_rejected_before_attach() {
    let harness = Harness::attach(domain_v1());
    Engine::shutdown(ShutdownMode::Normal).unwrap();
    let config = BridgeConfig::default().with_stash_slot("not valid");
    let err = Engine::initialize(harness.sim.clone(), domain_v1(), config).unwrap_err();
    assert!(matches!(err, BridgeError::Config { .. }));
    assert!(!Engine::is_attached());
}

#[test]
fn test_wrap_unwrap_round_trip() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let counter = Counter::create(3);

    let object = harness.wrap(&counter);
    assert!(harness.engine.is_bridge(object.borrow()));
    let back = harness.engine.unwrap(object.borrow()).unwrap().unwrap();
    assert_eq!(InstanceId::of(&back), InstanceId::of(&counter));
    assert_eq!(harness.sim.type_name(harness.sim.type_of(object.borrow())), COUNTER);

    let plain = harness.sim.long_from_i64(1).unwrap();
    assert!(!harness.engine.is_bridge(plain.borrow()));
    assert!(harness.engine.unwrap(plain.borrow()).unwrap().is_none());
}

#[test]
fn test_identity_cache_reuses_bridge_object() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let counter = Counter::create(0);

    let first = harness.wrap(&counter);
    let second = harness.wrap(&counter);
    assert_eq!(first.addr(), second.addr());
    assert_eq!(harness.sim.refcount(first.borrow()), 2);
    assert_eq!(harness.engine.live_bridges(), 1);
}

#[test]
fn test_identity_cache_can_be_disabled() {
    let harness = Harness::attach_with(domain_v1(), BridgeConfig::default().with_identity_cache(false));
    let _gil = GilGuard::acquire().unwrap();
    let counter = Counter::create(0);

    let first = harness.wrap(&counter);
    let second = harness.wrap(&counter);
    assert_ne!(first.addr(), second.addr());
    assert_eq!(harness.engine.live_bridges(), 2);
    assert_eq!(harness.engine.live_instances(), 1);
}

#[test]
fn test_last_reference_releases_bridge_and_instance() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let descriptor = harness.engine.project(&TypeName::parse(COUNTER)).unwrap();
    let baseline = harness.sim.live_objects();

    let counter = Counter::create(1);
    let object = harness.wrap(&counter);
    assert_eq!(Arc::strong_count(&counter), 2);
    assert_eq!(harness.sim.live_objects(), baseline + 1);

    drop(object);
    assert_eq!(harness.engine.live_bridges(), 0);
    assert_eq!(Arc::strong_count(&counter), 1);
    assert_eq!(harness.sim.live_objects(), baseline);
    assert!(!descriptor.is_tombstone());
}

#[test]
fn test_weak_bridge_does_not_keep_object_alive() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let object = harness.wrap(&Counter::create(2));

    let weak = harness.engine.downgrade(object.borrow()).unwrap();
    let strong = weak.upgrade().unwrap();
    assert_eq!(strong.addr(), object.addr());
    drop(strong);
    drop(object);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_bridge_objects_outliving_the_engine_fail_cleanly() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let object = harness.wrap(&Counter::create(4));
    let baseline = harness.sim.live_objects();

    Engine::shutdown(ShutdownMode::Normal).unwrap();
    let err = harness.sim.object_get_attr(object.borrow(), "Value").unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::RuntimeError));
    assert!(!harness.sim.err_occurred());

    drop(object);
    assert!(harness.sim.live_objects() < baseline);
}

#[test]
fn test_construct_through_public_constructor() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let name = TypeName::parse(COUNTER);

    let object = harness.engine.construct(&name, &[7i64.into()]).unwrap();
    let value = harness.sim.object_get_attr(object.borrow(), "Value").unwrap();
    assert_eq!(harness.int(&value), 7);

    let err = harness.engine.construct(&name, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::NotSupported { .. }));
}

#[test]
fn test_interrupt_reaches_native_thread() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let me = gil::native_thread_id().unwrap();

    assert!(harness.engine.interrupt(me).unwrap());
    let err = harness.sim.check_signals().unwrap_err();
    assert!(err.is_exception_of(ExceptionKind::KeyboardInterrupt));
}

#[test]
fn test_shutdown_under_the_lock_races_attach_without_deadlock() {
    let harness = Harness::attach(domain_v1());
    let start = Arc::new(Barrier::new(2));
    let (done, finished) = mpsc::channel();

    let detaching = {
        let start = Arc::clone(&start);
        let done = done.clone();
        thread::spawn(move || {
            let _gil = GilGuard::acquire().unwrap();
            start.wait();
            let result = Engine::shutdown(ShutdownMode::Normal);
            done.send(("shutdown", result.is_ok())).unwrap();
        })
    };
    let attaching = {
        let sim = harness.sim.clone();
        thread::spawn(move || {
            start.wait();
            let result = Engine::initialize(sim, domain_v1(), BridgeConfig::default());
            let settled = matches!(result, Ok(_) | Err(BridgeError::AlreadyAttached));
            done.send(("initialize", settled)).unwrap();
        })
    };

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        outcomes.push(finished.recv_timeout(Duration::from_secs(5)).expect("lifecycle calls deadlocked"));
    }
    detaching.join().unwrap();
    attaching.join().unwrap();
    outcomes.sort();
    assert_eq!(outcomes, vec![("initialize", true), ("shutdown", true)]);
    drop(harness);
}

#[test]
fn test_attach_verifies_the_interpreter_library() {
    let harness = Harness::attach(domain_v1());
    Engine::shutdown(ShutdownMode::Normal).unwrap();
    let loader = FixedLoader::new(REQUIRED_SYMBOLS);
    let config = BridgeConfig::default().with_verify_library(true);

    let engine = Engine::initialize_with_loader(harness.sim.clone(), domain_v1(), config, loader.clone()).unwrap();
    assert_eq!(engine.interpreter_library(), Some(loader.library.clone()));
    assert!(loader.freed.lock().is_empty());

    Engine::shutdown(ShutdownMode::Normal).unwrap();
    assert_eq!(engine.interpreter_library(), None);
    assert_eq!(loader.freed.lock().as_slice(), &[loader.library.clone()]);
}

#[test]
fn test_attach_fails_without_required_symbols() {
    let harness = Harness::attach(domain_v1());
    Engine::shutdown(ShutdownMode::Normal).unwrap();
    let loader = FixedLoader::new(&REQUIRED_SYMBOLS[..4]);
    let config = BridgeConfig::default().with_verify_library(true);

    let err = Engine::initialize_with_loader(harness.sim.clone(), domain_v1(), config, loader.clone()).unwrap_err();
    assert!(matches!(err, BridgeError::Native(NativeError::SymbolNotFound { .. })));
    assert!(!Engine::is_attached());
    assert_eq!(loader.freed.lock().len(), 1);
}

#[test]
fn test_attach_fails_for_a_missing_library_path() {
    let harness = Harness::attach(domain_v1());
    Engine::shutdown(ShutdownMode::Normal).unwrap();
    let loader = FixedLoader::new(REQUIRED_SYMBOLS);
    let config = BridgeConfig::default()
        .with_verify_library(true)
        .with_library_path("/missing/lib/libpython3.11.so");

    let err = Engine::initialize_with_loader(harness.sim.clone(), domain_v1(), config, loader).unwrap_err();
    assert!(matches!(err, BridgeError::Native(NativeError::LibraryLoad { .. })));
    assert!(!Engine::is_attached());
}

#[test]
fn test_wrap_during_teardown_is_refused() {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    let engine = Arc::clone(&harness.engine);
    let counter = Counter::create(9);

    Engine::shutdown(ShutdownMode::Normal).unwrap();
    let err = engine.wrap(&counter).unwrap_err();
    assert!(matches!(err, BridgeError::ShuttingDown { .. }));
    assert_eq!(engine.live_bridges(), 0);
    assert_eq!(Arc::strong_count(&counter), 1);
}
