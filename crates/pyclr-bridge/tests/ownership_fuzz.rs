//! Random sequences of wrap, copy, drop and attribute access must leave no
//! bridge object or native allocation behind.

mod common;

use common::{domain_v1, Counter, Harness, COUNTER};
use pretty_assertions::assert_eq;
use pyclr_bridge::{ManagedRef, TypeName, Value};
use pyclr_native::gil::GilGuard;
use pyclr_native::{NativeApi, OwnedRef};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const STEPS: usize = 2_000;

fn run(seed: u64) {
    let harness = Harness::attach(domain_v1());
    let _gil = GilGuard::acquire().unwrap();
    harness.engine.project(&TypeName::parse(COUNTER)).unwrap();
    let baseline = harness.sim.live_objects();

    let mut rng = StdRng::seed_from_u64(seed);
    let counters: Vec<ManagedRef> = (0..4).map(Counter::create).collect();
    let mut objects: Vec<OwnedRef> = Vec::new();
    let mut bound: Vec<OwnedRef> = Vec::new();

    for _ in 0..STEPS {
        match rng.gen_range(0..6) {
            0 => {
                let counter = &counters[rng.gen_range(0..counters.len())];
                objects.push(harness.wrap(counter));
            }
            1 if !objects.is_empty() => {
                let copy = objects[rng.gen_range(0..objects.len())].borrow().to_owned();
                objects.push(copy);
            }
            2 if !objects.is_empty() => {
                let index = rng.gen_range(0..objects.len());
                drop(objects.swap_remove(index));
            }
            3 if !objects.is_empty() => {
                let object = &objects[rng.gen_range(0..objects.len())];
                bound.push(harness.sim.object_get_attr(object.borrow(), "Add").unwrap());
            }
            4 if !bound.is_empty() => {
                let method = &bound[rng.gen_range(0..bound.len())];
                let result = harness.call(method.borrow(), &[Value::Int(1)]).unwrap();
                assert!(harness.int(&result) > 0);
            }
            5 if !bound.is_empty() => {
                let index = rng.gen_range(0..bound.len());
                drop(bound.swap_remove(index));
            }
            _ => {}
        }
        assert!(harness.engine.live_instances() <= counters.len());
    }

    drop(objects);
    drop(bound);
    assert_eq!(harness.engine.live_bridges(), 0, "seed {seed}");
    assert_eq!(harness.sim.live_objects(), baseline, "seed {seed}");
}

#[test]
fn test_random_ownership_sequences_balance() {
    for seed in [1, 7, 42, 1337] {
        run(seed);
    }
}
