//! Pending-release queue.
//!
//! Managed code drops native references on arbitrary threads, often without
//! the interpreter lock. Those releases are queued here and applied the next
//! time a thread collects under the lock.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam_deque::{Injector, Steal};
use tracing::{debug, warn};

use crate::api::{self, NativeApi};
use crate::ffi::PyObject;
use crate::gil::{self, GilState};
use crate::handle::StolenRef;

/// A release owed to the interpreter of a given run.
#[derive(Debug, Clone, Copy)]
struct PendingRelease {
    addr: usize,
    run: u64,
}

/// Queue of deferred reference releases.
pub struct Finalizer {
    queue: Injector<PendingRelease>,
    threshold: AtomicUsize,
    enabled: AtomicBool,
    run: AtomicU64,
    released: AtomicU64,
}

static FINALIZER: OnceLock<Finalizer> = OnceLock::new();

impl Finalizer {
    pub const DEFAULT_THRESHOLD: usize = 200;

    fn new() -> Self {
        Self {
            queue: Injector::new(),
            threshold: AtomicUsize::new(Self::DEFAULT_THRESHOLD),
            enabled: AtomicBool::new(true),
            run: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// The process-wide queue
    pub fn global() -> &'static Finalizer {
        FINALIZER.get_or_init(Finalizer::new)
    }

    pub fn enqueue(&self, ptr: NonNull<PyObject>) {
        self.queue.push(PendingRelease {
            addr: ptr.as_ptr() as usize,
            run: self.run.load(Ordering::Acquire),
        });
    }

    /// Number of queued releases
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Total releases applied by collections in this process
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Apply every queued release. Requires the lock.
    ///
    /// Entries queued during an earlier interpreter run point into memory that
    /// no longer exists and are dropped.
    pub fn collect(&self, native: &dyn NativeApi) -> usize {
        gil::assert_held("finalizer collect");
        let run = self.run.load(Ordering::Acquire);
        let mut released = 0usize;
        let mut stale = 0usize;
        loop {
            match self.queue.steal() {
                Steal::Success(pending) => {
                    if pending.run != run {
                        stale += 1;
                        continue;
                    }
                    if let Some(ptr) = NonNull::new(pending.addr as *mut PyObject) {
                        native.decref(StolenRef::from_non_null(ptr));
                        released += 1;
                    }
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        self.released.fetch_add(released as u64, Ordering::Relaxed);
        if released > 0 || stale > 0 {
            debug!(released, stale, "collected pending releases");
        }
        released
    }

    /// Collect only when enabled and past the threshold.
    pub fn throttled_collect(&self, native: &dyn NativeApi) -> usize {
        if self.is_enabled() && self.pending() >= self.threshold() {
            self.collect(native)
        } else {
            0
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold.max(1), Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Current interpreter run
    pub fn run(&self) -> u64 {
        self.run.load(Ordering::Acquire)
    }

    pub(crate) fn begin_run(&self) -> u64 {
        self.run.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Release one reference now when the lock is held, otherwise queue it.
pub(crate) fn release(ptr: NonNull<PyObject>) {
    if GilState::is_held() {
        match api::try_get() {
            Some(native) => native.decref(StolenRef::from_non_null(ptr)),
            None => warn!(addr = ptr.as_ptr() as usize, "no interpreter installed; reference leaked"),
        }
    } else {
        Finalizer::global().enqueue(ptr);
    }
}
