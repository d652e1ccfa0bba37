//! Interpreter Lock Discipline
//!
//! Exactly one OS thread executes native code at a time. This module tracks
//! the per-thread lock state and wraps the native acquire/release calls.
//!
//! ## Background
//!
//! The native lock is process-wide and re-entrant per thread. The bridge has
//! to:
//!
//! 1. Hold the lock for every refcount change and registry mutation
//! 2. Release it around long managed-only work so other threads can run
//! 3. Pair every acquisition with exactly one release, on every exit path
//!
//! ## Strategies
//!
//! - **GilGuard**: scoped acquisition, released on drop
//! - **acquire_lock / release_lock**: explicit counted tokens
//! - **AllowThreads**: bracket that gives the lock up and takes it back
//! - **GilState**: thread-local tracking used by the debug assertions

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::api::{self, GilToken, NativeApi, ThreadStateToken};
use crate::error::{ExceptionKind, NativeResult};
use crate::finalizer::Finalizer;

// ============================================================================
// Lock State Tracking
// ============================================================================

/// Counter for lock acquisitions (for debugging)
static GIL_ACQUIRE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Thread-local lock hold count
    static GIL_DEPTH: Cell<usize> = const { Cell::new(0) };

    /// Thread-local flag for whether this thread holds the lock
    static GIL_HELD: Cell<bool> = const { Cell::new(false) };
}

/// Lock state of the current OS thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GilState {
    /// The thread does not hold the lock
    NoGil,
    /// The thread holds the lock
    HasGil,
}

impl GilState {
    /// Get the current lock state for this thread
    pub fn current() -> Self {
        if Self::is_held() {
            GilState::HasGil
        } else {
            GilState::NoGil
        }
    }

    /// Check if the lock is currently held
    pub fn is_held() -> bool {
        GIL_HELD.with(|held| held.get())
    }

    /// Get the current nesting depth
    pub fn depth() -> usize {
        GIL_DEPTH.with(|depth| depth.get())
    }
}

impl fmt::Display for GilState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GilState::NoGil => write!(f, "NoGIL"),
            GilState::HasGil => write!(f, "HasGIL"),
        }
    }
}

fn enter() {
    GIL_DEPTH.with(|depth| depth.set(depth.get() + 1));
    GIL_HELD.with(|held| held.set(true));
    GIL_ACQUIRE_COUNT.fetch_add(1, Ordering::Relaxed);
}

fn leave() {
    GIL_DEPTH.with(|depth| {
        let new_depth = depth.get().saturating_sub(1);
        depth.set(new_depth);
        if new_depth == 0 {
            GIL_HELD.with(|held| held.set(false));
        }
    });
}

/// Assert that the calling thread holds the lock.
///
/// Lock-discipline violations are consumer bugs; debug builds panic.
#[track_caller]
#[inline]
pub fn assert_held(context: &str) {
    debug_assert!(
        GilState::is_held(),
        "lock discipline violation: {context} requires the interpreter lock"
    );
}

// ============================================================================
// Counted tokens
// ============================================================================

/// Token returned by [`acquire_lock`]; pass it back to [`release_lock`].
#[derive(Debug)]
#[must_use = "the lock stays held until the token is released"]
pub struct LockToken {
    native: GilToken,
    _marker: PhantomData<*mut ()>,
}

/// Block until this thread holds the lock. Re-entrant.
pub fn acquire_lock() -> NativeResult<LockToken> {
    let native = api::get()?;
    let token = native.gil_ensure();
    enter();
    Ok(LockToken {
        native: token,
        _marker: PhantomData,
    })
}

/// Release one acquisition made by [`acquire_lock`].
pub fn release_lock(token: LockToken) {
    leave();
    if let Some(native) = api::try_get() {
        native.gil_release(token.native);
    }
}

// ============================================================================
// GilGuard - scoped acquisition
// ============================================================================

/// Scoped lock acquisition.
///
/// Acquires when created, releases when dropped, including during unwinding.
///
/// # Example
///
/// ```ignore
/// let gil = GilGuard::acquire()?;
/// let value = gil.api().long_from_i64(5)?;
/// // released when `gil` drops
/// ```
pub struct GilGuard {
    native: Arc<dyn NativeApi>,
    token: GilToken,
    nested: bool,
    /// Marker to prevent Send/Sync
    _marker: PhantomData<*mut ()>,
}

impl GilGuard {
    /// Acquire through the installed interpreter.
    pub fn acquire() -> NativeResult<Self> {
        Ok(Self::acquire_with(api::get()?))
    }

    /// Acquire through a specific interpreter surface.
    ///
    /// An outermost acquisition also drains the pending-release queue when it
    /// has grown past its threshold.
    pub fn acquire_with(native: Arc<dyn NativeApi>) -> Self {
        let nested = GilState::is_held();
        let token = native.gil_ensure();
        enter();
        // queued releases belong to the installed interpreter
        if !nested && api::is_current(&native) {
            Finalizer::global().throttled_collect(native.as_ref());
        }
        Self {
            native,
            token,
            nested,
            _marker: PhantomData,
        }
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.native
    }

    /// Check if this is a nested acquisition
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Run `f` with the lock released, re-acquiring afterwards.
    pub fn allow_threads<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _bracket = AllowThreads::begin_with(Arc::clone(&self.native));
        f()
    }
}

impl Drop for GilGuard {
    fn drop(&mut self) {
        leave();
        self.native.gil_release(self.token);
    }
}

impl fmt::Debug for GilGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GilGuard")
            .field("token", &self.token)
            .field("nested", &self.nested)
            .finish()
    }
}

// ============================================================================
// AllowThreads - lock released around managed-only work
// ============================================================================

/// Bracket with the lock given up.
///
/// Ending the bracket (or dropping it) re-acquires the lock and restores the
/// thread's nesting depth.
#[must_use = "the lock is re-acquired when the bracket ends"]
pub struct AllowThreads {
    native: Arc<dyn NativeApi>,
    saved: Option<(ThreadStateToken, usize)>,
    _marker: PhantomData<*mut ()>,
}

impl AllowThreads {
    fn begin_with(native: Arc<dyn NativeApi>) -> Self {
        let saved = if GilState::is_held() {
            let depth = GilState::depth();
            let state = native.save_thread();
            GIL_DEPTH.with(|d| d.set(0));
            GIL_HELD.with(|held| held.set(false));
            Some((state, depth))
        } else {
            None
        };
        Self {
            native,
            saved,
            _marker: PhantomData,
        }
    }

    /// Re-acquire the lock.
    pub fn end(self) {}
}

impl Drop for AllowThreads {
    fn drop(&mut self) {
        if let Some((state, depth)) = self.saved.take() {
            self.native.restore_thread(state);
            GIL_DEPTH.with(|d| d.set(depth));
            GIL_HELD.with(|held| held.set(true));
        }
    }
}

/// Give the lock up so other threads can run native code.
pub fn begin_allow_threads() -> NativeResult<AllowThreads> {
    Ok(AllowThreads::begin_with(api::get()?))
}

/// Take the lock back after [`begin_allow_threads`].
pub fn end_allow_threads(bracket: AllowThreads) {
    bracket.end()
}

/// Run `f` with the lock released.
pub fn allow_threads<F, T>(f: F) -> NativeResult<T>
where
    F: FnOnce() -> T,
{
    let _bracket = begin_allow_threads()?;
    Ok(f())
}

// ============================================================================
// Native entry
// ============================================================================

/// Marks the current thread as holding the lock while native code calls in.
///
/// Native callers of type slots always hold the lock; this keeps the
/// thread-local state consistent with that for the duration of the call.
pub struct NativeEntry {
    marked: bool,
    _marker: PhantomData<*mut ()>,
}

pub fn enter_from_native() -> NativeEntry {
    let marked = !GilState::is_held();
    if marked {
        GIL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        GIL_HELD.with(|held| held.set(true));
    }
    NativeEntry {
        marked,
        _marker: PhantomData,
    }
}

impl Drop for NativeEntry {
    fn drop(&mut self) {
        if self.marked {
            leave();
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Native id of the calling thread, for [`interrupt`].
pub fn native_thread_id() -> NativeResult<u64> {
    Ok(api::get()?.thread_id())
}

/// Post a keyboard interrupt to a native thread.
///
/// Best effort: the target unwinds at its next safe point. Returns whether a
/// thread with that id was found.
pub fn interrupt(thread_id: u64) -> NativeResult<bool> {
    let native = api::get()?;
    assert_held("interrupt");
    let affected = native.set_async_exc(thread_id, ExceptionKind::KeyboardInterrupt);
    debug!(thread_id, affected, "posted interrupt");
    Ok(affected > 0)
}

// ============================================================================
// Debug Utilities
// ============================================================================

/// Get statistics about lock usage (for debugging).
pub fn gil_stats() -> GilStats {
    GilStats {
        total_acquires: GIL_ACQUIRE_COUNT.load(Ordering::Relaxed),
        current_depth: GilState::depth(),
        is_held: GilState::is_held(),
    }
}

/// Lock usage statistics.
#[derive(Debug, Clone)]
pub struct GilStats {
    /// Total number of acquisitions in this process
    pub total_acquires: u64,
    /// Current nesting depth on this thread
    pub current_depth: usize,
    /// Whether this thread holds the lock
    pub is_held: bool,
}

impl fmt::Display for GilStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GIL Stats: acquires={}, depth={}, held={}",
            self.total_acquires, self.current_depth, self.is_held
        )
    }
}
