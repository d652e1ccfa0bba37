//! The simulated interpreter lock: process-wide, re-entrant per thread.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use pyclr_native::{GilToken, ThreadStateToken};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

/// Simulated native id of the calling thread
pub fn current_thread() -> u64 {
    THREAD_ID.with(|id| *id)
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<u64>,
    depth: usize,
}

#[derive(Debug, Default)]
pub struct SimGil {
    owner: Mutex<Owner>,
    released: Condvar,
    acquisitions: AtomicU64,
}

impl SimGil {
    pub fn ensure(&self) -> GilToken {
        let me = current_thread();
        let mut owner = self.owner.lock();
        if owner.thread == Some(me) {
            owner.depth += 1;
            return GilToken::Locked;
        }
        while owner.thread.is_some() {
            self.released.wait(&mut owner);
        }
        owner.thread = Some(me);
        owner.depth = 1;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        GilToken::Unlocked
    }

    pub fn release(&self, _token: GilToken) {
        let me = current_thread();
        let mut owner = self.owner.lock();
        if owner.thread != Some(me) {
            tracing::warn!(thread = me, "lock released by a thread that does not hold it");
            return;
        }
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            self.released.notify_one();
        }
    }

    /// Give the lock up entirely, remembering the nesting depth.
    pub fn save(&self) -> ThreadStateToken {
        let me = current_thread();
        let mut owner = self.owner.lock();
        if owner.thread != Some(me) {
            return ThreadStateToken(0);
        }
        let depth = owner.depth;
        owner.thread = None;
        owner.depth = 0;
        self.released.notify_one();
        ThreadStateToken(depth)
    }

    pub fn restore(&self, state: ThreadStateToken) {
        if state.0 == 0 {
            return;
        }
        let me = current_thread();
        let mut owner = self.owner.lock();
        while owner.thread.is_some() {
            self.released.wait(&mut owner);
        }
        owner.thread = Some(me);
        owner.depth = state.0;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_held_by_current(&self) -> bool {
        self.owner.lock().thread == Some(current_thread())
    }

    /// Outermost acquisitions since creation
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reentrant_acquisition() {
        let gil = SimGil::default();
        assert_eq!(gil.ensure(), GilToken::Unlocked);
        assert_eq!(gil.ensure(), GilToken::Locked);
        gil.release(GilToken::Locked);
        assert!(gil.is_held_by_current());
        gil.release(GilToken::Unlocked);
        assert!(!gil.is_held_by_current());
        assert_eq!(gil.acquisitions(), 1);
    }

    #[test]
    fn test_save_and_restore_keep_depth() {
        let gil = SimGil::default();
        let _ = gil.ensure();
        let _ = gil.ensure();
        let saved = gil.save();
        assert_eq!(saved, ThreadStateToken(2));
        assert!(!gil.is_held_by_current());
        gil.restore(saved);
        assert!(gil.is_held_by_current());
        gil.release(GilToken::Locked);
        gil.release(GilToken::Unlocked);
        assert!(!gil.is_held_by_current());
    }
}
