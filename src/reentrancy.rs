//! Debug-only reentrancy guard.
//!
//! Segment locks are not reentrant. User code that runs while a segment is
//! locked (`K: Eq`, value comparisons, lazy constructors) must not call back
//! into the same map, or the thread deadlocks on itself. In debug builds
//! each thread records which maps it currently has a segment of locked and
//! entering one of them again panics instead. In release builds this
//! compiles to a zero-cost no-op.

use core::marker::PhantomData;
#[cfg(debug_assertions)]
use std::cell::RefCell;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

#[cfg(debug_assertions)]
thread_local! {
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Per-map reentrancy tracker. Every segment of a map carries a copy; guard
/// lock acquisitions with `let _g = self.reentrancy.enter();`.
#[derive(Debug, Clone)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    id: usize,
    _z: PhantomData<()>,
}

impl DebugReentrancy {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            _z: PhantomData,
        }
    }

    /// Enter a guarded section. In debug builds, panics if this thread is
    /// already inside one for the same map.
    #[inline]
    pub(crate) fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        let guard = {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                assert!(
                    !held.contains(&self.id),
                    "reentrancy detected: segment lock already held by this thread"
                );
                held.push(self.id);
            });
            ReentrancyGuard { owner: self }
        };

        #[cfg(not(debug_assertions))]
        let guard = ReentrancyGuard { _z: PhantomData };

        guard
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub(crate) struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let id = self.owner.id;
            // Runs during unwinding as well; never panic here.
            let _ = HELD.try_with(|held| {
                if let Ok(mut held) = held.try_borrow_mut() {
                    if let Some(pos) = held.iter().rposition(|&h| h == id) {
                        held.swap_remove(pos);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DebugReentrancy;

    #[test]
    fn enter_and_exit_is_ok() {
        let r = DebugReentrancy::new();
        {
            let _g = r.enter();
        }
        let _g = r.enter();
    }

    #[test]
    fn distinct_maps_may_nest() {
        let a = DebugReentrancy::new();
        let b = DebugReentrancy::new();
        let _ga = a.enter();
        let _gb = b.enter();
    }

    #[test]
    fn guard_is_per_thread() {
        let r = DebugReentrancy::new();
        let _g = r.enter();
        std::thread::scope(|s| {
            s.spawn(|| {
                let _g = r.enter();
            });
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_in_debug() {
        let r = DebugReentrancy::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g1 = r.enter();
            let _g2 = r.enter();
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
        // The unwound guard released its slot.
        let _g = r.enter();
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn reentrancy_noop_in_release() {
        let r = DebugReentrancy::new();
        let _g1 = r.enter();
        let _g2 = r.enter();
    }
}
