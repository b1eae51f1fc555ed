//! Hooks for observing the registry from tests.
//!
//! The counters are thread-local. Tests that rely on them should run on a
//! current-thread runtime.

use std::cell::Cell;

thread_local! {
    static LAST_WAS_HIT: Cell<bool> = const { Cell::new(false) };
    static COMPUTATIONS: Cell<usize> = const { Cell::new(0) };
}

/// Whether the last memoized call on this thread returned a cached instance.
pub fn last_was_hit() -> bool {
    LAST_WAS_HIT.get()
}

/// How many computations have settled on this thread.
pub fn computations() -> usize {
    COMPUTATIONS.get()
}

pub(crate) fn register_hit() {
    LAST_WAS_HIT.set(true);
}

pub(crate) fn register_miss() {
    LAST_WAS_HIT.set(false);
    COMPUTATIONS.set(COMPUTATIONS.get() + 1);
}
