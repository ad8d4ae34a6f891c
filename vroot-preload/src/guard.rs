//! Per-thread re-entry guard.
//!
//! The engine itself calls libc (`readlink`, `getcwd`, `posix_spawn`, ...)
//! and those calls land back in the shims. While a thread holds a
//! [`Guard`], shims forward straight to the real functions.

use std::cell::Cell;

thread_local! {
    /// Set while the thread is inside the engine.
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Held while the current thread runs engine code.
#[derive(Debug)]
pub(crate) struct Guard(());

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|a| a.set(false));
    }
}

/// Enters the engine, or returns `None` if this thread is already inside
/// it or is being torn down.
pub(crate) fn enter() -> Option<Guard> {
    ACTIVE
        .try_with(|a| !a.replace(true))
        .unwrap_or(false)
        .then_some(Guard(()))
}
