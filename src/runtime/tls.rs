//! Thread local storage for the scheduler.
//!
//! Each thread stands in for one hardware core and gets its own independent scheduler.
//! Easy switch to fast thread local.

use std::cell::RefCell;

use super::{Config, RuntimeState};

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<Option<RuntimeState>>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Created on first use, lives until the thread exits.
    static RUNTIME: Runtime = const { Runtime(RefCell::new(None)) };
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static RUNTIME: Runtime = Runtime(RefCell::new(None));

/// Creates this thread's scheduler with the given configuration.
pub(super) fn initialize(config: Config) -> crate::Result<()> {
    with_cell(|cell| {
        if cell.is_some() {
            return Err(crate::Error::AlreadyInitialized);
        }

        *cell = Some(RuntimeState::new(config));
        Ok(())
    })
}

/// Borrow this thread's scheduler, creating it with the default configuration if necessary.
///
/// # Panics
/// If called re-entrantly, the borrow must end before any context switch.
pub(super) fn runtime<T>(f: impl FnOnce(&mut RuntimeState) -> T) -> T {
    with_cell(|cell| {
        let runtime = cell.get_or_insert_with(|| RuntimeState::new(Config::default()));
        f(runtime)
    })
}

/// Borrow this thread's scheduler only if it exists and isn't already borrowed or torn down.
pub(super) fn try_runtime<T>(f: impl FnOnce(&mut RuntimeState) -> T) -> Option<T> {
    try_with_cell(|cell| cell.as_mut().map(f)).flatten()
}

#[cfg(not(feature = "fast_thread_local"))]
fn with_cell<T>(f: impl FnOnce(&mut Option<RuntimeState>) -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        f(&mut cell)
    })
}

#[cfg(feature = "fast_thread_local")]
fn with_cell<T>(f: impl FnOnce(&mut Option<RuntimeState>) -> T) -> T {
    let mut cell = RUNTIME.0.borrow_mut();
    f(&mut cell)
}

#[cfg(not(feature = "fast_thread_local"))]
fn try_with_cell<T>(f: impl FnOnce(&mut Option<RuntimeState>) -> T) -> Option<T> {
    RUNTIME
        .try_with(|thread_local| {
            let mut cell = thread_local.0.try_borrow_mut().ok()?;
            Some(f(&mut cell))
        })
        .ok()
        .flatten()
}

#[cfg(feature = "fast_thread_local")]
fn try_with_cell<T>(f: impl FnOnce(&mut Option<RuntimeState>) -> T) -> Option<T> {
    let mut cell = RUNTIME.0.try_borrow_mut().ok()?;
    Some(f(&mut cell))
}
