//! Operations on the calling fiber.
//!
//! Every function also works outside of a fiber, on the thread's original stack:
//! yielding does nothing, sleeping idles the clock and polling spins.
//! That lets drivers initialize hardware before the scheduler runs.

use std::hint;
use std::time::Duration;

use crate::runtime::{self, FiberId, State};
use crate::time::{self, Instant};

/// Lets every other ready fiber run once before continuing.
pub fn yield_now() {
    runtime::suspend(State::Ready, None);
}

/// Suspends for at least `duration`.
pub fn sleep_for(duration: Duration) {
    sleep_until(time::now() + duration);
}

/// Suspends until at least `deadline`, returns immediately if it already passed.
pub fn sleep_until(deadline: Instant) {
    if time::now() >= deadline {
        return;
    }

    if !runtime::suspend(State::Sleeping, Some(deadline)) {
        let clock = runtime::clock();
        while clock.now() < deadline {
            clock.idle(deadline);
        }
    }
}

/// Suspends until `condition` holds, re-evaluating it once per scheduling round.
/// Returns immediately if it already holds.
pub fn poll(mut condition: impl FnMut() -> bool) {
    while !condition() {
        if !runtime::suspend(State::Blocked, None) {
            hint::spin_loop();
        }
    }
}

/// Like [`poll`], but gives up after `duration`.
/// Returns whether the condition held.
pub fn poll_for(duration: Duration, condition: impl FnMut() -> bool) -> bool {
    poll_until(time::now() + duration, condition)
}

/// Like [`poll`], but gives up at `deadline`.
/// Returns whether the condition held.
pub fn poll_until(deadline: Instant, mut condition: impl FnMut() -> bool) -> bool {
    loop {
        if condition() {
            return true;
        }
        if time::now() >= deadline {
            return false;
        }

        if !runtime::suspend(State::Blocked, Some(deadline)) {
            hint::spin_loop();
        }
    }
}

/// Identifier of the calling fiber, [`FiberId::MAIN`] outside of a fiber.
pub fn id() -> FiberId {
    runtime::current().unwrap_or(FiberId::MAIN)
}

/// Whether [`Fiber::request_stop`](crate::Fiber::request_stop) was called on the calling fiber since it last started.
pub fn stop_requested() -> bool {
    runtime::stop_requested()
}
