use std::cell::Cell;
use std::rc::Rc;
use std::{thread, time};

use super::Instant;

/// Source of time, and what to do while there's nothing to run.
///
/// Implementations must not call back into the scheduler.
pub trait Clock {
    /// Monotonic, never goes backwards.
    fn now(&self) -> Instant;

    /// Every fiber sleeps until at least `deadline`, block the thread until then.
    /// Returning early is fine, the scheduler calls again.
    fn idle(&self, deadline: Instant);

    /// Only fibers polling a condition can run, the next timed event is at `deadline`.
    /// Does nothing by default, polling fibers observe time as it passes.
    fn polling(&self, deadline: Option<Instant>) {
        let _ = deadline;
    }
}

/// Wall clock based on [`std::time::Instant`], counting from its creation.
#[derive(Debug, Copy, Clone)]
pub struct SystemClock {
    origin: time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let micros = self.origin.elapsed().as_micros();
        Instant::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    fn idle(&self, deadline: Instant) {
        let remaining = deadline - self.now();
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same time, so keep one to [`advance`](SimulatedClock::advance) it
/// after handing another to [`Config::clock`](crate::runtime::Config::clock).
/// Idling and polling jump straight to the deadline.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    now: Rc<Cell<Instant>>,
}

impl SimulatedClock {
    /// Starts at [`Instant::ZERO`].
    pub fn new() -> Self {
        SimulatedClock::default()
    }

    pub fn advance(&self, duration: time::Duration) {
        self.now.set(self.now.get() + duration);
    }

    /// Moves forward to `instant`, never backwards.
    pub fn set(&self, instant: Instant) {
        self.now.set(self.now.get().max(instant));
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn idle(&self, deadline: Instant) {
        self.set(deadline);
    }

    fn polling(&self, deadline: Option<Instant>) {
        if let Some(deadline) = deadline {
            self.set(deadline);
        }
    }
}
