//! Monotonic time as seen by the scheduler.
//!
//! All waiting is measured against the [`Clock`] of the thread's scheduler, see [`Config::clock`](crate::runtime::Config::clock).

use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

use crate::runtime;

mod clock;
mod timer;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use timer::{PeriodicTimer, Timeout, TimerState};

/// Point in time, counted in microsecond ticks since the clock's origin.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    /// The clock's origin.
    pub const ZERO: Instant = Instant(0);

    /// Length of one tick.
    pub const TICK: Duration = Duration::from_micros(1);

    pub const fn from_micros(micros: u64) -> Self {
        Instant(micros)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn checked_add(self, duration: Duration) -> Option<Instant> {
        let micros = u64::try_from(duration.as_micros()).ok()?;
        self.0.checked_add(micros).map(Instant)
    }
}

/// Saturates at the end of time, which is never reached.
impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Instant {
        self.checked_add(duration).unwrap_or(Instant(u64::MAX))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, duration: Duration) {
        *self = *self + duration;
    }
}

/// Saturates at the clock's origin.
impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Instant {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_sub(micros))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, earlier: Instant) -> Duration {
        self.duration_since(earlier)
    }
}

/// Current time of this thread's scheduler clock.
pub fn now() -> Instant {
    runtime::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod instant {
        use super::*;

        #[test]
        fn adds_durations_in_ticks() {
            let instant = Instant::ZERO + Duration::from_millis(3);

            assert_eq!(instant.as_micros(), 3000);
        }

        #[test]
        fn truncates_below_tick() {
            let instant = Instant::ZERO + Duration::from_nanos(999);

            assert_eq!(instant, Instant::ZERO);
        }

        #[test]
        fn saturates() {
            let end = Instant::from_micros(u64::MAX);

            assert_eq!(end + Duration::from_secs(1), end);
            assert_eq!(Instant::ZERO - Duration::from_secs(1), Instant::ZERO);
            assert_eq!(Instant::ZERO.checked_add(Duration::MAX), None);
        }

        #[test]
        fn difference() {
            let earlier = Instant::from_micros(100);
            let later = Instant::from_micros(350);

            assert_eq!(later - earlier, Duration::from_micros(250));
            assert_eq!(earlier - later, Duration::ZERO);
        }
    }

    mod now {
        use super::*;
        use std::rc::Rc;

        #[test]
        fn follows_configured_clock() {
            let clock = SimulatedClock::new();
            runtime::configure(runtime::Config {
                clock: Rc::new(clock.clone()),
                ..runtime::Config::default()
            })
            .unwrap();

            clock.advance(Duration::from_millis(42));

            assert_eq!(now(), Instant::from_micros(42_000));
        }

        #[test]
        fn monotonic() {
            let first = now();
            let second = now();

            assert!(second >= first);
        }
    }
}
