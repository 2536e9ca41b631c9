//! Non-blocking timers, checked from a poll loop or a plain `while`.

use std::time::Duration;

use super::{now, Instant};

/// Observable state of a [`Timeout`] or [`PeriodicTimer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    /// Counting towards its deadline.
    Armed,
    /// Deadline has passed.
    Expired,
}

/// Expires once, a fixed duration after it was started.
///
/// ```
/// use std::time::Duration;
/// use strand::time::Timeout;
///
/// let mut timeout = Timeout::started(Duration::from_millis(1));
/// while !timeout.execute() {
///     strand::this_fiber::yield_now();
/// }
/// assert!(timeout.is_expired());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Timeout {
    duration: Duration,
    deadline: Option<Instant>,
    executed: bool,
}

impl Timeout {
    /// Stopped, until [`Timeout::start`].
    pub fn new() -> Self {
        Timeout::default()
    }

    pub fn started(duration: Duration) -> Self {
        let mut timeout = Timeout::new();
        timeout.start(duration);
        timeout
    }

    /// Arms the timeout to expire `duration` from now, replacing any previous deadline.
    pub fn start(&mut self, duration: Duration) {
        self.duration = duration;
        self.deadline = Some(now() + duration);
        self.executed = false;
    }

    /// Starts again with the most recent duration.
    pub fn restart(&mut self) {
        self.start(self.duration);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
        self.executed = false;
    }

    pub fn state(&self) -> TimerState {
        match self.deadline {
            None => TimerState::Stopped,
            Some(deadline) if now() >= deadline => TimerState::Expired,
            Some(_) => TimerState::Armed,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state() == TimerState::Armed
    }

    pub fn is_expired(&self) -> bool {
        self.state() == TimerState::Expired
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TimerState::Stopped
    }

    /// Time left until expiry, zero unless armed.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline - now(),
            None => Duration::ZERO,
        }
    }

    /// True exactly once per start, on the first call after the deadline has passed.
    pub fn execute(&mut self) -> bool {
        if self.executed || !self.is_expired() {
            return false;
        }

        self.executed = true;
        true
    }
}

/// Fires every period, with deadlines advancing from the previous deadline rather than from when it was checked.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    period: Duration,
    deadline: Option<Instant>,
}

impl PeriodicTimer {
    /// Armed, first fires one period from now.
    pub fn new(period: Duration) -> Self {
        PeriodicTimer {
            period,
            deadline: Some(now() + period),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Re-arms one period from now.
    pub fn restart(&mut self) {
        self.deadline = Some(now() + self.period);
    }

    /// Re-arms one new period from now.
    pub fn restart_with(&mut self, period: Duration) {
        self.period = period;
        self.restart();
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn state(&self) -> TimerState {
        match self.deadline {
            None => TimerState::Stopped,
            Some(deadline) if now() >= deadline => TimerState::Expired,
            Some(_) => TimerState::Armed,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state() == TimerState::Armed
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TimerState::Stopped
    }

    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline - now(),
            None => Duration::ZERO,
        }
    }

    /// Number of periods that elapsed since the last call, zero if the deadline hasn't passed yet.
    /// More than one means some were missed.
    pub fn execute(&mut self) -> usize {
        let Some(deadline) = self.deadline else {
            return 0;
        };
        let now = now();
        if now < deadline {
            return 0;
        }

        let period = self.period.as_micros();
        if period == 0 {
            self.deadline = Some(now);
            return 1;
        }

        let missed = (now - deadline).as_micros() / period;
        let count = usize::try_from(missed + 1).unwrap_or(usize::MAX);
        let elapsed = u64::try_from(period * (missed + 1)).unwrap_or(u64::MAX);
        self.deadline = Some(Instant::from_micros(deadline.as_micros().saturating_add(elapsed)));

        count
    }
}
