//! Handles to registered fibers.

use std::fmt;
use std::marker::PhantomData;

use super::{tls, ClosureSlot, Stack};

/// Uniquely identifies a fiber among those registered on the same thread.
/// Identifiers of removed fibers may be reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(super) usize);

impl FiberId {
    /// Stands in for code running outside of any fiber, on the thread's original stack.
    pub const MAIN: FiberId = FiberId(usize::MAX);
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == FiberId::MAIN {
            write!(f, "main")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Lifecycle of a fiber as seen by the scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Registered but never dispatched, see [`Fiber::start`].
    Unstarted,
    /// Eligible for dispatch.
    Ready,
    /// Currently executing, at most one per thread.
    Running,
    /// Eligible once its deadline passes.
    Sleeping,
    /// Eligible on every round to re-evaluate the condition it waits on.
    Blocked,
    /// Closure returned or panicked.
    Stopped,
}

/// Whether a newly built fiber joins the round-robin immediately.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Start {
    #[default]
    Now,
    /// Wait for [`Fiber::start`].
    Later,
}

/// Configures a fiber before registering it.
///
/// ```
/// use strand::runtime::{Builder, Start};
///
/// let fiber = Builder::new()
///     .name("blinker")
///     .stack_size(16 * 1024)
///     .start(Start::Later)
///     .spawn(|| {})
///     .unwrap();
///
/// assert_eq!(fiber.name().as_deref(), Some("blinker"));
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    stack: Option<Stack>,
    start: Start,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Shows up in logs and [`Fiber::name`].
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Size of the mapped stack, overrides [`Config::stack_size`](super::Config::stack_size).
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Run on a caller provided stack instead of mapping one, takes precedence over [`Builder::stack_size`].
    pub fn stack(mut self, stack: Stack) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn start(mut self, start: Start) -> Self {
        self.start = start;
        self
    }

    /// Registers the fiber on this thread's scheduler.
    /// The closure runs on the new stack once the scheduler dispatches it, and again after each restart.
    ///
    /// Fails if the stack can't be mapped, or is too small to hold the closure and an initial frame.
    pub fn spawn<F: FnMut() + 'static>(self, f: F) -> crate::Result<Fiber> {
        let Builder {
            name,
            stack_size,
            stack,
            start,
        } = self;

        let stack = match stack {
            Some(stack) => stack,
            None => tls::runtime(|runtime| runtime.map_stack(stack_size))?,
        };
        // f is dropped outside of the borrow when it doesn't fit, it may hold fiber handles
        let closure = ClosureSlot::new(&stack)?;

        let id = tls::runtime(|runtime| runtime.create_fiber(f, closure, name, stack, start));

        Ok(Fiber {
            id,
            _not_send: PhantomData,
        })
    }
}

/// Owned handle to a registered fiber.
///
/// Dropping the handle detaches the fiber: it keeps running and is removed once it stops.
/// An unstarted fiber is removed right away since nothing can start it anymore.
#[derive(Debug)]
pub struct Fiber {
    id: FiberId,
    // bound to the thread it was registered on
    _not_send: PhantomData<*const ()>,
}

impl Fiber {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        tls::runtime(|runtime| runtime.fibers[self.id.0].name.clone())
    }

    pub fn state(&self) -> State {
        tls::runtime(|runtime| runtime.fibers[self.id.0].state)
    }

    /// Started and not yet stopped.
    pub fn is_running(&self) -> bool {
        !matches!(self.state(), State::Unstarted | State::Stopped)
    }

    /// Makes an unstarted fiber ready, or restarts a stopped one from the beginning of its closure.
    /// Returns false if the fiber is already running.
    pub fn start(&self) -> bool {
        tls::runtime(|runtime| runtime.start(self.id))
    }

    /// Sets a flag the fiber can observe with [`this_fiber::stop_requested`](crate::this_fiber::stop_requested).
    /// Stopping is up to the fiber.
    pub fn request_stop(&self) {
        tls::runtime(|runtime| {
            tracing::debug!(fiber = %self.id, "requested stop");
            runtime.fibers[self.id.0].stop_requested = true;
        });
    }

    /// Waits until the fiber stops, polling from the calling fiber.
    ///
    /// Outside of a fiber this spins forever, since the scheduler can't run meanwhile.
    pub fn join(&self) {
        crate::this_fiber::poll(|| self.state() == State::Stopped);
    }

    /// Deepest the stack has been since it was last painted, in bytes.
    /// Always zero unless [`Config::paint_stacks`](super::Config::paint_stacks) is set.
    pub fn stack_usage(&self) -> usize {
        tls::runtime(|runtime| runtime.fibers[self.id.0].context.stack_usage())
    }

    /// Usable bytes for frames, excluding the closure stored at the top.
    pub fn stack_size(&self) -> usize {
        tls::runtime(|runtime| runtime.fibers[self.id.0].context.stack_size())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // scheduler is gone or busy during thread teardown
        let removed = tls::try_runtime(|runtime| runtime.detach(self.id)).flatten();
        drop(removed);
    }
}
