//! Cooperative scheduler, the only place that decides which context runs.
//!
//! Fibers are registered with a [`Builder`] (or [`spawn`]) and take turns on the current thread once [`run`] is called.
//! Each thread has its own independent scheduler, created on first use.
//!
//! Dispatch is round-robin in registration order.
//! A fiber runs until it suspends itself, see [`crate::this_fiber`].
//! Fibers are never preempted, never migrate between threads, and never run in parallel.

use std::any::Any;
use std::rc::Rc;
use std::{ffi, panic, ptr, thread};

use crate::assert::{self, Abandonment, Assertion};
use crate::time::{Clock, Instant};

mod config;
mod context_switch;
mod fiber;
mod stack;
mod tls;

pub use config::Config;
pub use fiber::{Builder, Fiber, FiberId, Start, State};
pub use stack::Stack;

use context_switch::Context;

/// Smallest stack a fiber can be built on, before accounting for its closure.
pub const MINIMUM_STACK_SIZE: usize = context_switch::MINIMUM_SIZE;

/// Replaces the default configuration of this thread's scheduler.
///
/// Must be called before anything else touches the scheduler on this thread.
pub fn configure(config: Config) -> crate::Result<()> {
    tls::initialize(config)
}

/// Registers a fiber on this thread's scheduler with the default stack, ready to run.
///
/// # Panics
/// If the stack can't be allocated, use [`Builder::spawn`] to handle the error.
pub fn spawn<F: FnMut() + 'static>(f: F) -> Fiber {
    Builder::new().spawn(f).expect("failed to spawn fiber")
}

/// Runs fibers on the current thread until none of them can ever run again.
///
/// Returns once every registered fiber is stopped or unstarted.
/// Sleeps through periods where every fiber is asleep.
/// The panic payload of a fiber is propagated as an error, after which the scheduler can be run again.
///
/// # Panics
/// If called from a fiber, or while already running.
/// If a stack overflow is detected and the assertion handler aborts.
pub fn run() -> thread::Result<()> {
    tls::runtime(|runtime| {
        assert!(!runtime.is_scheduling, "scheduler is already running on this thread");
        runtime.is_scheduling = true;
    });
    let _scheduling = Scheduling;

    tracing::debug!("scheduler started");
    let result = schedule();
    tracing::debug!(panicked = result.is_err(), "scheduler finished");

    result
}

/// Releases the scheduler, even when unwinding.
struct Scheduling;

impl Drop for Scheduling {
    fn drop(&mut self) {
        tls::runtime(|runtime| runtime.is_scheduling = false);
    }
}

fn schedule() -> thread::Result<()> {
    loop {
        let fiber = match tls::runtime(RuntimeState::select) {
            Selection::Fiber(fiber) => fiber,
            Selection::Polling { fiber, clock, deadline } => {
                tracing::trace!(?deadline, "polling");
                clock.polling(deadline);
                fiber
            }
            Selection::Idle { clock, deadline } => {
                tracing::trace!(?deadline, "idling");
                clock.idle(deadline);
                continue;
            }
            Selection::Finished => return Ok(()),
        };

        if tls::runtime(|runtime| runtime.overflowed(fiber)) {
            assert::report(Assertion::StackOverflow { fiber });
        }

        let (bootstrap, to) = tls::runtime(|runtime| runtime.switch_in(fiber));
        // safety: fiber context is prepared or suspended, bootstrap is the running context
        unsafe { Context::enter(bootstrap, to) };

        let SwitchOut { panicked, overflowed, removed } = tls::runtime(RuntimeState::switch_out);
        drop(removed); // outside of the borrow, closures may hold fiber handles

        if overflowed {
            assert::report(Assertion::StackOverflow { fiber });
        }
        if let Some(payload) = panicked {
            return Err(payload);
        }
    }
}

/// Called on the fiber's own stack the first time it's switched into.
extern "C" fn trampoline<F: FnMut()>(closure: *mut ffi::c_void) -> ! {
    let closure = closure.cast::<F>();

    // safety: closure lives at the top of this stack until the fiber is removed
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| unsafe { (*closure)() }));

    let bootstrap = tls::runtime(|runtime| runtime.complete(result));
    // safety: the scheduler entered this fiber from the bootstrap context
    unsafe { Context::leave(bootstrap, 0) }
}

/// Marks the running fiber as `state` and switches back to the scheduler.
/// Returns once the scheduler dispatches it again.
///
/// Returns false without suspending when called outside of a fiber.
pub(crate) fn suspend(state: State, wake_at: Option<Instant>) -> bool {
    let switch = tls::runtime(|runtime| {
        let fiber = runtime.running_fiber?;
        let fiber = &mut runtime.fibers[fiber.0];
        fiber.state = state;
        fiber.wake_at = wake_at;

        Some((&mut fiber.context as *mut Context, &runtime.original as *const Context))
    });

    match switch {
        Some((from, to)) => {
            // safety: from is the running fiber, to is suspended in schedule
            unsafe { Context::jump(from, to, 0) };
            true
        }
        None => false,
    }
}

/// Fiber the calling code runs on, if any.
pub(crate) fn current() -> Option<FiberId> {
    tls::runtime(|runtime| runtime.running_fiber)
}

/// Whether the running fiber was asked to stop.
pub(crate) fn stop_requested() -> bool {
    tls::runtime(|runtime| {
        let fiber = runtime.running_fiber?;
        Some(runtime.fibers[fiber.0].stop_requested)
    })
    .unwrap_or(false)
}

pub(crate) fn now() -> Instant {
    tls::runtime(|runtime| runtime.config.clock.now())
}

pub(crate) fn clock() -> Rc<dyn Clock> {
    tls::runtime(|runtime| runtime.config.clock.clone())
}

pub(crate) fn assertion_handler() -> Rc<dyn Fn(&Assertion) -> Abandonment> {
    tls::runtime(|runtime| runtime.config.assertion_handler.clone())
}

/// What the scheduler does next.
enum Selection {
    Fiber(FiberId),
    /// Only fibers polling a condition are eligible, time moves on by itself until `deadline`.
    Polling {
        fiber: FiberId,
        clock: Rc<dyn Clock>,
        deadline: Option<Instant>,
    },
    /// Every fiber is asleep until `deadline`.
    Idle { clock: Rc<dyn Clock>, deadline: Instant },
    /// No fiber can ever run again.
    Finished,
}

struct RuntimeState {
    config: Config,
    fibers: slab::Slab<FiberState>,
    /// Registration order, the round-robin sequence.
    order: Vec<FiberId>,
    /// Position in `order` of the last dispatched fiber.
    cursor: Option<usize>,
    running_fiber: Option<FiberId>,
    is_scheduling: bool,
    panicked: Option<Box<dyn Any + Send>>,
    /// Dispatches in a row that left their fiber blocked.
    fruitless_polls: usize,
    /// Where fibers switch back to, filled in on every dispatch.
    original: Context,
}

impl RuntimeState {
    fn new(config: Config) -> Self {
        tracing::trace!(?config, "created scheduler");

        RuntimeState {
            config,
            fibers: slab::Slab::new(),
            order: Vec::new(),
            cursor: None,
            running_fiber: None,
            is_scheduling: false,
            panicked: None,
            fruitless_polls: 0,
            original: Context::bootstrap(),
        }
    }

    /// Maps a stack of `bytes`, or the configured default size.
    fn map_stack(&self, bytes: Option<usize>) -> crate::Result<Stack> {
        Ok(Stack::with_size(bytes.unwrap_or(self.config.stack_size), self.config.guard_pages)?)
    }

    /// Moves the closure into its slot at the top of the stack and prepares a context to call it.
    fn create_fiber<F: FnMut() + 'static>(
        &mut self,
        f: F,
        closure: ClosureSlot<F>,
        name: Option<String>,
        stack: Stack,
        start: Start,
    ) -> FiberId {
        let closure = closure.0;

        // safety: the closure region is aligned, in bounds, and disjoint from the context below it
        let context = unsafe {
            closure.write(f);
            let mut context = Context::new(stack.bottom(), closure.cast(), trampoline::<F>, closure.cast());
            if self.config.paint_stacks {
                context.paint();
            }
            context
        };

        let state = match start {
            Start::Now => State::Ready,
            Start::Later => State::Unstarted,
        };

        let id = FiberId(self.fibers.vacant_key());
        tracing::debug!(fiber = %id, ?name, stack = stack.len(), ?state, "registered fiber");

        self.fibers.insert(FiberState {
            name,
            context,
            state,
            wake_at: None,
            stop_requested: false,
            detached: false,
            overflow_reported: false,
            _closure: Closure {
                pointer: closure.cast(),
                drop: drop_closure::<F>,
            },
            _stack: stack,
        });
        self.order.push(id);

        id
    }

    /// Picks the next fiber after the cursor, in registration order.
    fn select(&mut self) -> Selection {
        let count = self.order.len();
        let start = self.cursor.map_or(0, |cursor| cursor + 1);
        let now = self.config.clock.now();

        let mut selected = None;
        let mut runnable = false;
        let mut blocked = 0;
        let mut earliest: Option<Instant> = None;
        let mut remember = |deadline: Instant| {
            earliest = Some(earliest.map_or(deadline, |earliest| earliest.min(deadline)));
        };

        for offset in 0..count {
            let position = (start + offset) % count;
            let fiber = &self.fibers[self.order[position].0];

            let eligible = match (fiber.state, fiber.wake_at) {
                (State::Ready, _) => {
                    runnable = true;
                    true
                }
                (State::Sleeping | State::Blocked, Some(wake_at)) if wake_at <= now => {
                    runnable = true;
                    true
                }
                (State::Sleeping, Some(wake_at)) => {
                    remember(wake_at);
                    false
                }
                (State::Blocked, wake_at) => {
                    if let Some(wake_at) = wake_at {
                        remember(wake_at);
                    }
                    blocked += 1;
                    true
                }
                _ => false,
            };

            if eligible && selected.is_none() {
                selected = Some(position);
            }
        }

        match (selected, earliest) {
            (Some(position), deadline) => {
                self.cursor = Some(position);
                let fiber = self.order[position];

                // time only moves on once every blocked fiber re-checked its condition in vain
                if runnable || self.fruitless_polls < blocked {
                    Selection::Fiber(fiber)
                } else {
                    self.fruitless_polls = 0;
                    Selection::Polling {
                        fiber,
                        clock: self.config.clock.clone(),
                        deadline,
                    }
                }
            }
            (None, Some(deadline)) => Selection::Idle {
                clock: self.config.clock.clone(),
                deadline,
            },
            (None, None) => Selection::Finished,
        }
    }

    /// Whether the fiber's stack overflowed, true only the first time it's noticed.
    fn overflowed(&mut self, fiber: FiberId) -> bool {
        let state = &mut self.fibers[fiber.0];
        if state.overflow_reported || !state.context.is_overflowed() {
            return false;
        }

        state.overflow_reported = true;
        true
    }

    /// Returns the bootstrap context to save into and the fiber context to jump to.
    fn switch_in(&mut self, fiber: FiberId) -> (*mut Context, *const Context) {
        tracing::trace!(%fiber, "dispatching fiber");

        let state = &mut self.fibers[fiber.0];
        state.state = State::Running;
        state.wake_at = None;
        self.running_fiber = Some(fiber);

        (&mut self.original as *mut Context, &state.context as *const Context)
    }

    /// Back on the bootstrap stack, collects what the fiber left behind.
    fn switch_out(&mut self) -> SwitchOut {
        let mut overflowed = false;
        let mut removed = None;

        if let Some(fiber) = self.running_fiber.take() {
            overflowed = self.overflowed(fiber);

            let FiberState { state, detached, .. } = self.fibers[fiber.0];
            match state {
                State::Blocked => self.fruitless_polls += 1,
                _ => self.fruitless_polls = 0,
            }
            if state == State::Stopped && detached {
                removed = Some(self.remove(fiber));
            }
        }

        SwitchOut {
            panicked: self.panicked.take(),
            overflowed,
            removed,
        }
    }

    /// Records how the running fiber's closure ended, then returns where to jump to.
    fn complete(&mut self, result: thread::Result<()>) -> *const Context {
        if let Some(fiber) = self.running_fiber {
            let state = &mut self.fibers[fiber.0];
            state.state = State::Stopped;
            state.wake_at = None;

            match result {
                Ok(()) => tracing::debug!(%fiber, "fiber stopped"),
                Err(payload) => {
                    tracing::debug!(%fiber, "fiber panicked");
                    self.panicked = Some(payload);
                }
            }
        }

        &self.original
    }

    /// Makes an unstarted fiber ready, or rewinds a stopped one to the beginning of its closure.
    fn start(&mut self, fiber: FiberId) -> bool {
        let paint = self.config.paint_stacks;
        let state = &mut self.fibers[fiber.0];

        match state.state {
            State::Unstarted => {}
            State::Stopped => {
                // safety: a stopped fiber has nothing left on its stack
                unsafe {
                    state.context.reset();
                    if paint {
                        state.context.paint();
                    }
                }
                state.stop_requested = false;
                state.overflow_reported = false;
            }
            _ => return false,
        }

        tracing::debug!(%fiber, "started fiber");
        state.state = State::Ready;
        true
    }

    /// The handle is gone, the fiber is removed as soon as it stops.
    fn detach(&mut self, fiber: FiberId) -> Option<FiberState> {
        let state = &mut self.fibers[fiber.0];
        state.detached = true;

        match state.state {
            State::Stopped | State::Unstarted => Some(self.remove(fiber)),
            _ => None,
        }
    }

    /// Caller must drop the returned state outside of the borrow.
    fn remove(&mut self, fiber: FiberId) -> FiberState {
        if let Some(position) = self.order.iter().position(|&id| id == fiber) {
            self.order.remove(position);

            // scanning resumes with whichever fiber took the removed position
            if let Some(cursor) = self.cursor {
                if cursor >= position {
                    self.cursor = cursor.checked_sub(1);
                }
            }
        }

        tracing::trace!(%fiber, "removed fiber");
        self.fibers.remove(fiber.0)
    }
}

struct FiberState {
    name: Option<String>,
    context: Context,
    state: State,
    /// Sleeping deadline, or polling timeout.
    wake_at: Option<Instant>,
    stop_requested: bool,
    detached: bool,
    overflow_reported: bool,
    // dropped before the stack it lives on
    _closure: Closure,
    _stack: Stack,
}

/// What a fiber left behind when it switched back to the scheduler.
struct SwitchOut {
    panicked: Option<Box<dyn Any + Send>>,
    overflowed: bool,
    /// Must be dropped outside of the borrow.
    removed: Option<FiberState>,
}

/// Aligned space for a closure at the top of a stack, leaving room for the initial frame below it.
struct ClosureSlot<F>(*mut F);

impl<F> ClosureSlot<F> {
    fn new(stack: &Stack) -> crate::Result<Self> {
        let bottom = stack.bottom() as usize;
        let top = stack.top() as usize;
        let closure = top
            .checked_sub(std::mem::size_of::<F>())
            .map(|address| address & !(std::mem::align_of::<F>() - 1))
            .filter(|&address| address >= bottom);
        let required = (top - closure.unwrap_or(bottom)) + MINIMUM_STACK_SIZE;

        match closure {
            Some(closure) if stack.len() >= required => Ok(ClosureSlot(closure as *mut F)),
            _ => Err(crate::Error::StackTooSmall {
                size: stack.len(),
                required: std::mem::size_of::<F>() + MINIMUM_STACK_SIZE,
            }),
        }
    }
}

/// Type erased closure stored on its own stack.
struct Closure {
    pointer: *mut u8,
    drop: unsafe fn(*mut u8),
}

impl Drop for Closure {
    fn drop(&mut self) {
        // safety: written once by create_fiber, never moved
        unsafe { (self.drop)(self.pointer) };
    }
}

unsafe fn drop_closure<F>(pointer: *mut u8) {
    ptr::drop_in_place(pointer.cast::<F>());
}
