use std::fmt;
use std::num::NonZeroUsize;
use std::rc::Rc;

use crate::assert::{self, Abandonment, Assertion};
use crate::time::{Clock, SystemClock};

/// Per-thread scheduler settings, installed with [`super::configure`] before the scheduler is first used.
///
/// Override only what you need:
/// ```
/// use strand::runtime::Config;
///
/// let config = Config {
///     stack_size: 64 * 1024,
///     ..Config::default()
/// };
/// ```
#[derive(Clone)]
pub struct Config {
    /// Usable bytes of a mapped fiber stack when the builder doesn't specify one, rounded up to whole pages.
    pub stack_size: usize,

    /// Inaccessible pages below every mapped stack, a hardware trap for overflows that skip past the watermark.
    pub guard_pages: NonZeroUsize,

    /// Colour the whole stack with the watermark so that stack usage can be measured.
    /// Touches every page up front, defeating demand paging.
    pub paint_stacks: bool,

    /// Source of monotonic time for sleeping, timeouts and timers.
    pub clock: Rc<dyn Clock>,

    /// Decides what happens after a stack overflow or a usage error.
    pub assertion_handler: Rc<dyn Fn(&Assertion) -> Abandonment>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: 128 * 1024,
            guard_pages: NonZeroUsize::MIN,
            paint_stacks: true,
            clock: Rc::new(SystemClock::new()),
            assertion_handler: Rc::new(assert::abort),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // custom impl since closures don't implement debug
        f.debug_struct("Config")
            .field("stack_size", &self.stack_size)
            .field("guard_pages", &self.guard_pages)
            .field("paint_stacks", &self.paint_stacks)
            .finish_non_exhaustive()
    }
}
