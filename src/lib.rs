//! Cooperative fibers: many call stacks sharing one thread, switched by hand-written assembly.
//!
//! A fiber is a closure running on its own [`Stack`](runtime::Stack).
//! Fibers take turns in registration order whenever the running one [yields](this_fiber::yield_now),
//! [sleeps](this_fiber::sleep_for) or [waits on a condition](this_fiber::poll).
//! There's no preemption, so state shared between fibers on one thread needs no atomics.
//!
//! ```
//! use std::time::Duration;
//! use strand::this_fiber;
//!
//! strand::spawn(|| {
//!     for _ in 0..3 {
//!         println!("tick");
//!         this_fiber::sleep_for(Duration::from_millis(2));
//!     }
//! });
//! strand::spawn(|| {
//!     for _ in 0..2 {
//!         println!("tock");
//!         this_fiber::sleep_for(Duration::from_millis(3));
//!     }
//! });
//!
//! strand::runtime::run().unwrap();
//! ```
//!
//! Each thread runs its own scheduler, fibers never migrate between threads.
//! Stack overflows are caught on the next switch into the offending fiber and reported to the
//! [assertion handler](runtime::Config::assertion_handler).

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

#[cfg(not(target_os = "linux"))]
compile_error!("strand maps fiber stacks with Linux system calls");

pub mod assert;
pub mod resumable;
pub mod runtime;
pub mod sync;
pub mod this_fiber;
pub mod time;

pub use runtime::{spawn, Fiber, FiberId};

#[cfg(feature = "macros")]
pub use strand_macros::main;

/// Errors that a caller can recover from.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Mapping or protecting stack memory failed.
    #[error("failed to allocate fiber stack")]
    Stack(#[from] std::io::Error),

    /// A caller provided stack can't hold the closure and an initial frame.
    #[error("fiber stack of {size} bytes is too small, need at least {required}")]
    StackTooSmall { size: usize, required: usize },

    /// The scheduler on this thread was already in use when configuring it.
    #[error("scheduler already initialized on this thread")]
    AlreadyInitialized,

    /// A nested resumable function was called deeper than it allows.
    #[error("resumable function nested deeper than {levels} levels")]
    Nesting { levels: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_thread_safe() {
        assert!(impls::impls!(Error: Send & Sync));
    }

    #[test]
    fn describes_too_small_stack() {
        let error = Error::StackTooSmall { size: 64, required: 96 };

        assert_eq!(error.to_string(), "fiber stack of 64 bytes is too small, need at least 96");
    }
}
