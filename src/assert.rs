//! Conditions the core detects but leaves to the application to decide on.
//!
//! Every report reaches [`Config::assertion_handler`](crate::runtime::Config::assertion_handler),
//! which answers with an [`Abandonment`] policy.
//! Continuing after a stack overflow risks running on corrupted memory, so it's never the default.

use crate::runtime::{self, FiberId};

/// Machine-readable description of what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Assertion {
    /// A fiber's stack grew past its bottom, detected on the way back into it.
    #[error("stack overflow on fiber {fiber}")]
    StackOverflow {
        /// The fiber whose watermark or saved stack pointer is out of bounds.
        fiber: FiberId,
    },

    /// [`Mutex::unlock`](crate::sync::Mutex::unlock) on a mutex that wasn't locked.
    /// Only checked in debug builds.
    #[error("unlocked a mutex that wasn't locked")]
    UnlockUnlocked,

    /// [`RecursiveMutex::unlock`](crate::sync::RecursiveMutex::unlock) by a fiber that doesn't own it.
    /// Only checked in debug builds.
    #[error("fiber {caller} unlocked a recursive mutex owned by {owner:?}")]
    NotOwner {
        /// Current owner, if any.
        owner: Option<FiberId>,
        /// Fiber that attempted the unlock.
        caller: FiberId,
    },
}

/// What to do after an [`Assertion`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Abandonment {
    /// Carry on, best effort.
    Ignore,
    /// Panic where the condition was detected.
    #[default]
    Abort,
}

/// The default handler, treats every assertion as fatal.
pub fn abort(_assertion: &Assertion) -> Abandonment {
    Abandonment::Abort
}

/// Consults the handler of this thread's scheduler.
///
/// # Panics
/// If the handler decides to abort.
pub(crate) fn report(assertion: Assertion) {
    let handler = runtime::assertion_handler();

    match handler(&assertion) {
        Abandonment::Ignore => {
            tracing::warn!(%assertion, "ignoring failed assertion");
        }
        Abandonment::Abort => {
            tracing::error!(%assertion, "abandoning execution");
            panic!("{assertion}");
        }
    }
}
