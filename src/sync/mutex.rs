//! Binary lock, without an owner.
//!
//! # Examples
//!
//! ### Exclusive Section Across Yields
//! The second fiber waits until the first one unlocks, even though the first suspends while holding the lock.
//! ```
//! use std::rc::Rc;
//! use strand::sync::Mutex;
//! use strand::this_fiber;
//!
//! let mutex = Rc::new(Mutex::new());                      // Execution order:
//!
//! strand::spawn({
//!     let mutex = mutex.clone();
//!     move || {
//!         mutex.lock();                                   // 1
//!         this_fiber::yield_now();                        // 2
//!         mutex.unlock();                                 // 4
//!     }
//! });
//! strand::spawn({
//!     let mutex = mutex.clone();
//!     move || {
//!         mutex.lock();                                   // 3, then 5
//!         mutex.unlock();                                 // 6
//!     }
//! });
//!
//! strand::runtime::run().unwrap();
//! assert!(!mutex.is_locked());
//! ```

use std::cell::Cell;

use crate::assert::{self, Assertion};
use crate::this_fiber;

/// Mutual exclusion between fibers.
///
/// Not tied to a particular fiber: any fiber may unlock it, and locking twice from the same fiber deadlocks.
#[derive(Debug, Default)]
pub struct Mutex {
    locked: Cell<bool>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            locked: Cell::new(false),
        }
    }

    /// Takes the lock if it's free, never suspends.
    pub fn try_lock(&self) -> bool {
        if self.locked.get() {
            return false;
        }

        self.locked.set(true);
        true
    }

    /// Takes the lock, suspending the calling fiber while it's held elsewhere.
    pub fn lock(&self) {
        this_fiber::poll(|| self.try_lock());
    }

    /// Releases the lock.
    ///
    /// Unlocking a mutex that isn't locked is reported to the assertion handler in debug builds.
    pub fn unlock(&self) {
        if cfg!(debug_assertions) && !self.locked.get() {
            assert::report(Assertion::UnlockUnlocked);
        }

        self.locked.set(false);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }
}
