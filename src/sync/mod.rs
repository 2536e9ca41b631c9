//! Synchronization between fibers on the same thread.
//!
//! Fibers on one thread never run in parallel, so these primitives need no atomics.
//! Waiting is done by [`poll`](crate::this_fiber::poll)ing, the waiter re-checks once per scheduling round.
//!
//! Use [`Mutex`] to guard a resource shared by fibers that may suspend while holding it.
//! Use [`RecursiveMutex`] when the owner may lock again through nested calls.

mod mutex;
mod recursive_mutex;

pub use mutex::Mutex;
pub use recursive_mutex::RecursiveMutex;
