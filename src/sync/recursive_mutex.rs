use std::cell::Cell;

use crate::assert::{self, Assertion};
use crate::runtime::FiberId;
use crate::this_fiber;

/// Lock owned by one fiber, which may lock it again any number of times.
///
/// Every lock must be balanced by an unlock from the owner before another fiber can take it.
/// Code outside of fibers counts as the owner [`FiberId::MAIN`].
#[derive(Debug, Default)]
pub struct RecursiveMutex {
    owner: Cell<Option<FiberId>>,
    count: Cell<usize>,
}

impl RecursiveMutex {
    pub const fn new() -> Self {
        RecursiveMutex {
            owner: Cell::new(None),
            count: Cell::new(0),
        }
    }

    /// Takes the lock if it's free or already owned by the calling fiber, never suspends.
    pub fn try_lock(&self) -> bool {
        let caller = this_fiber::id();

        match self.owner.get() {
            None => {
                self.owner.set(Some(caller));
                self.count.set(1);
                true
            }
            Some(owner) if owner == caller => {
                self.count.set(self.count.get() + 1);
                true
            }
            Some(_) => false,
        }
    }

    /// Takes the lock, suspending the calling fiber while another fiber owns it.
    pub fn lock(&self) {
        this_fiber::poll(|| self.try_lock());
    }

    /// Undoes one lock, releasing ownership once the count drops to zero.
    ///
    /// Unlocking from a fiber that isn't the owner has no effect,
    /// and is reported to the assertion handler in debug builds.
    pub fn unlock(&self) {
        let caller = this_fiber::id();
        let owner = self.owner.get();

        if owner != Some(caller) {
            if cfg!(debug_assertions) {
                assert::report(Assertion::NotOwner { owner, caller });
            }
            return;
        }

        let count = self.count.get() - 1;
        self.count.set(count);
        if count == 0 {
            self.owner.set(None);
        }
    }

    pub fn owner(&self) -> Option<FiberId> {
        self.owner.get()
    }

    /// Number of unlocks the owner still owes, zero when free.
    pub fn depth(&self) -> usize {
        self.count.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{run, spawn};
    use std::rc::Rc;

    mod try_lock {
        use super::*;

        #[test]
        fn reentrant_for_owner() {
            let mutex = RecursiveMutex::new();

            assert!(mutex.try_lock());
            assert!(mutex.try_lock());

            assert_eq!(mutex.depth(), 2);
            assert_eq!(mutex.owner(), Some(FiberId::MAIN));
        }

        #[test]
        fn refuses_other_fiber() {
            let mutex = Rc::new(RecursiveMutex::new());
            mutex.lock();
            let acquired = Rc::new(Cell::new(true));
            spawn({
                let (mutex, acquired) = (mutex.clone(), acquired.clone());
                move || acquired.set(mutex.try_lock())
            });

            run().unwrap();

            assert!(!acquired.get());
            assert_eq!(mutex.owner(), Some(FiberId::MAIN));
        }
    }

    mod unlock {
        use super::*;

        #[test]
        fn balanced() {
            let mutex = RecursiveMutex::new();
            for _ in 0..3 {
                mutex.lock();
            }

            mutex.unlock();
            mutex.unlock();
            assert_eq!(mutex.owner(), Some(FiberId::MAIN));

            mutex.unlock();
            assert_eq!(mutex.owner(), None);
            assert_eq!(mutex.depth(), 0);
        }

        #[test]
        #[cfg(debug_assertions)]
        #[should_panic(expected = "unlocked a recursive mutex")]
        fn free_is_reported() {
            let mutex = RecursiveMutex::new();

            mutex.unlock();
        }

        #[test]
        #[cfg(not(debug_assertions))]
        fn free_has_no_effect() {
            let mutex = RecursiveMutex::new();

            mutex.unlock();

            assert_eq!(mutex.depth(), 0);
        }
    }

    mod lock {
        use super::*;

        #[test]
        fn waits_for_full_release() {
            let mutex = Rc::new(RecursiveMutex::new());
            let trace = Rc::new(std::cell::RefCell::new(Vec::new()));
            spawn({
                let (mutex, trace) = (mutex.clone(), trace.clone());
                move || {
                    mutex.lock();
                    mutex.lock();
                    this_fiber::yield_now();
                    mutex.unlock();
                    trace.borrow_mut().push("owner partly unlocked");
                    this_fiber::yield_now();
                    mutex.unlock();
                    trace.borrow_mut().push("owner released");
                }
            });
            spawn({
                let (mutex, trace) = (mutex.clone(), trace.clone());
                move || {
                    mutex.lock();
                    trace.borrow_mut().push("other locked");
                    mutex.unlock();
                }
            });

            run().unwrap();

            assert_eq!(
                *trace.borrow(),
                ["owner partly unlocked", "owner released", "other locked"]
            );
        }
    }
}
