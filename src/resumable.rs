//! Resumable functions, backed by fibers.
//!
//! Code written in the resumable function style expects each function to run to completion across many calls,
//! with at most one invocation in flight.
//! On fibers a resumable function is an ordinary call that suspends internally,
//! so all that remains is making concurrent callers wait their turn.
//!
//! # Examples
//!
//! ### Serializing a Driver
//! Two fibers use the same driver, the second one waits until the first transfer completes.
//! ```
//! use std::rc::Rc;
//! use strand::resumable::{Resumable, ResumableResult};
//! use strand::this_fiber;
//!
//! const TRANSFER: usize = 0;
//!
//! struct Driver {
//!     resumable: Resumable<1>,
//! }
//!
//! impl Driver {
//!     fn transfer(&self, byte: u8) -> ResumableResult<u8> {
//!         self.resumable.call(TRANSFER, || {
//!             this_fiber::yield_now(); // waiting on hardware
//!             byte.wrapping_add(1)
//!         })
//!     }
//! }
//!
//! let driver = Rc::new(Driver { resumable: Resumable::new() });
//! for byte in [1, 2] {
//!     let driver = driver.clone();
//!     strand::spawn(move || assert_eq!(driver.transfer(byte), byte + 1));
//! }
//!
//! strand::runtime::run().unwrap();
//! assert!(!driver.resumable.any_running());
//! ```

use crate::sync::{Mutex, RecursiveMutex};
use crate::this_fiber;

/// A resumable function returns its value directly, there are no intermediate states to observe.
pub type ResumableResult<T> = T;

/// `N` independent resumable functions, each identified by an index.
///
/// Each index allows one invocation at a time, further callers suspend until it returns.
#[derive(Debug)]
pub struct Resumable<const N: usize> {
    functions: [Mutex; N],
}

impl<const N: usize> Resumable<N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const IDLE: Mutex = Mutex::new();

    pub const fn new() -> Self {
        Resumable {
            functions: [Self::IDLE; N],
        }
    }

    /// Runs `f` as the function at `index`, waiting for a running invocation to finish first.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    pub fn call<T>(&self, index: usize, f: impl FnOnce() -> T) -> ResumableResult<T> {
        let function = self.function(index);

        function.lock();
        let _guard = Unlock(function);
        f()
    }

    /// Whether the function at `index` is in flight, false if out of bounds.
    pub fn is_running(&self, index: usize) -> bool {
        self.functions.get(index).is_some_and(Mutex::is_locked)
    }

    pub fn any_running(&self) -> bool {
        self.functions.iter().any(Mutex::is_locked)
    }

    pub fn any_running_of(&self, indices: &[usize]) -> bool {
        indices.iter().any(|&index| self.is_running(index))
    }

    pub fn all_running_of(&self, indices: &[usize]) -> bool {
        indices.iter().all(|&index| self.is_running(index))
    }

    /// Waits until none of the functions at `indices` is in flight.
    pub fn join(&self, indices: &[usize]) {
        this_fiber::poll(|| !self.any_running_of(indices));
    }

    fn function(&self, index: usize) -> &Mutex {
        match self.functions.get(index) {
            Some(function) => function,
            None => panic!("resumable function index {index} out of bounds, increase the count of {N}"),
        }
    }
}

impl<const N: usize> Default for Resumable<N> {
    fn default() -> Self {
        Resumable::new()
    }
}

struct Unlock<'a>(&'a Mutex);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// A single resumable function that may call itself, up to `LEVELS` invocations deep.
///
/// Other fibers suspend until the outermost invocation returns.
#[derive(Debug, Default)]
pub struct NestedResumable<const LEVELS: usize> {
    state: RecursiveMutex,
}

impl<const LEVELS: usize> NestedResumable<LEVELS> {
    pub const fn new() -> Self {
        NestedResumable {
            state: RecursiveMutex::new(),
        }
    }

    /// Runs `f` as one more nesting level, waiting for other fibers' invocations to finish first.
    ///
    /// Fails without calling `f` if the calling fiber is already `LEVELS` deep.
    pub fn call<T>(&self, f: impl FnOnce() -> T) -> crate::Result<ResumableResult<T>> {
        if self.state.owner() == Some(this_fiber::id()) && self.state.depth() >= LEVELS {
            tracing::debug!(levels = LEVELS, "resumable function nested too deep");
            return Err(crate::Error::Nesting { levels: LEVELS });
        }

        self.state.lock();
        let _guard = RecursiveUnlock(&self.state);
        Ok(f())
    }

    pub fn is_running(&self) -> bool {
        self.state.owner().is_some()
    }

    /// Nesting level of the innermost invocation in flight, starting at zero.
    pub fn depth(&self) -> Option<usize> {
        self.state.depth().checked_sub(1)
    }
}

struct RecursiveUnlock<'a>(&'a RecursiveMutex);

impl Drop for RecursiveUnlock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{run, spawn};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    mod resumable {
        use super::*;

        #[test]
        fn returns_value() {
            let resumable = Resumable::<2>::new();

            let result = resumable.call(1, || 42);

            assert_eq!(result, 42);
            assert!(!resumable.any_running());
        }

        #[test]
        #[should_panic(expected = "out of bounds")]
        fn index_out_of_bounds() {
            let resumable = Resumable::<2>::new();

            resumable.call(2, || {});
        }

        #[test]
        fn running_while_in_flight() {
            let resumable = Resumable::<3>::new();

            resumable.call(1, || {
                assert!(resumable.is_running(1));
                assert!(!resumable.is_running(0));
                assert!(!resumable.is_running(7));
                assert!(resumable.any_running());
                assert!(resumable.any_running_of(&[0, 1]));
                assert!(!resumable.all_running_of(&[0, 1]));
                assert!(resumable.all_running_of(&[1]));
            });
        }

        #[test]
        fn unlocks_after_panic() {
            let resumable = Resumable::<1>::new();

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                resumable.call(0, || panic!("oops"));
            }));

            assert!(result.is_err());
            assert!(!resumable.is_running(0));
        }

        #[test]
        fn serializes_callers() {
            let resumable = Rc::new(Resumable::<1>::new());
            let trace = Rc::new(RefCell::new(Vec::new()));
            for name in ["a", "b"] {
                let (resumable, trace) = (resumable.clone(), trace.clone());
                spawn(move || {
                    resumable.call(0, || {
                        trace.borrow_mut().push((name, "begin"));
                        crate::this_fiber::yield_now();
                        trace.borrow_mut().push((name, "end"));
                    });
                });
            }

            run().unwrap();

            assert_eq!(
                *trace.borrow(),
                [("a", "begin"), ("a", "end"), ("b", "begin"), ("b", "end")]
            );
        }

        #[test]
        fn join_waits() {
            let resumable = Rc::new(Resumable::<2>::new());
            let joined_after = Rc::new(Cell::new(false));
            spawn({
                let resumable = resumable.clone();
                move || {
                    resumable.call(0, || {
                        for _ in 0..3 {
                            crate::this_fiber::yield_now();
                        }
                    })
                }
            });
            spawn({
                let (resumable, joined_after) = (resumable.clone(), joined_after.clone());
                move || {
                    resumable.join(&[0, 1]);
                    joined_after.set(!resumable.any_running());
                }
            });

            run().unwrap();

            assert!(joined_after.get());
        }
    }

    mod nested {
        use super::*;

        fn recurse(resumable: &NestedResumable<2>, remaining: usize, depths: &mut Vec<Option<usize>>) -> crate::Result<()> {
            resumable.call(|| {
                depths.push(resumable.depth());
                if remaining > 0 {
                    recurse(resumable, remaining - 1, depths)
                } else {
                    Ok(())
                }
            })?
        }

        #[test]
        fn not_running_by_default() {
            let resumable = NestedResumable::<1>::new();

            assert!(!resumable.is_running());
            assert_eq!(resumable.depth(), None);
        }

        #[test]
        fn within_levels() {
            let resumable = NestedResumable::<2>::new();
            let mut depths = Vec::new();

            recurse(&resumable, 1, &mut depths).unwrap();

            assert_eq!(depths, [Some(0), Some(1)]);
            assert!(!resumable.is_running());
        }

        #[test]
        fn too_deep() {
            let resumable = NestedResumable::<2>::new();
            let mut depths = Vec::new();

            let result = recurse(&resumable, 2, &mut depths);

            assert!(matches!(result, Err(crate::Error::Nesting { levels: 2 })));
            assert_eq!(depths, [Some(0), Some(1)]);
            assert_eq!(resumable.depth(), None);
        }

        #[test]
        fn other_fiber_waits() {
            let resumable = Rc::new(NestedResumable::<1>::new());
            let trace = Rc::new(RefCell::new(Vec::new()));
            for name in ["a", "b"] {
                let (resumable, trace) = (resumable.clone(), trace.clone());
                spawn(move || {
                    resumable
                        .call(|| {
                            trace.borrow_mut().push((name, "begin"));
                            crate::this_fiber::yield_now();
                            trace.borrow_mut().push((name, "end"));
                        })
                        .unwrap();
                });
            }

            run().unwrap();

            assert_eq!(
                *trace.borrow(),
                [("a", "begin"), ("a", "end"), ("b", "begin"), ("b", "end")]
            );
        }
    }
}
