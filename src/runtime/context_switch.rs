//! Abstraction over userspace multitasking.
//!
//! Provides an implementation for every CPU architecture.
//! Everything above this module only sees [`Context`] and never the register file.
//!
//! Stack layout of a prepared context (growing downwards):
//!
//! ```text
//! top    ┬ entry function          ┐ permanent storage,
//!        ├ entry argument          ┘ written once by `Context::new`
//!        ├ return address          ┐
//!        ├ callee-saved registers  ┘ register file, rewritten by `Context::reset`
//! sp     ┼ ...
//!        │ free stack, painted with `WATERMARK`
//! bottom ┴ WATERMARK
//! ```

use std::arch::global_asm;
use std::{ffi, mem, ptr};

/// Byte written at the bottom of every stack, and over all of its unused space when painted.
pub(crate) const WATERMARK: u8 = 0xaa;

/// Function that a fresh context enters on its first switch.
pub(crate) type Entry = extern "C" fn(*mut ffi::c_void) -> !;

const WORD: usize = mem::size_of::<usize>();

/// Words at the top of the stack holding the entry function and its argument.
const STORAGE_WORDS: usize = 2;

/// Smallest stack that can hold an initial frame and the watermark.
pub(crate) const MINIMUM_SIZE: usize = (STORAGE_WORDS + arch::FRAME_WORDS) * WORD + STACK_ALIGNMENT;

const STACK_ALIGNMENT: usize = 16;

/// A suspended computation: its saved stack pointer and the bounds of the stack it runs on.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct Context {
    sp: *mut u8,
    bottom: *mut u8,
    top: *mut u8,
}

// the assembly stores and loads through the first field
const _: () = assert!(mem::offset_of!(Context, sp) == 0);
const _: () = assert!(MINIMUM_SIZE % WORD == 0);

extern "C" {
    /// Executes a context switch.
    ///
    /// Spills callee-saved registers, sets `from` to the updated stack pointer.
    /// Sets the stack pointer to `to`, restores its registers and returns `value` there.
    fn strand_context_jump(from: *mut Context, to: *const Context, value: usize) -> usize;

    /// Trampoline that calls the stored entry function with the stored argument.
    fn strand_context_entry();
}

impl Context {
    /// Context of the thread's original stack, filled in by the first jump away from it.
    pub(crate) const fn bootstrap() -> Self {
        Context {
            sp: ptr::null_mut(),
            bottom: ptr::null_mut(),
            top: ptr::null_mut(),
        }
    }

    /// Prepares the stack between `bottom` and `top` so that the first switch into it calls `entry(argument)`.
    ///
    /// # Safety
    /// The memory must be writable, exclusively owned by this context, and at least [`MINIMUM_SIZE`] long.
    pub(crate) unsafe fn new(bottom: *mut u8, top: *mut u8, entry: Entry, argument: *mut ffi::c_void) -> Self {
        let top = align_down(top, STACK_ALIGNMENT);
        debug_assert!(top as usize - bottom as usize >= MINIMUM_SIZE);

        let storage = top.cast::<usize>().sub(STORAGE_WORDS);
        storage.write(argument as usize);
        storage.add(1).write(entry as *const () as usize);

        let mut context = Context {
            sp: ptr::null_mut(),
            bottom,
            top,
        };
        context.reset();
        context
    }

    /// Rewinds the context to its entry state and restores the watermark at the bottom.
    ///
    /// # Safety
    /// The context must not be running, and nothing on its stack may be referenced afterwards.
    pub(crate) unsafe fn reset(&mut self) {
        self.bottom.write_volatile(WATERMARK);

        let frame = self.top.cast::<usize>().sub(STORAGE_WORDS + arch::FRAME_WORDS);
        for word in 0..arch::FRAME_WORDS {
            frame.add(word).write(0);
        }
        arch::prepare_frame(frame, strand_context_entry as *const () as usize);

        self.sp = frame.cast();
    }

    /// Colours all unused stack below the register file with the watermark.
    ///
    /// # Safety
    /// The context must not be running.
    pub(crate) unsafe fn paint(&mut self) {
        let length = self.sp as usize - self.bottom as usize;
        ptr::write_bytes(self.bottom, WATERMARK, length);
    }

    /// Whether the stack grew past its bottom, either by the saved stack pointer or a clobbered watermark.
    pub(crate) fn is_overflowed(&self) -> bool {
        if self.bottom.is_null() {
            return false; // bootstrap stack is owned by the OS
        }

        // safety: bottom is the first byte of the stack this context owns
        self.sp < self.bottom || unsafe { self.bottom.read_volatile() } != WATERMARK
    }

    /// High-water mark of bytes used, found by scanning up from the bottom for the first non-watermark byte.
    /// Only meaningful for painted stacks.
    pub(crate) fn stack_usage(&self) -> usize {
        if self.bottom.is_null() {
            return 0;
        }

        let mut byte = self.bottom;
        while byte < self.top {
            // safety: within [bottom, top)
            if unsafe { byte.read_volatile() } != WATERMARK {
                return self.top as usize - byte as usize;
            }
            byte = unsafe { byte.add(1) };
        }

        0
    }

    /// Bytes between the bottom and the aligned top.
    pub(crate) fn stack_size(&self) -> usize {
        self.top as usize - self.bottom as usize
    }

    /// Suspends the running computation into `from` and resumes `to`, handing it `value`.
    /// Returns the value handed back by whoever resumes `from`.
    ///
    /// # Safety
    /// `from` must be the running context. `to` must be prepared or previously suspended, and not running.
    #[inline]
    pub(crate) unsafe fn jump(from: *mut Context, to: *const Context, value: usize) -> usize {
        strand_context_jump(from, to, value)
    }

    /// Switches from the bootstrap stack into `to`, recording where to come back to in `bootstrap`.
    ///
    /// # Safety
    /// See [`Context::jump`].
    pub(crate) unsafe fn enter(bootstrap: *mut Context, to: *const Context) -> usize {
        Context::jump(bootstrap, to, 0)
    }

    /// Abandons the running context for good and returns `value` to the bootstrap stack.
    ///
    /// # Safety
    /// `bootstrap` must have been suspended by [`Context::enter`].
    pub(crate) unsafe fn leave(bootstrap: *const Context, value: usize) -> ! {
        let mut abandoned = mem::MaybeUninit::<Context>::uninit();
        Context::jump(abandoned.as_mut_ptr(), bootstrap, value);
        unreachable!("resumed an abandoned context");
    }
}

fn align_down(pointer: *mut u8, alignment: usize) -> *mut u8 {
    let misalignment = pointer as usize % alignment;
    pointer.wrapping_sub(misalignment)
}

#[cfg(target_arch = "x86_64")]
mod arch {
    /// Control word, r15, r14, r13, r12, rbx, rbp and the return address.
    pub(super) const FRAME_WORDS: usize = 8;

    const MXCSR_DEFAULT: usize = 0x1f80;
    const X87_CONTROL_DEFAULT: usize = 0x037f;

    pub(super) unsafe fn prepare_frame(frame: *mut usize, entry: usize) {
        frame.write(MXCSR_DEFAULT | X87_CONTROL_DEFAULT << 32);
        frame.add(FRAME_WORDS - 1).write(entry);
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    /// d8-d15, x19-x28, x29 and x30.
    pub(super) const FRAME_WORDS: usize = 20;

    pub(super) unsafe fn prepare_frame(frame: *mut usize, entry: usize) {
        frame.add(FRAME_WORDS - 1).write(entry);
    }
}

#[cfg(target_arch = "arm")]
mod arch {
    /// d8-d15 (two words each), r4-r12 and lr.
    pub(super) const FRAME_WORDS: usize = 26;

    pub(super) unsafe fn prepare_frame(frame: *mut usize, entry: usize) {
        frame.add(FRAME_WORDS - 1).write(entry);
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
compile_error!("strand only supports x86_64, aarch64 and arm");

#[cfg(all(target_arch = "arm", not(target_feature = "vfp2")))]
compile_error!("strand only supports arm with a VFP unit");

#[cfg(target_arch = "x86_64")]
global_asm!(include_str!("assembly/x86_64.s"), options(raw));

#[cfg(target_arch = "aarch64")]
global_asm!(include_str!("assembly/aarch64.s"), options(raw));

#[cfg(target_arch = "arm")]
global_asm!(include_str!("assembly/arm.s"), options(raw));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stack::Stack;
    use std::num::NonZeroUsize;

    struct Probe {
        bootstrap: Context,
        fiber: Context,
        sentinel: usize,
        resumed: usize,
    }

    impl Probe {
        fn new() -> Self {
            Probe {
                bootstrap: Context::bootstrap(),
                fiber: Context::bootstrap(),
                sentinel: 0,
                resumed: 0,
            }
        }
    }

    extern "C" fn write_sentinel(argument: *mut ffi::c_void) -> ! {
        let probe = argument.cast::<Probe>();
        unsafe {
            (*probe).sentinel = 0xc0ffee;
            Context::leave(ptr::addr_of!((*probe).bootstrap), 42)
        }
    }

    extern "C" fn ping_pong(argument: *mut ffi::c_void) -> ! {
        let probe = argument.cast::<Probe>();
        unsafe {
            for round in 1..=2 {
                let resumed = Context::jump(ptr::addr_of_mut!((*probe).fiber), ptr::addr_of!((*probe).bootstrap), round);
                (*probe).resumed += resumed;
            }
            Context::leave(ptr::addr_of!((*probe).bootstrap), 3)
        }
    }

    fn stack() -> Stack {
        Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(4).unwrap()).unwrap()
    }

    /// Prepares `probe.fiber` on `stack` and returns pointers to the bootstrap and fiber contexts.
    fn prepare(stack: &Stack, probe: &mut Probe, entry: Entry) -> (*mut Context, *mut Context) {
        let probe: *mut Probe = probe;
        unsafe {
            (*probe).fiber = Context::new(stack.bottom(), stack.top(), entry, probe.cast());
            (ptr::addr_of_mut!((*probe).bootstrap), ptr::addr_of_mut!((*probe).fiber))
        }
    }

    mod enter {
        use super::*;

        #[test]
        fn first_switch_calls_entry_with_argument() {
            let stack = stack();
            let mut probe = Probe::new();
            let (bootstrap, fiber) = prepare(&stack, &mut probe, write_sentinel);

            let value = unsafe { Context::enter(bootstrap, fiber) };

            assert_eq!(value, 42);
            assert_eq!(probe.sentinel, 0xc0ffee);
        }

        #[test]
        fn resumes_where_it_left_off() {
            let stack = stack();
            let mut probe = Probe::new();
            let (bootstrap, fiber) = prepare(&stack, &mut probe, ping_pong);

            let first = unsafe { Context::enter(bootstrap, fiber) };
            let second = unsafe { Context::jump(bootstrap, fiber, 10) };
            let third = unsafe { Context::jump(bootstrap, fiber, 20) };

            assert_eq!((first, second, third), (1, 2, 3));
            assert_eq!(probe.resumed, 30);
        }
    }

    mod reset {
        use super::*;

        #[test]
        fn writes_watermark_at_bottom() {
            let stack = stack();
            let mut probe = Probe::new();
            let (_, fiber) = prepare(&stack, &mut probe, write_sentinel);

            unsafe { stack.bottom().write(0) };
            assert!(unsafe { (*fiber).is_overflowed() });

            unsafe { (*fiber).reset() };
            assert!(unsafe { !(*fiber).is_overflowed() });
        }

        #[test]
        fn enters_again_after_reset() {
            let stack = stack();
            let mut probe = Probe::new();
            let (bootstrap, fiber) = prepare(&stack, &mut probe, write_sentinel);

            unsafe {
                Context::enter(bootstrap, fiber);
                (*fiber).reset();
            }
            probe.sentinel = 0;
            let value = unsafe { Context::enter(ptr::addr_of_mut!(probe.bootstrap), ptr::addr_of!(probe.fiber)) };

            assert_eq!(value, 42);
            assert_eq!(probe.sentinel, 0xc0ffee);
        }
    }

    mod stack_usage {
        use super::*;

        #[test]
        fn only_register_file_used_before_entry() {
            let stack = stack();
            let mut probe = Probe::new();
            let (_, fiber) = prepare(&stack, &mut probe, write_sentinel);
            unsafe { (*fiber).paint() };

            let usage = probe.fiber.stack_usage();

            assert!(usage > 0);
            assert!(usage <= MINIMUM_SIZE);
        }

        #[test]
        fn grows_after_running() {
            let stack = stack();
            let mut probe = Probe::new();
            let (bootstrap, fiber) = prepare(&stack, &mut probe, write_sentinel);
            let before = unsafe {
                (*fiber).paint();
                (*fiber).stack_usage()
            };

            unsafe { Context::enter(bootstrap, fiber) };

            assert!(probe.fiber.stack_usage() > before);
            assert!(probe.fiber.stack_usage() < probe.fiber.stack_size());
        }
    }

    mod is_overflowed {
        use super::*;

        #[test]
        fn bootstrap_never_overflows() {
            assert!(!Context::bootstrap().is_overflowed());
        }

        #[test]
        fn detects_stack_pointer_below_bottom() {
            let stack = stack();
            let mut probe = Probe::new();
            prepare(&stack, &mut probe, write_sentinel);

            probe.fiber.sp = stack.bottom().wrapping_sub(1);

            assert!(probe.fiber.is_overflowed());
        }

        #[test]
        fn intact_after_preparing() {
            let stack = stack();
            let mut probe = Probe::new();
            prepare(&stack, &mut probe, write_sentinel);

            assert!(!probe.fiber.is_overflowed());
        }
    }
}
