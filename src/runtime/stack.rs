//! Memory that fibers run on.
//!
//! A stack is either mapped by the kernel with guard pages beneath it, or borrowed from the caller for the rest of the program.
//! Static buffers are the usual choice when the fiber set is fixed at startup.

use std::num::NonZeroUsize;
use std::{ffi, fmt, io, ptr};

/// Memory region exclusively owned by one fiber for its whole lifetime.
pub struct Stack(Memory);

enum Memory {
    Mapped { pointer: *mut u8, length: usize, guard: usize },
    Borrowed { pointer: *mut u8, length: usize },
}

impl Stack {
    /// Allocates a general purpose stack.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The stack is protected from overflow using guard pages.
    pub fn new(guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> io::Result<Self> {
        let (guard_pages, usable_pages) = (guard_pages.get(), usable_pages.get());

        let page_size = page_size();
        let length = (guard_pages + usable_pages) * page_size;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack(Memory::Mapped {
            pointer: pointer as *mut u8,
            length,
            guard: guard_pages * page_size,
        });

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard_pages * page_size, libc::PROT_NONE) };
        if result == -1 {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        Ok(stack)
    }

    /// Allocates a stack of at least `bytes` usable bytes, rounded up to whole pages.
    pub fn with_size(bytes: usize, guard_pages: NonZeroUsize) -> io::Result<Self> {
        let pages = bytes.div_ceil(page_size());
        let usable_pages = NonZeroUsize::new(pages).unwrap_or(NonZeroUsize::MIN);
        Stack::new(guard_pages, usable_pages)
    }

    /// Runs a fiber on a caller provided buffer, typically a `static`.
    ///
    /// There's no guard page beneath the buffer, overflow is only caught by the watermark check.
    pub fn from_buffer(buffer: &'static mut [u8]) -> Self {
        Stack(Memory::Borrowed {
            pointer: buffer.as_mut_ptr(),
            length: buffer.len(),
        })
    }

    /// Lowest usable address, where the watermark lives.
    pub(crate) fn bottom(&self) -> *mut u8 {
        match self.0 {
            // safety: part of same allocation, guard is smaller than length
            Memory::Mapped { pointer, guard, .. } => unsafe { pointer.add(guard) },
            Memory::Borrowed { pointer, .. } => pointer,
        }
    }

    /// One past the highest usable address, stack addresses grow downwards from here.
    pub(crate) fn top(&self) -> *mut u8 {
        match self.0 {
            // safety: part of same allocation, can't overflow
            Memory::Mapped { pointer, length, .. } => unsafe { pointer.add(length) },
            Memory::Borrowed { pointer, length } => unsafe { pointer.add(length) },
        }
    }

    /// Number of usable bytes, excluding guard pages.
    pub fn len(&self) -> usize {
        self.top() as usize - self.bottom() as usize
    }

    /// Whether there are no usable bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0 {
            Memory::Mapped { .. } => "mapped",
            Memory::Borrowed { .. } => "borrowed",
        };

        f.debug_struct("Stack")
            .field("kind", &kind)
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .finish()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Memory::Mapped { pointer, length, .. } = self.0 {
            let result = unsafe { libc::munmap(pointer as *mut ffi::c_void, length) };
            assert_eq!(result, 0);
        }
    }
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.top();
        unsafe {
            let pointer = pointer.sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn bottom_is_above_guard() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();

        assert_eq!(stack.len(), page_size());
        unsafe {
            stack.bottom().write(123);
            assert_eq!(stack.bottom().read(), 123);
        }
    }

    #[test]
    fn rounds_up_to_pages() {
        let stack = Stack::with_size(page_size() + 1, NonZeroUsize::MIN).unwrap();

        assert_eq!(stack.len(), 2 * page_size());
    }

    #[test]
    fn zero_size_gets_a_page() {
        let stack = Stack::with_size(0, NonZeroUsize::MIN).unwrap();

        assert_eq!(stack.len(), page_size());
    }

    #[test]
    fn borrows_whole_buffer() {
        let buffer = Box::leak(vec![0u8; 1000].into_boxed_slice());
        let start = buffer.as_ptr();

        let stack = Stack::from_buffer(buffer);

        assert_eq!(stack.len(), 1000);
        assert_eq!(stack.bottom() as *const u8, start);
    }

    #[test]
    #[ignore = "aborts process"]
    fn overflow() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.top();
        unsafe {
            let pointer = pointer.sub(page_size() + 1);
            pointer.write(123);
        }
    }
}
