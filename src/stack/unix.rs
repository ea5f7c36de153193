use std::ptr;

use super::{Stack, StackPointer, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::bounds::StackBounds;
use crate::error::Error;

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Default stack implementation which uses `mmap`.
///
/// The lowest page of the mapping is left inaccessible so that overflowing
/// the stack faults instead of silently corrupting adjacent memory.
pub struct DefaultStack {
    base: StackPointer,
    mmap_len: usize,
    page_size: usize,
}

impl DefaultStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> Result<Self, Error> {
        // Tiny requests still get a usable stack.
        let size = size.max(MIN_STACK_SIZE);

        // One extra page below the usable range is the guard. Anything that
        // does not fit in the address space is reported, not wrapped.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .ok_or(Error::StackSizeOverflow { size })?
            & !(page_size - 1);

        // OpenBSD refuses to run on memory that was not mapped with MAP_STACK.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            // Map the whole range inaccessible first.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::exhausted(size));
            }

            // From here on the mapping is owned by `out`, so an early return
            // unmaps it.
            let out = Self {
                base: StackPointer::new_unchecked(mmap as usize + mmap_len),
                mmap_len,
                page_size,
            };

            // Open up everything above the guard page.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::exhausted(size));
            }

            log::trace!("mapped {} byte stack at {:#x}", mmap_len, mmap as usize);
            Ok(out)
        }
    }

    /// Returns the number of usable bytes, excluding the guard page.
    pub fn size(&self) -> usize {
        self.mmap_len - self.page_size
    }
}

impl Default for DefaultStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl Drop for DefaultStack {
    fn drop(&mut self) {
        unsafe {
            let mmap = self.base.get() - self.mmap_len;
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

unsafe impl Stack for DefaultStack {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.base.get() - self.mmap_len) }
    }

    // Overflow checks should stop at the guard page, not inside it.
    #[inline]
    fn bounds(&self) -> StackBounds {
        StackBounds::new(self.base.get(), self.limit().get() + self.page_size)
    }
}
