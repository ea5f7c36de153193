//! Stacks on Windows are described to the OS through the TEB, and the kernel
//! grows them lazily:
//!
//! ```text
//! +------------------+  <- TEB.StackBase
//! |                  |
//! ~ Committed stack  ~  [MEM_COMMIT + PAGE_READWRITE]
//! |                  |
//! +------------------+  <- TEB.StackLimit
//! | Guard pages      |  [MEM_COMMIT + PAGE_READWRITE + PAGE_GUARD]
//! | + guarantee      |
//! +------------------+
//! |                  |
//! ~ Reserved stack   ~  [MEM_RESERVE]
//! |                  |
//! +------------------+
//! | Hard guard page  |  [MEM_RESERVE]
//! +------------------+  <- TEB.DeallocationStack
//! ```
//!
//! Touching a `PAGE_GUARD` page makes the kernel commit it and move the guard
//! pages (and `TEB.StackLimit`) one page down. The extra "guarantee" pages,
//! sized by `SetThreadStackGuarantee`, give the stack overflow handler room
//! to run once the reserve is exhausted.
//!
//! The kernel and the unwinder both consult the TEB fields, which is why a
//! context switch has to install the bounds of the target stack before any
//! code runs on it, and why `TEB.StackLimit` has to be read back when
//! switching away: it is the only record of how far the stack has grown.

use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_GUARD, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::SetThreadStackGuarantee;

use super::{Stack, StackPointer, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::bounds::StackBounds;
use crate::error::Error;

fn page_size() -> usize {
    unsafe {
        let mut sysinfo: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut sysinfo);
        assert!(sysinfo.dwPageSize.is_power_of_two());
        sysinfo.dwPageSize as usize
    }
}

fn page_round_up(val: usize, page_size: usize) -> usize {
    (val + page_size - 1) & !(page_size - 1)
}

fn get_thread_stack_guarantee(page_size: usize) -> usize {
    // A zero argument queries the current guarantee without changing it.
    let mut stack_guarantee = 0;
    unsafe {
        SetThreadStackGuarantee(&mut stack_guarantee);
    }

    // The overflow handler needs at least one whole page to run in.
    page_round_up((stack_guarantee as usize).max(page_size), page_size)
}

fn guard_page_size(page_size: usize) -> usize {
    if cfg!(target_pointer_width = "64") {
        2 * page_size
    } else {
        page_size
    }
}

/// Default stack implementation which uses `VirtualAlloc`.
pub struct DefaultStack {
    base: StackPointer,
    limit: usize,
    deallocation_stack: StackPointer,
    size: usize,
}

impl DefaultStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> Result<Self, Error> {
        // Tiny requests still get a usable stack.
        let size = size.max(MIN_STACK_SIZE);

        // Below the usable range sit the PAGE_GUARD pages the kernel moves
        // down as the stack grows, the overflow handler's guarantee and one
        // never-committed page at the very bottom.
        let page_size = page_size();
        let guard_size = guard_page_size(page_size);
        let stack_guarantee = get_thread_stack_guarantee(page_size);
        let extra_pages = guard_size + stack_guarantee + page_size;

        // Overflowing the address space is reported, not wrapped.
        let alloc_len = size
            .checked_add(extra_pages + page_size - 1)
            .ok_or(Error::StackSizeOverflow { size })?
            & !(page_size - 1);

        unsafe {
            // Address space only; pages are committed below.
            let alloc_base = VirtualAlloc(ptr::null(), alloc_len, MEM_RESERVE, PAGE_READWRITE);
            if alloc_base.is_null() {
                return Err(Error::exhausted(size));
            }

            // From here on the reservation is owned by `out`, so an early
            // return releases it.
            let alloc_top = alloc_base as usize + alloc_len;
            let limit = alloc_top - page_round_up(MIN_STACK_SIZE, page_size);
            let out = Self {
                base: StackPointer::new_unchecked(alloc_top),
                limit,
                deallocation_stack: StackPointer::new_unchecked(alloc_base as usize),
                size,
            };

            // Only the top of the stack starts out committed.
            if VirtualAlloc(
                limit as *mut _,
                alloc_top - limit,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
            .is_null()
            {
                return Err(Error::exhausted(size));
            }

            // The kernel commits further pages on demand as these are touched.
            let stack_guard_size = guard_size + stack_guarantee;
            if VirtualAlloc(
                (limit - stack_guard_size) as *mut _,
                stack_guard_size,
                MEM_COMMIT,
                PAGE_READWRITE | PAGE_GUARD,
            )
            .is_null()
            {
                return Err(Error::exhausted(size));
            }

            log::trace!("reserved {} byte stack at {:#x}", alloc_len, alloc_base as usize);
            Ok(out)
        }
    }

    /// Returns the number of usable bytes requested for this stack.
    pub fn size(&self) -> usize {
        self.size
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
            let alloc_base = self.deallocation_stack.get() as *mut _;
            let ret = VirtualFree(alloc_base, 0, MEM_RELEASE);
            debug_assert!(ret != 0);
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
        self.deallocation_stack
    }

    #[inline]
    fn bounds(&self) -> StackBounds {
        StackBounds {
            base: self.base.get(),
            limit: self.limit,
            deallocation: self.deallocation_stack.get(),
        }
    }

    #[inline]
    fn update_bounds(&mut self, bounds: StackBounds) {
        debug_assert_eq!(bounds.base, self.base.get());
        self.limit = bounds.limit;
    }
}
