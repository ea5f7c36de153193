//! The per-thread stack-bounds descriptor.
//!
//! Code that checks for stack overflow, and on Windows the OS exception
//! dispatcher itself, needs to know the range of the stack it is currently
//! running on. When execution moves to another stack this record has to move
//! with it, otherwise overflow checks compare against the wrong range and the
//! Windows unwinder rejects frames as lying outside the stack.
//!
//! On Windows the descriptor is the `StackBase`, `StackLimit` and
//! `DeallocationStack` fields of the Thread Environment Block. Elsewhere the
//! OS keeps no such record for user code, so the descriptor is a thread-local
//! that is `None` until the thread first switches onto a task stack.
//!
//! The descriptor is only modified by `Context::switch_to`, which captures it
//! into the outgoing context and installs the target's bounds.

use crate::arch;

/// Address range of a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest address of the stack.
    pub base: usize,

    /// Lowest address that may be used.
    pub limit: usize,

    /// Lowest address of the stack allocation, including guard pages.
    #[cfg(windows)]
    pub deallocation: usize,
}

impl StackBounds {
    /// Creates bounds for the stack between `limit` and `base`.
    #[cfg(not(windows))]
    pub const fn new(base: usize, limit: usize) -> Self {
        Self { base, limit }
    }

    /// Creates bounds for the stack between `limit` and `base`.
    #[cfg(windows)]
    pub const fn new(base: usize, limit: usize) -> Self {
        Self {
            base,
            limit,
            deallocation: limit,
        }
    }

    /// Whether `stack_ptr` lies within these bounds.
    #[inline]
    pub fn contains(&self, stack_ptr: usize) -> bool {
        stack_ptr > self.limit && stack_ptr <= self.base
    }

    /// Number of bytes between `stack_ptr` and the limit, or `None` if
    /// `stack_ptr` is not on this stack.
    #[inline]
    pub fn remaining(&self, stack_ptr: usize) -> Option<usize> {
        if self.contains(stack_ptr) {
            Some(stack_ptr - self.limit)
        } else {
            None
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        use core::arch::asm;

        /// Reads the descriptor of the current thread.
        #[inline]
        pub fn capture() -> Option<StackBounds> {
            let (base, limit, deallocation): (usize, usize, usize);
            unsafe {
                asm!(
                    "mov {base}, qword ptr gs:[0x8]",
                    "mov {limit}, qword ptr gs:[0x10]",
                    "mov {dealloc}, qword ptr gs:[0x1478]",
                    base = out(reg) base,
                    limit = out(reg) limit,
                    dealloc = out(reg) deallocation,
                    options(nostack, readonly, preserves_flags),
                );
            }
            Some(StackBounds { base, limit, deallocation })
        }

        /// Overwrites the descriptor of the current thread.
        ///
        /// # Safety
        ///
        /// The stack pointer must be moved into the installed range before
        /// anything that consults the descriptor runs.
        #[inline]
        pub(crate) unsafe fn install(bounds: Option<StackBounds>) {
            // The TEB always describes some stack, there is nothing to clear.
            if let Some(bounds) = bounds {
                asm!(
                    "mov qword ptr gs:[0x8], {base}",
                    "mov qword ptr gs:[0x10], {limit}",
                    "mov qword ptr gs:[0x1478], {dealloc}",
                    base = in(reg) bounds.base,
                    limit = in(reg) bounds.limit,
                    dealloc = in(reg) bounds.deallocation,
                    options(nostack, preserves_flags),
                );
            }
        }
    } else {
        use std::cell::Cell;

        std::thread_local! {
            static DESCRIPTOR: Cell<Option<StackBounds>> = const { Cell::new(None) };
        }

        /// Reads the descriptor of the current thread.
        #[inline]
        pub fn capture() -> Option<StackBounds> {
            DESCRIPTOR.with(Cell::get)
        }

        /// Overwrites the descriptor of the current thread.
        ///
        /// # Safety
        ///
        /// The stack pointer must be moved into the installed range before
        /// anything that consults the descriptor runs.
        #[inline]
        pub(crate) unsafe fn install(bounds: Option<StackBounds>) {
            DESCRIPTOR.with(|d| d.set(bounds));
        }
    }
}

/// Returns how many bytes of stack are left below the current stack pointer,
/// according to the thread's stack-bounds descriptor.
///
/// Returns `None` when the descriptor does not describe the stack that is
/// actually in use, which is the case on the native thread stack of
/// non-Windows targets.
pub fn remaining_stack() -> Option<usize> {
    capture()?.remaining(arch::current_stack_ptr())
}
