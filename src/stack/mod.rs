//! Details about stacks used by tasks.
//!
//! In most cases, just using the default stack implementation is sufficient.
//! However it is possible to use a custom `Stack` implementation if more
//! control is desired.

use core::num::NonZeroUsize;

use crate::bounds::StackBounds;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "default-stack", unix))] {
        mod unix;
        pub use self::unix::DefaultStack;
    } else if #[cfg(all(feature = "default-stack", windows))] {
        mod windows;
        pub use self::windows::DefaultStack;
    } else {
        /// Dummy stack for platforms that do not provide a default stack.
        ///
        /// This is only here for use as a default generic parameter.
        pub struct DefaultStack;
    }
}

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Usable size of the stack allocated by `DefaultStack::default`.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// A trait for objects that hold ownership of a stack.
///
/// # Safety
///
/// To preserve memory safety, a stack must have a guard page which catches
/// stack overflows. It must also contain at least [`MIN_STACK_SIZE`] bytes of
/// usable memory, and its base must stay at the same address for as long as
/// the object lives: a task keeps raw pointers into it.
pub unsafe trait Stack {
    /// Returns the base address of the stack. This is the highest address since
    /// stacks grow downwards on most modern architectures.
    ///
    /// Must be aligned to [`STACK_ALIGNMENT`].
    fn base(&self) -> StackPointer;

    /// Returns the maximum limit address of the stack. This is the lowest
    /// address since stacks grow downwards on most modern architectures.
    ///
    /// This limit must include any guard pages in the stack.
    ///
    /// Must be aligned to [`STACK_ALIGNMENT`].
    fn limit(&self) -> StackPointer;

    /// Returns the bounds that are installed in the thread's stack-bounds
    /// descriptor while code runs on this stack.
    #[cfg(not(windows))]
    fn bounds(&self) -> StackBounds {
        StackBounds::new(self.base().get(), self.limit().get())
    }

    /// Returns the bounds that are installed in the TEB while code runs on
    /// this stack.
    #[cfg(windows)]
    fn bounds(&self) -> StackBounds;

    /// Records bounds captured from the TEB after running on this stack. The
    /// committed limit moves down as guard pages are consumed.
    #[cfg(windows)]
    fn update_bounds(&mut self, bounds: StackBounds);
}

/// A mutable reference to a stack can be used as a stack. The lifetime of the
/// resulting task will be bound to that of the reference.
unsafe impl<'a, S: Stack> Stack for &'a mut S {
    #[inline]
    fn base(&self) -> StackPointer {
        (**self).base()
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        (**self).limit()
    }

    #[inline]
    fn bounds(&self) -> StackBounds {
        (**self).bounds()
    }

    #[inline]
    #[cfg(windows)]
    fn update_bounds(&mut self, bounds: StackBounds) {
        (**self).update_bounds(bounds)
    }
}

#[cfg(feature = "default-stack")]
#[test]
fn assert_send_sync() {
    fn send<T: Send>() {}
    fn sync<T: Sync>() {}
    send::<DefaultStack>();
    sync::<DefaultStack>();
}
