//! Execution contexts and the symmetric switch between them.
//!
//! A [`Context`] is the bookkeeping for one flow of control: where its
//! registers were saved when it last switched away, which stack range it runs
//! on and who is driving it. A [`Task`] is a context that owns the stack it
//! runs on.
//!
//! Everything here is deliberately low level. [`Enumerator`] is the safe
//! abstraction built on top of it.
//!
//! [`Enumerator`]: crate::Enumerator

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr;

pub use crate::arch::EntryFn;
use crate::arch::{self, RegisterFrame};
use crate::bounds::{self, StackBounds};
#[cfg(feature = "default-stack")]
use crate::error::Error;
use crate::stack::{self, DefaultStack};

/// Lifecycle of a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// The task owns a stack but no entry frame has been written to it.
    Uninitialized,
    /// The bootstrap frame is in place; the task has never run.
    Ready,
    /// The task is executing. Exactly one context per thread is in this state.
    Running,
    /// The task switched away and can be resumed.
    Suspended,
    /// The task completed and must never be resumed.
    Finished,
}

/// Saved state of a flow of control that can be switched to and from.
///
/// A context must stay at the same address between the time it switches away
/// and the time it is resumed, since the switch writes the saved frame
/// pointer into it and the owner link of other contexts may point at it.
pub struct Context {
    // Register snapshot on top of this context's stack. Only meaningful while
    // the context is Ready or Suspended.
    frame: Cell<*mut RegisterFrame>,

    // Stack range installed in the thread's descriptor while this context
    // runs. Refreshed from the descriptor every time it switches away.
    bounds: Cell<Option<StackBounds>>,

    // Context that switch_to_owner returns to. Not an ownership edge.
    owner: Cell<*const Context>,

    state: Cell<TaskState>,

    // Contexts are bound to the thread that runs them.
    marker: PhantomData<*mut ()>,
}

impl Context {
    /// Creates a context representing the code that is running right now,
    /// typically on the thread's own stack.
    ///
    /// It can be switched away from and later resumed, but it has no stack of
    /// its own and no entry point.
    pub fn current() -> Self {
        Self::with_state(TaskState::Running, bounds::capture())
    }

    fn with_state(state: TaskState, bounds: Option<StackBounds>) -> Self {
        Self {
            frame: Cell::new(ptr::null_mut()),
            bounds: Cell::new(bounds),
            owner: Cell::new(ptr::null()),
            state: Cell::new(state),
            marker: PhantomData,
        }
    }

    /// Returns the lifecycle state of this context.
    #[inline]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Returns the stack range recorded for this context.
    #[inline]
    pub fn bounds(&self) -> Option<StackBounds> {
        self.bounds.get()
    }

    /// Sets the context that [`Context::switch_to_owner`] returns to.
    #[inline]
    pub fn set_owner(&self, owner: &Context) {
        self.owner.set(owner);
    }

    /// Marks this context as finished. It must not be resumed afterwards,
    /// which allows its stack to be released once it has switched away for
    /// the last time.
    #[inline]
    pub fn finish(&self) {
        self.state.set(TaskState::Finished);
    }

    /// Suspends `outgoing`, which must be the running context, and resumes
    /// `self`.
    ///
    /// Before any register is touched, the thread's stack-bounds descriptor is
    /// captured into `outgoing` and replaced with the bounds of `self`. The
    /// call returns when some later switch targets `outgoing` again.
    ///
    /// # Safety
    ///
    /// - `outgoing` must describe the code that is currently executing.
    /// - `self` must be `Ready` or `Suspended`, and must have been suspended
    ///   on this thread.
    /// - Both contexts must stay at their current address until `outgoing`
    ///   is resumed.
    #[inline]
    pub unsafe fn switch_to(&self, outgoing: &Context) {
        debug_assert!(
            matches!(self.state(), TaskState::Ready | TaskState::Suspended),
            "switch to a context in state {:?}",
            self.state()
        );
        debug_assert!(!ptr::eq(self, outgoing), "switch to the running context");

        let target = self.frame.replace(ptr::null_mut());

        outgoing.bounds.set(bounds::capture());
        bounds::install(self.bounds.get());

        if outgoing.state() != TaskState::Finished {
            outgoing.state.set(TaskState::Suspended);
        }
        self.state.set(TaskState::Running);

        arch::switch_registers(target, outgoing.frame.as_ptr());
    }

    /// Switches from `self`, which must be the running context, back to its
    /// owner.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Context::switch_to`], with the owner as the
    /// target. An owner must have been set.
    #[inline]
    pub unsafe fn switch_to_owner(&self) {
        let owner = self.owner.get();
        debug_assert!(!owner.is_null(), "context has no owner");
        (*owner).switch_to(self);
    }
}

/// An execution context together with the stack it runs on.
pub struct Task<S: stack::Stack = DefaultStack> {
    context: Context,
    stack: S,
}

/// Builds a ready-to-run task on a freshly allocated [`DefaultStack`] of
/// [`DEFAULT_STACK_SIZE`] bytes.
///
/// The first switch into the returned task calls
/// `entry(args[0], args[1], args[2], args[3])` on the new stack.
///
/// [`DEFAULT_STACK_SIZE`]: crate::stack::DEFAULT_STACK_SIZE
#[cfg(feature = "default-stack")]
pub fn create_context(entry: EntryFn, args: [usize; 4]) -> Result<Task, Error> {
    let stack = DefaultStack::new(stack::DEFAULT_STACK_SIZE)?;
    Ok(Task::with_stack(stack, entry, args))
}

impl<S: stack::Stack> Task<S> {
    /// Wraps `stack` in a task without writing any entry frame to it.
    ///
    /// The task cannot be switched to until [`Task::prime`] is called.
    pub fn from_stack(stack: S) -> Self {
        let bounds = stack.bounds();
        Self {
            context: Context::with_state(TaskState::Uninitialized, Some(bounds)),
            stack,
        }
    }

    /// Builds a task on `stack` whose first run calls
    /// `entry(args[0], args[1], args[2], args[3])`.
    pub fn with_stack(stack: S, entry: EntryFn, args: [usize; 4]) -> Self {
        let task = Self::from_stack(stack);
        task.prime(entry, args);
        task
    }

    /// Writes the bootstrap frame at the base of the stack.
    ///
    /// # Panics
    ///
    /// Panics if the task has already been primed.
    pub fn prime(&self, entry: EntryFn, args: [usize; 4]) {
        assert_eq!(
            self.context.state(),
            TaskState::Uninitialized,
            "task has already been primed"
        );

        unsafe {
            let frame = arch::init_frame(self.stack.base().get(), entry, args);
            self.context.frame.set(frame);
        }
        self.context.state.set(TaskState::Ready);
        log::trace!(
            "primed task on stack {:#x}..{:#x}",
            self.stack.limit(),
            self.stack.base()
        );
    }

    /// Returns the stack this task runs on.
    #[inline]
    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Releases the stack so it can be reused by another task.
    ///
    /// # Panics
    ///
    /// Panics if the task is running or suspended: its stack still holds live
    /// frames.
    pub fn into_stack(self) -> S {
        assert!(
            !matches!(self.state(), TaskState::Running | TaskState::Suspended),
            "cannot extract stack from an incomplete task"
        );

        #[cfg_attr(not(windows), allow(unused_mut))]
        let mut this = ManuallyDrop::new(self);
        #[cfg(windows)]
        this.sync_stack_bounds();
        unsafe { ptr::read(&this.stack) }
    }

    // Hands the grown TEB limit back to the stack so it is accurate if the
    // stack is reused.
    #[cfg(windows)]
    fn sync_stack_bounds(&mut self) {
        if let Some(bounds) = self.context.bounds() {
            self.stack.update_bounds(bounds);
        }
    }
}

impl<S: stack::Stack> Deref for Task<S> {
    type Target = Context;

    #[inline]
    fn deref(&self) -> &Context {
        &self.context
    }
}

impl<S: stack::Stack> Drop for Task<S> {
    fn drop(&mut self) {
        match self.state() {
            TaskState::Running => {
                // Freeing the stack we are executing on cannot be recovered
                // from.
                log::error!("task dropped while running on its own stack");
                std::process::abort();
            }
            TaskState::Suspended => {
                log::error!("task dropped while suspended, its stack frames are leaked");
            }
            _ => {}
        }

        #[cfg(windows)]
        self.sync_stack_bounds();
    }
}
