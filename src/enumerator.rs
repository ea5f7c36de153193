use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use core::ptr::NonNull;
use std::boxed::Box;

use crate::bounds;
#[cfg(feature = "default-stack")]
use crate::error::Error;
use crate::stack::{self, DefaultStack};
use crate::task::{Context, Task};
use crate::unwind::{self, CaughtPanic, Exit};

type Routine<'a, Y> = Box<dyn FnOnce(&YieldBuffer<Y>) + 'a>;

/// State shared between an enumerator and the routine it drives.
struct Control {
    /// The code that called `advance`. Resumed on every yield.
    caller: Context,

    /// Context of the worker task, used by `yield_return` to switch back.
    worker: Cell<*const Context>,

    started: Cell<bool>,
    finished: Cell<bool>,
    cancel_requested: Cell<bool>,
}

/// Everything an enumerator owns. Boxed so that the addresses handed to the
/// worker stack never move.
struct Inner<'a, Y, S: stack::Stack> {
    control: Control,
    buffer: YieldBuffer<Y>,
    worker: Task<S>,
    routine: Cell<Option<Routine<'a, Y>>>,

    /// Panic raised by the routine, waiting to be resumed on the caller stack.
    panic: Cell<Option<CaughtPanic>>,
}

/// A lazily evaluated sequence produced by a routine running on its own stack.
///
/// The routine receives a [`YieldBuffer`] and calls
/// [`YieldBuffer::yield_return`] once per element. Each call to
/// [`Enumerator::advance`] runs the routine until it yields the next element
/// or returns; nothing runs between calls.
///
/// Dropping an enumerator whose routine is suspended in the middle of a yield
/// unwinds the routine's stack, so every value it holds is dropped normally.
/// This requires unwinding support: with `panic = "abort"` the process aborts
/// instead.
///
/// Enumerators are bound to the thread that created them.
pub struct Enumerator<'a, Y, S: stack::Stack = DefaultStack> {
    inner: NonNull<Inner<'a, Y, S>>,
    marker: PhantomData<(Box<Inner<'a, Y, S>>, *mut ())>,
}

#[cfg(feature = "default-stack")]
impl<'a, Y> Enumerator<'a, Y, DefaultStack> {
    /// Creates an enumerator for `routine` on a newly allocated stack of
    /// [`DEFAULT_STACK_SIZE`] bytes.
    ///
    /// The routine does not run until the first call to [`advance`].
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be allocated. Use [`Enumerator::try_new`]
    /// to handle that case.
    ///
    /// [`DEFAULT_STACK_SIZE`]: crate::stack::DEFAULT_STACK_SIZE
    /// [`advance`]: Enumerator::advance
    pub fn new<F>(routine: F) -> Self
    where
        F: FnOnce(&YieldBuffer<Y>) + 'a,
    {
        match Self::try_new(routine) {
            Ok(enumerator) => enumerator,
            Err(err) => panic!("failed to create enumerator: {}", err),
        }
    }

    /// Same as [`Enumerator::new`], but reports a failure to allocate the
    /// stack instead of panicking.
    pub fn try_new<F>(routine: F) -> Result<Self, Error>
    where
        F: FnOnce(&YieldBuffer<Y>) + 'a,
    {
        let stack = DefaultStack::new(stack::DEFAULT_STACK_SIZE)?;
        Ok(Self::with_stack(stack, routine))
    }
}

impl<'a, Y, S: stack::Stack> Enumerator<'a, Y, S> {
    /// Creates an enumerator for `routine` that runs on the given stack.
    ///
    /// The stack can be recovered with [`Enumerator::into_stack`] once the
    /// routine has finished.
    pub fn with_stack<F>(stack: S, routine: F) -> Self
    where
        F: FnOnce(&YieldBuffer<Y>) + 'a,
    {
        let inner = Box::new(Inner {
            control: Control {
                caller: Context::current(),
                worker: Cell::new(core::ptr::null()),
                started: Cell::new(false),
                finished: Cell::new(false),
                cancel_requested: Cell::new(false),
            },
            buffer: YieldBuffer {
                slot: UnsafeCell::new(None),
                control: NonNull::dangling(),
                marker: PhantomData,
            },
            worker: Task::from_stack(stack),
            routine: Cell::new(Some(Box::new(routine) as Routine<'a, Y>)),
            panic: Cell::new(None),
        });

        // Link everything up now that the addresses are final.
        unsafe {
            let raw = Box::into_raw(inner);
            (*raw).buffer.control = NonNull::from(&(*raw).control);
            let worker: &Context = &(*raw).worker;
            (*raw).control.worker.set(worker);
            (*raw).worker.set_owner(&(*raw).control.caller);
            (*raw)
                .worker
                .prime(enumerator_entry::<Y, S>, [raw as usize, 0, 0, 0]);

            Self {
                inner: NonNull::new_unchecked(raw),
                marker: PhantomData,
            }
        }
    }

    #[inline]
    fn inner(&self) -> &Inner<'a, Y, S> {
        unsafe { self.inner.as_ref() }
    }

    /// Runs the routine until it yields its next value or returns.
    ///
    /// Returns `true` if a value was yielded, which is then available through
    /// [`Enumerator::current_value`]. Returns `false` once the routine has
    /// finished, and on every call after that.
    ///
    /// If the routine panics, the panic is resumed on the caller's stack from
    /// this function and the enumerator is left finished.
    pub fn advance(&mut self) -> bool {
        let inner = self.inner();
        let control = &inner.control;
        if control.finished.get() {
            return false;
        }

        // The previous value is dropped before the routine runs again.
        unsafe {
            *inner.buffer.slot.get() = None;
        }
        if !control.started.replace(true) {
            log::trace!("starting enumerator routine");
        }

        unsafe {
            inner.worker.switch_to(&control.caller);
        }

        unwind::maybe_resume_unwind(inner.panic.take());
        !control.finished.get()
    }

    /// Returns the value produced by the last successful [`advance`], or
    /// `None` if `advance` has not returned `true` yet or the value was
    /// taken.
    ///
    /// [`advance`]: Enumerator::advance
    #[inline]
    pub fn current_value(&self) -> Option<&Y> {
        unsafe { (*self.inner().buffer.slot.get()).as_ref() }
    }

    /// Moves the value produced by the last successful [`advance`] out of the
    /// enumerator.
    ///
    /// [`advance`]: Enumerator::advance
    #[inline]
    pub fn take_value(&mut self) -> Option<Y> {
        unsafe { (*self.inner().buffer.slot.get()).take() }
    }

    /// Returns whether [`Enumerator::advance`] has been called at least once.
    #[inline]
    pub fn started(&self) -> bool {
        self.inner().control.started.get()
    }

    /// Returns whether the routine has finished, either by returning, by
    /// panicking or by being cancelled.
    #[inline]
    pub fn done(&self) -> bool {
        self.inner().control.finished.get()
    }

    /// Cancels the routine and unwinds its stack.
    ///
    /// If the routine is suspended in a call to [`YieldBuffer::yield_return`],
    /// that call raises a [`Cancelled`] panic which unwinds the routine,
    /// dropping everything it holds. If the routine never started it is
    /// dropped without running. After this returns the enumerator is done.
    ///
    /// This is done automatically when the enumerator is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the routine caught the cancellation and yielded again, or if
    /// it replaced the cancellation with a panic of its own.
    ///
    /// [`Cancelled`]: crate::Cancelled
    pub fn force_unwind(&mut self) {
        let inner = self.inner();
        let control = &inner.control;
        if control.finished.get() {
            return;
        }

        if !control.started.get() {
            // Nothing is on the worker stack yet, so there is nothing to
            // unwind. Dropping the closure releases whatever it captured.
            drop(inner.routine.take());
            control.finished.set(true);
            inner.worker.finish();
            log::trace!("dropped enumerator routine that never ran");
            return;
        }

        self.force_unwind_slow();
    }

    #[cold]
    fn force_unwind_slow(&mut self) {
        let inner = self.inner();
        let control = &inner.control;
        log::debug!("cancelling suspended enumerator routine");

        control.cancel_requested.set(true);
        unsafe {
            *inner.buffer.slot.get() = None;
            inner.worker.switch_to(&control.caller);
        }

        unwind::maybe_resume_unwind(inner.panic.take());
        if !control.finished.get() {
            panic!("enumerator routine yielded after being cancelled");
        }
    }

    /// Extracts the stack from a finished enumerator so that it can be used
    /// again.
    ///
    /// # Panics
    ///
    /// Panics if the routine has not finished.
    pub fn into_stack(self) -> S {
        assert!(self.done(), "cannot extract stack from an unfinished enumerator");

        let this = ManuallyDrop::new(self);
        let inner = unsafe { Box::from_raw(this.inner.as_ptr()) };
        let Inner { worker, .. } = *inner;
        worker.into_stack()
    }
}

impl<'a, Y, S: stack::Stack> Drop for Enumerator<'a, Y, S> {
    fn drop(&mut self) {
        // A panic escaping from here would leave a stack with live frames and
        // nobody to resume them, so it is turned into an abort.
        let guard = scopeguard::guard((), |()| {
            panic!("panicked while cancelling an enumerator routine, aborting");
        });
        self.force_unwind();
        mem::forget(guard);

        unsafe {
            drop(Box::from_raw(self.inner.as_ptr()));
        }
    }
}

impl<'a, Y, S: stack::Stack> Iterator for Enumerator<'a, Y, S> {
    type Item = Y;

    #[inline]
    fn next(&mut self) -> Option<Y> {
        if self.advance() {
            self.take_value()
        } else {
            None
        }
    }
}

impl<'a, Y, S: stack::Stack> FusedIterator for Enumerator<'a, Y, S> {}

impl<'a, Y, S: stack::Stack> fmt::Debug for Enumerator<'a, Y, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enumerator")
            .field("started", &self.started())
            .field("done", &self.done())
            .finish()
    }
}

/// Handle through which a routine hands values to its [`Enumerator`].
///
/// A reference to it is passed to the routine when it starts and is only
/// usable from inside that routine.
pub struct YieldBuffer<Y> {
    slot: UnsafeCell<Option<Y>>,
    control: NonNull<Control>,
    marker: PhantomData<*mut ()>,
}

impl<Y> YieldBuffer<Y> {
    #[inline]
    fn control(&self) -> &Control {
        unsafe { self.control.as_ref() }
    }

    /// Publishes `value` as the enumerator's current value and suspends the
    /// routine until the next call to [`Enumerator::advance`].
    ///
    /// If the enumerator is dropped instead of being advanced, this call does
    /// not return normally: it panics with a [`Cancelled`] payload, which
    /// unwinds the routine.
    ///
    /// [`Cancelled`]: crate::Cancelled
    pub fn yield_return(&self, value: Y) {
        let control = self.control();
        unsafe {
            *self.slot.get() = Some(value);
            (*control.worker.get()).switch_to_owner();
        }

        if control.cancel_requested.get() {
            unwind::raise_cancellation();
        }
    }

    /// Returns whether the enumerator has asked the routine to stop.
    ///
    /// Only observable while the routine is unwinding from a cancellation,
    /// for example in a destructor.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.control().cancel_requested.get()
    }

    /// Returns how many bytes of stack the routine has left.
    #[inline]
    pub fn remaining_stack(&self) -> Option<usize> {
        bounds::remaining_stack()
    }
}

impl<Y> fmt::Debug for YieldBuffer<Y> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YieldBuffer")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// First function executed on the worker stack.
unsafe extern "C" fn enumerator_entry<Y, S: stack::Stack>(
    inner: usize,
    _: usize,
    _: usize,
    _: usize,
) -> ! {
    let inner = &*(inner as *const Inner<'_, Y, S>);
    let control = &inner.control;

    let exit = match inner.routine.take() {
        Some(routine) => unwind::run_at_root(|| routine(&inner.buffer)),
        None => Exit::Returned,
    };

    match exit {
        Exit::Returned => {
            if control.cancel_requested.get() {
                log::warn!("enumerator routine returned normally after being cancelled");
            } else {
                log::trace!("enumerator routine finished");
            }
        }
        Exit::Cancelled => log::debug!("enumerator routine unwound"),
        Exit::Panicked(payload) => inner.panic.set(Some(payload)),
    }

    control.finished.set(true);
    inner.worker.finish();
    inner.worker.switch_to_owner();

    // A finished task is never switched to again.
    log::error!("finished enumerator routine was resumed");
    std::process::abort()
}
