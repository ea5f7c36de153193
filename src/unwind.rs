//! Unwinding across task boundaries.
//!
//! A panic never crosses a stack switch. Everything that runs on a task
//! stack is wrapped in `catch_unwind` at the root of that stack, the outcome
//! is stored and the task switches back to its owner like it would after a
//! normal return. The owner then decides what to do with the payload,
//! typically resuming the unwind on its own stack.
//!
//! Cancellation reuses the same machinery in the other direction: to tear
//! down a suspended routine, the owner sets a flag and resumes it, and the
//! routine raises a [`Cancelled`] payload from the point where it was
//! suspended. This unwinds the task stack up to its root, running every
//! pending destructor, where the payload is recognized and dropped.

use core::fmt;
use std::any::Any;
use std::boxed::Box;
use std::panic::{self, AssertUnwindSafe};

/// Payload of a panic caught at the root of a task.
pub type CaughtPanic = Box<dyn Any + Send>;

/// Panic payload used to unwind a routine whose [`Enumerator`] was dropped
/// while the routine was suspended.
///
/// Routines that catch panics (for example with
/// [`std::panic::catch_unwind`]) must re-raise this payload with
/// [`std::panic::resume_unwind`]. Swallowing it leaves the routine suspended
/// with nobody able to finish it, which aborts the process.
///
/// [`Enumerator`]: crate::Enumerator
pub struct Cancelled {
    _private: (),
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cancelled")
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("enumerator cancelled")
    }
}

/// Returns whether a caught panic payload is the cancellation signal.
pub fn is_cancellation(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Cancelled>()
}

/// Starts unwinding the current task with the cancellation signal.
///
/// Uses `resume_unwind` so that the panic hook is not invoked: this is
/// ordinary teardown, not an error.
#[cold]
pub(crate) fn raise_cancellation() -> ! {
    panic::resume_unwind(Box::new(Cancelled { _private: () }))
}

/// How the body of a task came to an end.
pub(crate) enum Exit {
    Returned,
    Cancelled,
    Panicked(CaughtPanic),
}

/// Runs `f` at the root of a task stack, turning any unwind into a value.
#[inline]
pub(crate) fn run_at_root<F: FnOnce()>(f: F) -> Exit {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Exit::Returned,
        Err(payload) if is_cancellation(&*payload) => Exit::Cancelled,
        Err(payload) => Exit::Panicked(payload),
    }
}

/// Continues unwinding with a payload that was caught on another stack.
#[inline]
pub(crate) fn maybe_resume_unwind(payload: Option<CaughtPanic>) {
    if let Some(payload) = payload {
        panic::resume_unwind(payload);
    }
}
