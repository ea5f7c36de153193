//! Cooperative coroutines on dedicated stacks, packaged as lazy enumerators.
//!
//! ## Overview
//!
//! This crate lets a routine produce a sequence of values one at a time from
//! anywhere in its call stack. The routine runs on a stack of its own; each
//! time it yields a value it is suspended, with all its local state intact,
//! and control goes back to whoever asked for the next value. Nothing runs in
//! the background: the routine only makes progress while the consumer is
//! inside [`Enumerator::advance`].
//!
//! ## Example
//!
//! ```rust
//! use corogen::Enumerator;
//!
//! let mut powers = Enumerator::new(|y| {
//!     let mut n = 1u64;
//!     for _ in 0..5 {
//!         n *= 2;
//!         y.yield_return(n);
//!     }
//! });
//!
//! let mut seen = Vec::new();
//! while powers.advance() {
//!     seen.push(*powers.current_value().unwrap());
//! }
//! assert_eq!(seen, [2, 4, 8, 16, 32]);
//! assert!(!powers.advance());
//! ```
//!
//! Enumerators also implement [`Iterator`]:
//!
//! ```rust
//! use corogen::Enumerator;
//!
//! fn walk(depth: u32, y: &corogen::YieldBuffer<u32>) {
//!     if depth > 0 {
//!         walk(depth - 1, y);
//!         y.yield_return(depth);
//!     }
//! }
//!
//! let values: Vec<u32> = Enumerator::new(|y| walk(4, y)).collect();
//! assert_eq!(values, [1, 2, 3, 4]);
//! ```
//!
//! ## Supported targets
//!
//! |         | ELF (Linux, BSD, etc) | Darwin (macOS, iOS, etc) | Windows |
//! |---------|-----------------------|--------------------------|---------|
//! | x86_64  | ✅                     | ✅                        | ✅       |
//! | AArch64 | ✅                     | ✅                        | ❌       |
//!
//! ## Features
//!
//! #### Panic propagation
//!
//! A panic in a routine unwinds to the root of the routine's stack, where it
//! is caught. It then continues unwinding out of the [`Enumerator::advance`]
//! call that resumed the routine, and the enumerator is finished.
//!
//! ```rust
//! use std::panic::{catch_unwind, AssertUnwindSafe};
//!
//! use corogen::Enumerator;
//!
//! let mut e = Enumerator::new(|y| {
//!     y.yield_return(1);
//!     panic!("out of values");
//! });
//!
//! assert!(e.advance());
//! let err = catch_unwind(AssertUnwindSafe(|| e.advance())).unwrap_err();
//! assert_eq!(*err.downcast_ref::<&str>().unwrap(), "out of values");
//! assert!(e.done());
//! ```
//!
//! #### Cleanup on drop
//!
//! Dropping an enumerator whose routine is suspended unwinds the routine's
//! stack with a [`Cancelled`] panic, so every local variable of the routine is
//! dropped before the stack is released. Routines that catch panics must
//! re-raise this one; see [`is_cancellation`].
//!
//! #### Stack bounds
//!
//! Every switch moves the thread's stack-bounds descriptor along with the
//! stack pointer. On Windows this is the TEB, which keeps structured
//! exception handling and the OS stack checks working on task stacks.
//! [`remaining_stack`] reports how much of the current stack is left.
//!
//! ## Cargo features
//!
//! #### `default-stack` (Enabled by default)
//!
//! Provides [`DefaultStack`](stack::DefaultStack), a stack allocated with a
//! guard page through OS APIs, and the constructors that use it. Without it,
//! stacks must be supplied through [`Enumerator::with_stack`] as a type
//! implementing [`Stack`](stack::Stack).

#![warn(missing_docs)]

mod arch;
pub mod bounds;
mod enumerator;
mod error;
pub mod stack;
pub mod task;
mod unwind;

pub use bounds::remaining_stack;
pub use enumerator::{Enumerator, YieldBuffer};
pub use error::Error;
#[cfg(feature = "default-stack")]
pub use task::create_context;
pub use task::{Context, EntryFn, Task, TaskState};
pub use unwind::{is_cancellation, Cancelled};

#[cfg(test)]
mod tests;
