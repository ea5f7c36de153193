use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::hint;
use std::ptr;
use std::rc::Rc;

use crate::bounds::StackBounds;
use crate::stack::{DefaultStack, Stack, StackPointer, DEFAULT_STACK_SIZE};
use crate::{is_cancellation, Enumerator, YieldBuffer};

/// Counts how many of its instances have been created and dropped.
struct Tracked {
    live: Rc<Cell<usize>>,
}

impl Tracked {
    fn new(live: &Rc<Cell<usize>>) -> Self {
        live.set(live.get() + 1);
        Self { live: live.clone() }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

#[test]
fn empty() {
    let mut e = Enumerator::<i32>::new(|_| {});
    assert!(!e.started());
    assert!(!e.done());
    assert!(!e.advance());
    assert!(e.started());
    assert!(e.done());
    assert_eq!(e.current_value(), None);
    assert!(!e.advance());
    assert!(!e.advance());
}

#[test]
fn powers_of_two() {
    let mut e = Enumerator::new(|y| {
        let mut n = 1u64;
        for _ in 0..20 {
            n *= 2;
            y.yield_return(n);
        }
    });

    let mut seen = Vec::new();
    while e.advance() {
        seen.push(*e.current_value().unwrap());
    }
    let expected: Vec<u64> = (1..=20).map(|k| 1 << k).collect();
    assert_eq!(seen, expected);
    assert!(e.done());
    assert!(!e.advance());
    assert_eq!(e.current_value(), None);
}

#[test]
fn abandon_after_first() {
    let live = Rc::new(Cell::new(0));
    let reached_end = Rc::new(Cell::new(false));

    let mut e = {
        let live = live.clone();
        let reached_end = reached_end.clone();
        Enumerator::new(move |y| {
            let _a = Tracked::new(&live);
            y.yield_return(1);
            let _b = Tracked::new(&live);
            y.yield_return(2);
            reached_end.set(true);
        })
    };

    assert!(e.advance());
    assert_eq!(e.current_value(), Some(&1));
    assert_eq!(live.get(), 1);

    drop(e);
    assert_eq!(live.get(), 0);
    assert!(!reached_end.get());
}

#[test]
fn abandon_at_every_step() {
    for k in 0..=6 {
        let live = Rc::new(Cell::new(0));
        let routine_live = live.clone();
        let mut e = Enumerator::new(move |y| {
            let mut held = Vec::new();
            for i in 0..5 {
                held.push(Tracked::new(&routine_live));
                y.yield_return(i);
            }
        });

        for _ in 0..k {
            e.advance();
        }
        drop(e);
        assert_eq!(live.get(), 0, "leaked values after {} steps", k);
    }
}

#[test]
fn nested() {
    let floats = [0.5f64, 1.25, 2.75, 3.0];
    let mut ints = Enumerator::new(|y| {
        let mut inner = Enumerator::new(|fy| {
            for f in floats {
                fy.yield_return(f);
            }
        });
        while inner.advance() {
            let f = *inner.current_value().unwrap();
            y.yield_return((f * 4.0) as i64);
        }
        assert!(inner.done());
    });

    let mut out = Vec::new();
    while ints.advance() {
        out.push(*ints.current_value().unwrap());
    }
    assert_eq!(out, [2, 5, 11, 12]);
}

#[test]
fn error_handled_inside_routine() {
    fn parse(s: &str) -> i32 {
        s.parse().expect("not a number")
    }

    let mut e = Enumerator::new(|y| {
        for s in ["1", "x", "3"] {
            match panic::catch_unwind(|| parse(s)) {
                Ok(n) => y.yield_return(n),
                Err(_) => y.yield_return(-1),
            }
        }
    });
    let values: Vec<i32> = e.by_ref().collect();
    assert_eq!(values, [1, -1, 3]);
    assert!(e.done());
}

#[test]
fn deterministic() {
    fn run() -> Vec<u32> {
        Enumerator::new(|y| {
            let mut x = 17u32;
            for _ in 0..50 {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                y.yield_return(x >> 16);
            }
        })
        .collect()
    }
    assert_eq!(run(), run());
}

#[test]
fn never_started() {
    let live = Rc::new(Cell::new(0));
    let ran = Rc::new(Cell::new(false));

    let captured = Tracked::new(&live);
    let ran2 = ran.clone();
    let e = Enumerator::<()>::new(move |_| {
        let _keep = captured;
        ran2.set(true);
    });
    assert_eq!(live.get(), 1);

    drop(e);
    assert_eq!(live.get(), 0);
    assert!(!ran.get());
}

#[test]
fn force_unwind_states() {
    let live = Rc::new(Cell::new(0));

    let captured = Tracked::new(&live);
    let mut e = Enumerator::new(move |y| {
        let _keep = captured;
        y.yield_return(());
    });
    e.force_unwind();
    assert!(!e.started());
    assert!(e.done());
    assert_eq!(live.get(), 0);
    assert!(!e.advance());

    let captured = Tracked::new(&live);
    let mut e = Enumerator::new(move |y| {
        let _keep = captured;
        y.yield_return(());
        y.yield_return(());
    });
    assert!(e.advance());
    e.force_unwind();
    assert!(e.started());
    assert!(e.done());
    assert_eq!(live.get(), 0);
    assert_eq!(e.current_value(), None);
    e.force_unwind();
    assert!(!e.advance());
}

#[test]
#[should_panic(expected = "foobar")]
fn panics_propagated() {
    let live = Rc::new(Cell::new(0));
    let captured = Tracked::new(&live);
    let mut e = Enumerator::<i32>::new(move |y| {
        let _keep = captured;
        y.yield_return(1);
        panic!("foobar");
    });

    assert!(e.advance());
    let result = panic::catch_unwind(AssertUnwindSafe(|| e.advance()));
    assert!(result.is_err());
    assert_eq!(live.get(), 0);
    assert!(e.done());
    assert!(!e.advance());
    panic::resume_unwind(result.unwrap_err());
}

#[test]
fn cancellation_rethrown() {
    let saw_cancel = Rc::new(Cell::new(false));
    let saw_cancel2 = saw_cancel.clone();

    let mut e = Enumerator::new(move |y| {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            y.yield_return(1);
            y.yield_return(2);
        }));
        if let Err(payload) = result {
            if is_cancellation(&*payload) {
                saw_cancel2.set(y.is_cancelled());
            }
            panic::resume_unwind(payload);
        }
    });

    assert!(e.advance());
    drop(e);
    assert!(saw_cancel.get());
}

#[test]
fn cancellation_swallowed_then_returned() {
    let mut e = Enumerator::new(|y| {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| y.yield_return(1)));
    });
    assert!(e.advance());
    e.force_unwind();
    assert!(e.done());
}

#[test]
fn yield_after_cancellation() {
    let reached = Rc::new(Cell::new(0));
    let reached2 = reached.clone();
    let mut e = Enumerator::new(move |y| {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| y.yield_return(1)));
        reached2.set(1);
        y.yield_return(2);
        reached2.set(2);
    });
    assert!(e.advance());

    let err = panic::catch_unwind(AssertUnwindSafe(|| e.force_unwind())).unwrap_err();
    let msg = err
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap();
    assert!(msg.contains("yielded after being cancelled"));
    assert!(!e.done());
    assert_eq!(reached.get(), 1);

    // The second cancellation is not caught, so dropping finishes the routine
    // from inside the pending yield.
    drop(e);
    assert_eq!(reached.get(), 1);
}

/// Forwards to a `DefaultStack` and records when it is released.
struct FlaggedStack {
    inner: DefaultStack,
    released: Rc<Cell<bool>>,
}

impl Drop for FlaggedStack {
    fn drop(&mut self) {
        self.released.set(true);
    }
}

unsafe impl Stack for FlaggedStack {
    fn base(&self) -> StackPointer {
        self.inner.base()
    }

    fn limit(&self) -> StackPointer {
        self.inner.limit()
    }

    fn bounds(&self) -> StackBounds {
        self.inner.bounds()
    }

    #[cfg(windows)]
    fn update_bounds(&mut self, bounds: StackBounds) {
        self.inner.update_bounds(bounds)
    }
}

#[test]
fn abandon_releases_stack() {
    for k in 0..=4 {
        let released = Rc::new(Cell::new(false));
        let stack = FlaggedStack {
            inner: DefaultStack::new(64 * 1024).unwrap(),
            released: released.clone(),
        };
        let mut e = Enumerator::with_stack(stack, |y| {
            for i in 0..3 {
                y.yield_return(i);
            }
        });
        for _ in 0..k {
            e.advance();
        }
        assert!(!released.get());
        drop(e);
        assert!(released.get(), "stack kept after {} steps", k);
    }
}

#[test]
fn iterator() {
    let mut e = Enumerator::new(|y| {
        for c in "abcde".chars() {
            y.yield_return(c);
        }
    });
    let first: String = e.by_ref().take(2).collect();
    assert_eq!(first, "ab");
    let rest: String = e.by_ref().collect();
    assert_eq!(rest, "cde");
    assert_eq!(e.next(), None);
    assert_eq!(e.next(), None);
}

#[test]
fn take_value() {
    let mut e = Enumerator::new(|y| {
        y.yield_return("hello".to_string());
    });
    assert_eq!(e.take_value(), None);
    assert!(e.advance());
    assert_eq!(e.take_value().as_deref(), Some("hello"));
    assert_eq!(e.current_value(), None);
    assert!(format!("{:?}", e).contains("started: true"));
    assert!(!e.advance());
}

#[test]
fn borrows_from_caller() {
    let mut log = Vec::new();
    {
        let log = &mut log;
        let mut e = Enumerator::new(|y| {
            for i in 0..3 {
                log.push(i);
                y.yield_return(i * 10);
            }
        });
        assert_eq!(e.next(), Some(0));
        assert_eq!(e.next(), Some(10));
    }
    assert_eq!(log, [0, 1]);
}

#[test]
fn aligned_capture() {
    #[repr(align(128))]
    struct Aligned(u8);
    let aligned = Aligned(100);
    let mut e = Enumerator::new(move |y| {
        y.yield_return(&aligned as *const _ as usize % 128);
        y.yield_return(aligned.0 as usize);
    });
    assert_eq!(e.next(), Some(0));
    assert_eq!(e.next(), Some(100));
}

#[test]
fn remaining_stack() {
    #[inline(never)]
    fn recurse(depth: u32, y: &YieldBuffer<usize>) {
        let pad = [0u8; 1024];
        y.yield_return(y.remaining_stack().unwrap());
        if depth > 0 {
            recurse(depth - 1, y);
        }
        // Using the frame after the call keeps every level on the stack.
        hint::black_box(&pad);
    }

    let readings: Vec<usize> = Enumerator::new(|y| recurse(4, y)).collect();
    assert_eq!(readings.len(), 5);
    assert!(readings[0] <= DEFAULT_STACK_SIZE);
    for pair in readings.windows(2) {
        assert!(pair[1] + 1024 <= pair[0], "{:?}", readings);
    }
}

#[test]
fn remaining_stack_restored_after_nesting() {
    // Only the base is compared: on Windows the committed limit may move.
    fn base() -> Option<usize> {
        crate::bounds::capture().map(|b| b.base)
    }

    let mut e = Enumerator::new(|y| {
        let before = base();
        let outer_remaining = y.remaining_stack().unwrap();

        let mut inner = Enumerator::with_stack(DefaultStack::new(64 * 1024).unwrap(), |iy| {
            iy.yield_return(iy.remaining_stack().unwrap());
        });
        assert!(inner.advance());
        let inner_remaining = *inner.current_value().unwrap();
        assert!(inner_remaining <= 64 * 1024);

        assert_eq!(base(), before);
        let after = y.remaining_stack().unwrap();
        y.yield_return(outer_remaining.abs_diff(after) < 4096);
        drop(inner);
        assert_eq!(base(), before);
    });

    assert_eq!(e.next(), Some(true));
    assert_eq!(e.next(), None);
    #[cfg(not(windows))]
    assert_eq!(crate::remaining_stack(), None);
}

#[test]
fn stack_growth() {
    let mut e = Enumerator::<()>::new(|_| {
        fn recurse(i: u32, p: &mut [u8; 10000]) {
            unsafe {
                ptr::read_volatile(&p);
            }
            if i > 0 {
                recurse(i - 1, &mut [0; 10000]);
            }
        }

        // Use ~500KB of stack.
        recurse(50, &mut [0; 10000]);
    });
    assert!(!e.advance());
}

#[test]
fn reuse_stack() {
    let mut e = Enumerator::with_stack(DefaultStack::new(128 * 1024).unwrap(), |y| {
        y.yield_return(1);
    });
    assert_eq!(e.by_ref().sum::<i32>(), 1);
    let stack = e.into_stack();

    let mut e = Enumerator::with_stack(stack, |y| {
        y.yield_return(2);
        y.yield_return(3);
    });
    assert_eq!(e.by_ref().sum::<i32>(), 5);

    let mut stack = e.into_stack();
    let e = Enumerator::with_stack(&mut stack, |y| y.yield_return(4));
    assert_eq!(e.collect::<Vec<_>>(), [4]);
}

#[test]
#[should_panic(expected = "unfinished enumerator")]
fn into_stack_before_start() {
    let e = Enumerator::new(|y| y.yield_return(1));
    e.into_stack();
}

#[test]
fn try_new() {
    let mut e = Enumerator::try_new(|y| y.yield_return(7)).unwrap();
    assert_eq!(e.next(), Some(7));
}

#[test]
fn routine_on_other_thread() {
    let result = std::thread::spawn(|| {
        let stack = DefaultStack::new(256 * 1024).unwrap();
        Enumerator::with_stack(stack, |y| {
            for i in 0..4 {
                y.yield_return(i);
            }
        })
        .sum::<i32>()
    })
    .join()
    .unwrap();
    assert_eq!(result, 6);
}

// The trampoline ends the unwind chain, so a backtrace taken inside a routine
// stops at the root of the worker stack.
#[test]
fn backtrace_inside_routine() {
    #[inline(never)]
    fn look_for_me(y: &YieldBuffer<bool>) {
        let trace = backtrace::Backtrace::new();
        println!("{:?}", trace);
        let found = trace
            .frames()
            .iter()
            .flat_map(|f| f.symbols())
            .filter_map(|s| Some(s.name()?.to_string()))
            .any(|s| s.contains("look_for_me"));
        y.yield_return(found);
    }

    let mut e = Enumerator::new(|y| look_for_me(y));
    assert_eq!(e.next(), Some(true));
    assert_eq!(e.next(), None);
}
