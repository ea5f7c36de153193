//! Context switching for AArch64 (AAPCS64) targets.
//!
//! This follows the same scheme as the x86_64 implementation, refer to
//! x86_64.rs for the general picture. The callee-saved set is X19-X28, the
//! frame pointer X29, the link register X30 and the low 64 bits of V8-V15
//! (D8-D15). There is no return address on the stack: the resume address
//! travels in the saved X30 and the switch ends with a plain RET.
//!
//! ## Stack layout
//!
//! ```text
//! +--------------+
//! | Saved D14/15 |
//! +--------------+
//! | Saved D12/13 |
//! +--------------+
//! | Saved D10/11 |
//! +--------------+
//! | Saved D8/9   |
//! +--------------+
//! | Saved X29/30 |  <- X30 is the resume address.
//! +--------------+
//! | Saved X27/28 |
//! ~     ...      ~
//! | Saved X19/20 |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! A primed stack has the same shape with X19 holding the entry function,
//! X20-X23 its arguments, X29 = 0 and X30 pointing at
//! corogen_bootstrap_trampoline.

use core::arch::{asm, global_asm};
use core::mem;

use super::{write_frame, EntryFn};

pub const STACK_ALIGNMENT: usize = 16;

/// Callee-saved register snapshot, in the order it is laid out in memory.
#[repr(C)]
#[derive(Debug)]
pub struct RegisterFrame {
    pub x: [u64; 10],
    pub x29: u64,
    pub x30: u64,
    pub d: [u64; 8],
}

const _: () = assert!(mem::size_of::<RegisterFrame>() == 160);

global_asm!(
    ".balign 4",
    asm_function_begin!("corogen_switch_registers"),
    // X0 holds the frame to resume, X1 the slot that receives ours. LR holds
    // our resume address.
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0x00]",
    "stp x21, x22, [sp, #0x10]",
    "stp x23, x24, [sp, #0x20]",
    "stp x25, x26, [sp, #0x30]",
    "stp x27, x28, [sp, #0x40]",
    "stp x29, x30, [sp, #0x50]",
    "stp d8, d9, [sp, #0x60]",
    "stp d10, d11, [sp, #0x70]",
    "stp d12, d13, [sp, #0x80]",
    "stp d14, d15, [sp, #0x90]",
    "mov x2, sp",
    "str x2, [x1]",
    "mov sp, x0",
    "ldp x19, x20, [sp, #0x00]",
    "ldp x21, x22, [sp, #0x10]",
    "ldp x23, x24, [sp, #0x20]",
    "ldp x25, x26, [sp, #0x30]",
    "ldp x27, x28, [sp, #0x40]",
    "ldp x29, x30, [sp, #0x50]",
    "ldp d8, d9, [sp, #0x60]",
    "ldp d10, d11, [sp, #0x70]",
    "ldp d12, d13, [sp, #0x80]",
    "ldp d14, d15, [sp, #0x90]",
    "add sp, sp, #160",
    "ret",
    asm_function_end!("corogen_switch_registers"),
);

global_asm!(
    ".balign 4",
    asm_function_begin!("corogen_bootstrap_trampoline"),
    ".cfi_startproc",
    // There is no caller: tell unwinders and debuggers that the call chain of
    // this task ends here.
    ".cfi_undefined x30",
    "mov x0, x20",
    "mov x1, x21",
    "mov x2, x22",
    "mov x3, x23",
    "blr x19",
    // The entry function has type `-> !`.
    "brk #0",
    ".cfi_endproc",
    asm_function_end!("corogen_bootstrap_trampoline"),
);

extern "C" {
    fn corogen_switch_registers(target: *mut RegisterFrame, outgoing: *mut *mut RegisterFrame);
    fn corogen_bootstrap_trampoline();
}

/// Primes the stack below `stack_base` so that switching to the returned
/// frame calls `entry(args[0], args[1], args[2], args[3])`.
#[inline]
pub unsafe fn init_frame(stack_base: usize, entry: EntryFn, args: [usize; 4]) -> *mut RegisterFrame {
    let mut x = [0; 10];
    x[0] = entry as *const () as usize as u64;
    x[1] = args[0] as u64;
    x[2] = args[1] as u64;
    x[3] = args[2] as u64;
    x[4] = args[3] as u64;

    let frame = RegisterFrame {
        x,
        x29: 0,
        x30: corogen_bootstrap_trampoline as *const () as usize as u64,
        d: [0; 8],
    };

    // The frame is 160 bytes, so SP is still aligned after it is popped.
    write_frame(stack_base, 16, frame)
}

/// Saves the callee-saved registers of the running context on its own stack,
/// stores the address of that snapshot in `*outgoing`, then restores `target`
/// and continues wherever it was suspended.
#[inline]
pub unsafe fn switch_registers(target: *mut RegisterFrame, outgoing: *mut *mut RegisterFrame) {
    debug_assert!(!target.is_null());
    corogen_switch_registers(target, outgoing);
}

/// Returns the current value of the stack pointer.
#[inline(always)]
pub fn current_stack_ptr() -> usize {
    let sp: usize;
    unsafe {
        asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
