//! Context switching for x86_64 targets using the System V ABI.
//!
//! The switch is written as an ordinary function so that the compiler treats
//! it like any other call: everything the System V ABI marks as caller-saved
//! has already been spilled by the caller before the call instruction, which
//! leaves only RBX, RBP and R12-R15 for us to preserve. There are no
//! callee-saved vector registers on this ABI.
//!
//! ## Stack layout
//!
//! This is the top of a suspended stack. The saved stack pointer of a
//! suspended context points at the saved R15, i.e. at a `RegisterFrame`.
//!
//! ```text
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Saved RIP    |  <- Return address pushed by the call to
//! +--------------+     corogen_switch_registers.
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved R12    |
//! +--------------+
//! | Saved R13    |
//! +--------------+
//! | Saved R14    |
//! +--------------+
//! | Saved R15    |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! And this is the layout of a stack that has just been primed by
//! `init_frame`. The registers are not genuine saved values since nothing has
//! run yet: they carry the entry function and its arguments into the
//! bootstrap trampoline.
//!
//! ```text
//! +--------------+  <- Stack base
//! | 0            |
//! +--------------+
//! | 0            |
//! +--------------+  <- RSP once the frame has been popped (16-byte aligned)
//! | Trampoline   |  <- "Return address": corogen_bootstrap_trampoline
//! +--------------+
//! | RBP = 0      |  <- Terminates the frame pointer chain.
//! +--------------+
//! | RBX = entry  |
//! +--------------+
//! | R12 = arg 0  |
//! +--------------+
//! | R13 = arg 1  |
//! +--------------+
//! | R14 = arg 2  |
//! +--------------+
//! | R15 = arg 3  |
//! +--------------+  <- Initial saved stack pointer
//! ```

use core::arch::{asm, global_asm};
use core::mem;

use super::{write_frame, EntryFn};

pub const STACK_ALIGNMENT: usize = 16;

/// Callee-saved register snapshot, in the order it is laid out in memory.
#[repr(C)]
#[derive(Debug)]
pub struct RegisterFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

const _: () = assert!(mem::size_of::<RegisterFrame>() == 7 * 8);

global_asm!(
    ".balign 16",
    asm_function_begin!("corogen_switch_registers"),
    // RDI holds the frame to resume, RSI the slot that receives ours. The call
    // that got us here already pushed our resume address.
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // Publish our frame before leaving. After this store the other side may
    // switch back to us at any time, which can only happen once we have left
    // this stack below.
    "mov [rsi], rsp",
    "mov rsp, rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    // Either returns into the caller of a previous corogen_switch_registers
    // on the target stack, or into corogen_bootstrap_trampoline for a task
    // that has never run.
    "ret",
    asm_function_end!("corogen_switch_registers"),
);

global_asm!(
    ".balign 16",
    asm_function_begin!("corogen_bootstrap_trampoline"),
    ".cfi_startproc",
    // There is no caller: tell unwinders and debuggers that the call chain of
    // this task ends here.
    ".cfi_undefined rip",
    // RSP is 16-byte aligned here, so the call below leaves the callee with
    // the usual RSP % 16 == 8 on entry.
    "mov rdi, r12",
    "mov rsi, r13",
    "mov rdx, r14",
    "mov rcx, r15",
    "call rbx",
    // The entry function has type `-> !`.
    "ud2",
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
    let frame = RegisterFrame {
        r15: args[3] as u64,
        r14: args[2] as u64,
        r13: args[1] as u64,
        r12: args[0] as u64,
        rbx: entry as *const () as usize as u64,
        rbp: 0,
        rip: corogen_bootstrap_trampoline as *const () as usize as u64,
    };

    // 56 bytes of frame plus 16 bytes of padding keeps RSP aligned once RIP
    // has been popped by the switch.
    write_frame(stack_base, 16, frame)
}

/// Saves the callee-saved registers of the running context on its own stack,
/// stores the address of that snapshot in `*outgoing`, then restores `target`
/// and continues wherever it was suspended.
///
/// Returns when another switch resumes the frame written to `*outgoing`.
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
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
