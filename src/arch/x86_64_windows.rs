//! Context switching for x86_64 Windows.
//!
//! This follows the same scheme as the System V implementation in
//! x86_64.rs, refer to it for the general picture. The Microsoft x64 ABI has
//! a larger callee-saved set: RDI, RSI and the low 128 bits of XMM6-XMM15
//! must also survive a call, so they are part of the frame.
//!
//! The TEB stack fields are not touched here. They are swapped by
//! `Context::switch_to` through the `bounds` module just before the registers
//! are, so that the target stack is already described correctly by the time
//! any code runs on it.
//!
//! ## Stack layout
//!
//! ```text
//! +--------------+
//! | Saved RIP    |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RDI    |
//! +--------------+
//! | Saved RSI    |
//! +--------------+
//! | Saved R12    |
//! +--------------+
//! | Saved R13    |
//! +--------------+
//! | Saved R14    |
//! +--------------+
//! | Saved R15    |
//! +--------------+
//! | Saved XMM15  |
//! ~     ...      ~
//! | Saved XMM6   |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! A primed stack has the same shape, with RBX holding the entry function,
//! R12-R15 its arguments and RIP pointing at corogen_bootstrap_trampoline.

use core::arch::{asm, global_asm};
use core::mem;

use super::{write_frame, EntryFn};

pub const STACK_ALIGNMENT: usize = 16;

/// Callee-saved register snapshot, in the order it is laid out in memory.
///
/// The XMM registers are stored as pairs of words so that the frame only
/// needs 8-byte alignment; the assembly uses unaligned moves.
#[repr(C)]
#[derive(Debug)]
pub struct RegisterFrame {
    pub xmm: [[u64; 2]; 10],
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

const _: () = assert!(mem::size_of::<RegisterFrame>() == 10 * 16 + 9 * 8);

global_asm!(
    ".balign 16",
    asm_function_begin!("corogen_switch_registers"),
    // RCX holds the frame to resume, RDX the slot that receives ours.
    "push rbp",
    "push rbx",
    "push rdi",
    "push rsi",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 160",
    "movdqu [rsp + 0x00], xmm6",
    "movdqu [rsp + 0x10], xmm7",
    "movdqu [rsp + 0x20], xmm8",
    "movdqu [rsp + 0x30], xmm9",
    "movdqu [rsp + 0x40], xmm10",
    "movdqu [rsp + 0x50], xmm11",
    "movdqu [rsp + 0x60], xmm12",
    "movdqu [rsp + 0x70], xmm13",
    "movdqu [rsp + 0x80], xmm14",
    "movdqu [rsp + 0x90], xmm15",
    "mov [rdx], rsp",
    "mov rsp, rcx",
    "movdqu xmm6, [rsp + 0x00]",
    "movdqu xmm7, [rsp + 0x10]",
    "movdqu xmm8, [rsp + 0x20]",
    "movdqu xmm9, [rsp + 0x30]",
    "movdqu xmm10, [rsp + 0x40]",
    "movdqu xmm11, [rsp + 0x50]",
    "movdqu xmm12, [rsp + 0x60]",
    "movdqu xmm13, [rsp + 0x70]",
    "movdqu xmm14, [rsp + 0x80]",
    "movdqu xmm15, [rsp + 0x90]",
    "add rsp, 160",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rsi",
    "pop rdi",
    "pop rbx",
    "pop rbp",
    "ret",
    asm_function_end!("corogen_switch_registers"),
);

global_asm!(
    ".balign 16",
    asm_function_begin!("corogen_bootstrap_trampoline"),
    // RSP is 16-byte aligned here. Reserve the 32-byte shadow space the
    // callee is entitled to, which keeps that alignment for the call.
    "mov rcx, r12",
    "mov rdx, r13",
    "mov r8, r14",
    "mov r9, r15",
    "sub rsp, 32",
    "call rbx",
    // The entry function has type `-> !`.
    "ud2",
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
        xmm: [[0; 2]; 10],
        r15: args[3] as u64,
        r14: args[2] as u64,
        r13: args[1] as u64,
        r12: args[0] as u64,
        rsi: 0,
        rdi: 0,
        rbx: entry as *const () as usize as u64,
        rbp: 0,
        rip: corogen_bootstrap_trampoline as *const () as usize as u64,
    };

    // 232 bytes of frame plus 16 bytes of padding keeps RSP aligned once RIP
    // has been popped by the switch.
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
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
