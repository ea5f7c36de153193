//! Architecture-specific context switching.
//!
//! Every supported target provides the same small surface:
//! - `RegisterFrame`: the callee-saved register snapshot stored at the top of
//!   a suspended stack.
//! - `init_frame` to prime a fresh stack so that the first switch into it
//!   enters the bootstrap trampoline.
//! - `switch_registers` to save the current callee-saved registers, publish
//!   the resulting frame pointer and resume another frame.
//! - `current_stack_ptr` to read the stack pointer.
//!
//! Nothing outside this module touches registers or builds frames by hand.

use core::mem;

// Helper macros to deal with platform-specific differences in assembly code
// between ELF, Mach-O and COFF file formats.
cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        macro_rules! asm_mangle {
            ($name:literal) => { concat!("_", $name) };
        }
    } else {
        macro_rules! asm_mangle {
            ($name:literal) => { $name };
        }
    }
}
cfg_if::cfg_if! {
    if #[cfg(windows)] {
        // COFF
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".def ", asm_mangle!($name), "\n",
                    ".scl 2\n",
                    ".type 32\n",
                    ".endef ", asm_mangle!($name), "\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                ""
            };
        }
    } else if #[cfg(target_vendor = "apple")] {
        // Mach-O
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".private_extern ", asm_mangle!($name), "\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                ""
            };
        }
    } else {
        // Everything else uses ELF
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".hidden ", asm_mangle!($name), "\n",
                    ".type ", asm_mangle!($name), ", @function\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                concat!(".size ", asm_mangle!($name), ", . - ", asm_mangle!($name), "\n")
            };
        }
    }
}

/// Signature of the function entered by the bootstrap trampoline.
///
/// It receives the four words passed to `init_frame` and must never return:
/// a finished task leaves by switching away for the last time.
pub type EntryFn = unsafe extern "C" fn(usize, usize, usize, usize) -> !;

/// Writes a register frame just below `top` and returns its address.
///
/// `top` must be aligned to `STACK_ALIGNMENT`. `pad` extra bytes are left
/// zeroed between `top` and the frame so that the stack pointer seen by the
/// trampoline after the frame has been consumed is correctly aligned.
#[inline]
unsafe fn write_frame<T>(top: usize, pad: usize, frame: T) -> *mut T {
    debug_assert_eq!(top % STACK_ALIGNMENT, 0);

    let mut sp = top;
    while sp > top - pad {
        sp -= mem::size_of::<usize>();
        (sp as *mut usize).write(0);
    }
    sp -= mem::size_of::<T>();
    debug_assert_eq!(sp % mem::align_of::<T>(), 0);

    let ptr = sp as *mut T;
    ptr.write(frame);
    ptr
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(all(target_arch = "x86_64", windows))] {
        mod x86_64_windows;
        pub use self::x86_64_windows::*;
    } else if #[cfg(all(target_arch = "aarch64", not(windows)))] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("Unsupported target");
    }
}
