//! Machine-level context switching.
//!
//! Each architecture provides exactly two operations:
//! - `init_stack` lays out a fresh stack so that the first switch into it
//!   enters `callcc_stack_init_trampoline`, which in turn calls the entry
//!   function with the stack pointer of the context that switched in.
//! - `switch` suspends the running context on its own stack and resumes a
//!   suspended one. It returns, once something switches back, the stack
//!   pointer of whichever context did so.
//!
//! The saved state of a suspended context is nothing more than its stack
//! pointer: the resume address and the registers that can't be declared as
//! clobbers sit at the top of its stack.

use core::mem;

// Helper macros to deal with platform-specific differences in assembly code
// between the ELF and Mach-O file formats.
cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        macro_rules! asm_mangle {
            ($name:literal) => { concat!("_", $name) };
        }
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
        macro_rules! asm_mangle {
            ($name:literal) => { $name };
        }
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
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

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", unix))] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(all(target_arch = "aarch64", unix))] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("Unsupported target");
    }
}

/// Helper function to push a value onto a stack.
#[inline]
unsafe fn push(sp: &mut usize, val: Option<StackWord>) {
    *sp -= mem::size_of::<StackWord>();
    if let Some(val) = val {
        *(*sp as *mut StackWord) = val;
    }
}
