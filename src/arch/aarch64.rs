//! Context switching for AArch64.
//!
//! This follows the x86_64 implementation; refer to x86_64.rs for the
//! general scheme. Only the differences are documented here.
//!
//! ## Suspended context
//!
//! ```text
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Saved X19    |
//! +--------------+
//! | Resume PC    |
//! +--------------+
//! | Saved X29    |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! X19 and X29 are LLVM reserved registers and are saved by hand.
//!
//! ## Fresh stack
//!
//! ```text
//! +--------------+  <- Stack top (16-byte aligned)
//! | Entry func   |
//! +--------------+
//! | Record ptr   |
//! +--------------+
//! | Trampoline   |  <- Loaded as the resume PC by `switch`.
//! +--------------+
//! | Zero         |  <- Initial X29.
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::push;
use crate::stack::StackPointer;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

/// Signature of the function the trampoline calls on a fresh stack.
pub type EntryFunc = unsafe extern "C" fn(from: StackPointer, obj: *mut u8) -> !;

macro_rules! entry_func_abi {
    (unsafe fn $($tt:tt)*) => {
        unsafe extern "C" fn $($tt)*
    }
}
pub(crate) use entry_func_abi;

// Unlike x86_64 the resume PC is not popped by the switch, so SP still points
// at the full initial frame when we get here. X1 holds the stack pointer of
// the context that switched in.
global_asm!(
    ".balign 4",
    asm_function_begin!("callcc_stack_init_trampoline"),
    ".cfi_startproc",
    ".cfi_undefined lr",
    "mov x0, x1",
    "ldp x1, x2, [sp, #16]",
    "add sp, sp, #32",
    "mov x29, xzr",
    "mov lr, xzr",
    "blr x2",
    "brk #0",
    ".cfi_endproc",
    asm_function_end!("callcc_stack_init_trampoline"),
);

extern "C" {
    fn callcc_stack_init_trampoline();
}

#[inline]
pub unsafe fn init_stack(top: StackPointer, entry: EntryFunc, obj: *mut u8) -> StackPointer {
    let mut sp = top.get() & !(STACK_ALIGNMENT - 1);

    push(&mut sp, Some(entry as *const () as StackWord));
    push(&mut sp, Some(obj as StackWord));
    push(&mut sp, Some(callcc_stack_init_trampoline as *const () as StackWord));
    push(&mut sp, Some(0));

    StackPointer::new_unchecked(sp)
}

#[inline(always)]
pub unsafe fn switch(target: StackPointer) -> StackPointer {
    let from: u64;

    asm!(
        // Save X29, X19 and our resume address.
        "adr lr, 2f",
        "stp x29, lr, [sp, #-32]!",
        "str x19, [sp, #16]",

        // Hand our stack pointer over to the other side in X1.
        "mov x1, sp",

        // Switch stacks and jump to the target's resume address.
        "mov sp, x0",
        "ldr x2, [sp, #8]",
        "br x2",

        // AArch64 Mach-O does not have a way of representing relocations on
        // an ADR instruction so this must be a local label that the assembler
        // can fully resolve ahead of time.
        "2:",
        "ldr x19, [sp, #16]",
        "ldp x29, lr, [sp], #32",

        in("x0") target.get() as u64,
        lateout("x1") from,

        // Mark all registers as clobbered. The clobber_abi() will automatically
        // mark X18 as clobbered if it is not reserved by the platform.
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    StackPointer::new_unchecked(from as usize)
}
