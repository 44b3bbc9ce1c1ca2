//! Context switching for x86_64 on the System V ABI.
//!
//! ## Suspended context
//!
//! A suspended context is identified by its stack pointer, which points at
//! the following frame:
//!
//! ```text
//! |              |
//! ~     ...      ~  <- Whatever the context was doing when it switched away.
//! |              |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Resume RIP   |  <- Points just after the switch that suspended it.
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! RBX and RBP are LLVM reserved registers, so they can't be listed as
//! clobbers and are saved by hand. Every other callee-saved register is
//! declared clobbered, which lets the compiler spill only what is live.
//!
//! ## Fresh stack
//!
//! A stack that has never been entered looks like this:
//!
//! ```text
//! +--------------+  <- Stack top (16-byte aligned)
//! | Entry func   |
//! +--------------+
//! | Record ptr   |
//! +--------------+
//! | Trampoline   |  <- Popped by the RET in `switch`.
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::push;
use crate::stack::StackPointer;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

/// Signature of the function the trampoline calls on a fresh stack.
///
/// The SysV64 ABI is forced so the trampoline doesn't depend on the
/// platform's default calling convention.
pub type EntryFunc = unsafe extern "sysv64" fn(from: StackPointer, obj: *mut u8) -> !;

macro_rules! entry_func_abi {
    (unsafe fn $($tt:tt)*) => {
        unsafe extern "sysv64" fn $($tt)*
    }
}
pub(crate) use entry_func_abi;

// Root frame of every continuation stack. It is entered through the RET at
// the end of `switch` the first time a record is resumed. At that point:
// - RSP points at the record pointer left by init_stack().
// - RSI holds the stack pointer of the context that switched in.
//
// The return address is marked undefined so that unwinders and backtraces
// stop here instead of wandering off into unrelated memory.
global_asm!(
    ".balign 16",
    asm_function_begin!("callcc_stack_init_trampoline"),
    ".cfi_startproc",
    ".cfi_undefined rip",
    // First argument: the stack pointer of the context we came from.
    "mov rdi, rsi",
    // Second argument: the activation record.
    "mov rsi, [rsp]",
    // Terminate the frame pointer chain.
    "xor ebp, ebp",
    // RSP is 16-byte aligned here so the callee sees the usual alignment
    // after the return address is pushed.
    "call [rsp + 8]",
    // The entry function never returns.
    "ud2",
    ".cfi_endproc",
    asm_function_end!("callcc_stack_init_trampoline"),
);

// Uses a custom calling convention and must only be reached through `switch`.
extern "C" {
    fn callcc_stack_init_trampoline();
}

/// Sets up a fresh stack so that the first `switch` into it calls
/// `entry(from, obj)`.
#[inline]
pub unsafe fn init_stack(top: StackPointer, entry: EntryFunc, obj: *mut u8) -> StackPointer {
    let mut sp = top.get() & !(STACK_ALIGNMENT - 1);

    push(&mut sp, Some(entry as *const () as StackWord));
    push(&mut sp, Some(obj as StackWord));

    // Consumed by the RET in switch().
    push(&mut sp, Some(callcc_stack_init_trampoline as *const () as StackWord));

    StackPointer::new_unchecked(sp)
}

/// Suspends the running context and resumes the one saved at `target`.
///
/// Returns once another context switches back to us, yielding that
/// context's saved stack pointer.
// Inlined so that the compiler can merge the spills of callee-saved registers
// across several switches in the same function.
#[inline(always)]
pub unsafe fn switch(target: StackPointer) -> StackPointer {
    let from: u64;

    asm!(
        // Save RBP and RBX. Ideally this would be done by specifying them as
        // clobbers but that is not possible since they are LLVM reserved
        // registers.
        "push rbp",
        "push rbx",

        // Push the address at which we resume.
        "lea rax, [rip + 2f]",
        "push rax",

        // Hand our stack pointer over to the other side in RSI.
        "mov rsi, rsp",

        // Load the target stack and jump to its resume address. For a fresh
        // stack this is callcc_stack_init_trampoline.
        "mov rsp, rdi",
        "ret",

        // Someone switched back to us. RSI holds their stack pointer and
        // RSP points just past our resume address.
        "2:",
        "pop rbx",
        "pop rbp",

        in("rdi") target.get() as u64,
        lateout("rsi") from,

        // See the module documentation for an explanation of the clobbers.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    StackPointer::new_unchecked(from as usize)
}
