//! Capture records: activation records bound to a user function and to the
//! allocator that produced their stack.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::arch::{self, entry_func_abi};
use crate::record::{ActivationRecord, RegistryRef};
use crate::stack::{StackAllocator, StackError, StackPointer};
use crate::unwind::{self, fatal, Exit};
use crate::Continuation;

// The activation record must stay the first field: a pointer to the capture
// record is used as a pointer to its activation record and back.
#[repr(C)]
struct CaptureRecord<S, F> {
    record: ActivationRecord,
    salloc: S,
    func: Cell<Option<F>>,
    _registry: RegistryRef,
}

/// Allocates a stack from `salloc` and prepares a record which will run
/// `func` on it the first time it is resumed.
pub(crate) fn create<S, F>(mut salloc: S, func: F) -> Result<NonNull<ActivationRecord>, StackError>
where
    S: StackAllocator + 'static,
    F: FnOnce(Continuation) -> Continuation + 'static,
{
    let sctx = salloc.allocate()?;

    let capture = Box::into_raw(Box::new(CaptureRecord {
        record: ActivationRecord::new(sctx, destroy::<S, F>),
        salloc,
        func: Cell::new(Some(func)),
        _registry: RegistryRef::acquire(),
    }));

    unsafe {
        let sp = arch::init_stack(sctx.sp, entry::<S, F>, capture.cast());
        (*capture).record.suspended_at(sp);
        tracing::trace!(record = ?capture, stack = sctx.sp.get(), "created continuation");
        Ok(NonNull::new_unchecked(capture.cast()))
    }
}

/// Frees a capture record, then hands its stack back to the allocator.
unsafe fn destroy<S, F>(record: NonNull<ActivationRecord>)
where
    S: StackAllocator,
{
    let capture = Box::from_raw(record.as_ptr().cast::<CaptureRecord<S, F>>());
    tracing::trace!(record = ?record, "destroying continuation");

    let CaptureRecord {
        record,
        mut salloc,
        func,
        _registry,
    } = *capture;
    let sctx = record.stack();
    drop(func);
    drop(record);
    if let Some(sctx) = sctx {
        salloc.deallocate(sctx);
    }
}

// First function executed on a fresh continuation stack, called by the
// architecture trampoline with the stack pointer of the context that
// switched in and the capture record.
entry_func_abi! {
    unsafe fn entry<S, F>(from: StackPointer, obj: *mut u8) -> !
    where
        F: FnOnce(Continuation) -> Continuation,
    {
        let capture = &*(obj as *const CaptureRecord<S, F>);
        let prev = ActivationRecord::switched_in(from);
        capture.run(prev)
    }
}

impl<S, F> CaptureRecord<S, F>
where
    F: FnOnce(Continuation) -> Continuation,
{
    /// Runs the user function to completion and leaves the stack for good.
    unsafe fn run(&self, prev: NonNull<ActivationRecord>) -> ! {
        let func = self.func.take();
        let exit = unwind::catch_at_root(move || {
            // A transform or a forced unwind may already be pending.
            let caller = Continuation::switched_from(prev);
            match func {
                Some(func) => func(caller),
                None => fatal("continuation entered twice"),
            }
        });

        // Nothing with a destructor may be left on this stack past this
        // point: it is never unwound again.
        let next = match exit {
            Exit::Returned(next) => next.into_raw(),
            Exit::Unwound(from) => Some(from),
        };
        self.record.terminate();
        tracing::trace!(record = ?(self as *const Self), "continuation terminated");
        ActivationRecord::resume_final(next)
    }
}
