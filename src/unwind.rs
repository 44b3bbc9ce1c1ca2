//! Forced unwinding of suspended continuations.
//!
//! Dropping the last handle to a suspended continuation must not simply free
//! its stack: there may be live objects on it. Instead the continuation is
//! resumed one last time with its `force_unwind` flag set, which makes the
//! pending `resume` call on its side raise a [`ForcedUnwind`] panic. The
//! panic unwinds the continuation's own stack, dropping everything on it,
//! until it is caught at the root of the continuation by
//! [`catch_at_root`]. The panic never crosses a stack boundary.
//!
//! `resume_unwind` is used rather than `panic!` so that the panic hook is not
//! invoked for what is a normal part of tearing down a continuation.

use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use crate::record::ActivationRecord;
use crate::Continuation;

/// Panic payload that unwinds a continuation whose handle was dropped.
///
/// It carries the record that requested the unwind, which is where control
/// goes once the continuation has terminated. It must reach the root of the
/// continuation exactly once; discarding it on the way is fatal.
pub(crate) struct ForcedUnwind {
    from: NonNull<ActivationRecord>,
    caught: bool,
}

// The record pointer is only ever used on the thread which raised the unwind.
unsafe impl Send for ForcedUnwind {}

impl Drop for ForcedUnwind {
    fn drop(&mut self) {
        if !self.caught {
            fatal("ForcedUnwind was caught and not rethrown");
        }
    }
}

/// Starts unwinding the current continuation's stack.
#[cold]
pub(crate) fn raise(from: NonNull<ActivationRecord>) -> ! {
    tracing::debug!(from = ?from, "unwinding suspended continuation");
    panic::resume_unwind(Box::new(ForcedUnwind {
        from,
        caught: false,
    }))
}

/// How the body of a continuation finished.
pub(crate) enum Exit {
    /// The body returned the continuation to switch to next.
    Returned(Continuation),

    /// The body was unwound on behalf of the given record.
    Unwound(NonNull<ActivationRecord>),
}

/// Runs the body of a continuation, catching a forced unwind.
///
/// Any other panic escaping the body is fatal: there is nowhere sensible to
/// propagate it to.
pub(crate) fn catch_at_root<F>(f: F) -> Exit
where
    F: FnOnce() -> Continuation,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(next) => Exit::Returned(next),
        Err(payload) => match payload.downcast::<ForcedUnwind>() {
            Ok(mut unwind) => {
                assert!(!unwind.caught, "ForcedUnwind caught twice");
                unwind.caught = true;
                Exit::Unwound(unwind.from)
            }
            Err(_) => fatal("panic escaped the body of a continuation"),
        },
    }
}

/// Reports a broken invariant that makes it impossible to continue.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{}, aborting", msg);
    std::process::abort()
}
