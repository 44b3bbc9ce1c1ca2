use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::capture;
use crate::record::ActivationRecord;
use crate::stack::{ProtectedFixedSizeStack, StackAllocator, StackError};
use crate::unwind;

/// Stack size used by [`callcc`].
pub const CALLCC_STACK_SIZE: usize = 4 * 1024 * 1024;

/// A suspended execution context.
///
/// A `Continuation` is the only reference to a suspended computation: either
/// a continuation created by [`callcc`], or the thread's own stack when a
/// continuation switches back to it. Resuming consumes the handle and
/// returns a new one referring to whichever context switched back.
///
/// A continuation whose computation has finished is still a valid handle,
/// it just can't be resumed anymore (see [`is_resumable`]). Dropping it frees
/// its stack.
///
/// # Dropping a suspended continuation
///
/// When the handle to a suspended continuation is dropped, its stack is
/// unwound so that all objects on it are properly dropped. This is done by
/// resuming it one last time and making the pending `resume` call on its
/// side panic with an internal payload, which is caught at the root of the
/// continuation. Code running in a continuation must therefore let panics
/// it didn't raise itself propagate: swallowing that payload aborts the
/// process.
///
/// This requires the crate to be compiled with `-C panic=unwind`.
///
/// # Threads
///
/// Continuations are bound to the thread that created them and are neither
/// `Send` nor `Sync`.
///
/// [`is_resumable`]: Continuation::is_resumable
pub struct Continuation {
    record: Option<NonNull<ActivationRecord>>,

    // Continuation must be !Send and !Sync.
    /// ```compile_fail
    /// fn send<T: Send>() {}
    /// send::<callcc::Continuation>();
    /// ```
    marker: PhantomData<*mut ()>,
}

/// Creates a new continuation executing `f` on a fresh
/// [`CALLCC_STACK_SIZE`] stack and switches to it immediately.
///
/// `f` receives the continuation of the caller and returns the continuation
/// to switch to once it finishes. `callcc` returns when something switches
/// back to the caller: either `f` suspending itself by resuming the caller,
/// or `f` finishing.
///
/// # Panics
///
/// Panics if [`CALLCC_STACK_SIZE`] exceeds the platform's stack limit or if
/// the stack could not be allocated.
pub fn callcc<F>(f: F) -> Continuation
where
    F: FnOnce(Continuation) -> Continuation + 'static,
{
    let salloc = ProtectedFixedSizeStack::new(CALLCC_STACK_SIZE).expect("invalid stack size");
    callcc_with(salloc, f)
}

/// Like [`callcc`], but obtains the stack from `salloc`.
///
/// The allocator is kept alive alongside the continuation and is used to
/// release the stack once the continuation is gone.
///
/// # Panics
///
/// Panics if the stack could not be allocated.
pub fn callcc_with<S, F>(salloc: S, f: F) -> Continuation
where
    S: StackAllocator + 'static,
    F: FnOnce(Continuation) -> Continuation + 'static,
{
    try_callcc_with(salloc, f).expect("failed to allocate stack")
}

/// Like [`callcc_with`], but returns an error if the stack could not be
/// allocated.
pub fn try_callcc_with<S, F>(salloc: S, f: F) -> Result<Continuation, StackError>
where
    S: StackAllocator + 'static,
    F: FnOnce(Continuation) -> Continuation + 'static,
{
    let record = capture::create(salloc, f)?;
    Ok(Continuation::from_raw(record).resume())
}

impl Continuation {
    #[inline]
    fn from_raw(record: NonNull<ActivationRecord>) -> Self {
        Self {
            record: Some(record),
            marker: PhantomData,
        }
    }

    /// Releases ownership of the record without touching it.
    #[inline]
    pub(crate) fn into_raw(mut self) -> Option<NonNull<ActivationRecord>> {
        self.record.take()
    }

    /// Switches to this continuation.
    ///
    /// The current context is suspended until something resumes the
    /// continuation returned to the other side. The returned continuation
    /// refers to the context which switched back to us.
    ///
    /// # Panics
    ///
    /// Panics if the continuation is empty or has already finished.
    pub fn resume(mut self) -> Continuation {
        let target = self.take_resumable();
        unsafe { Self::switched_from(ActivationRecord::resume(target)) }
    }

    /// Switches to this continuation and runs `f` on top of it.
    ///
    /// `f` is executed in the context of the target, as if the target's
    /// pending `resume` had returned the continuation of the current
    /// context, and whatever `f` returns is what that `resume` actually
    /// returns. This allows suspending and redirecting in a single step:
    /// e.g. handing our own continuation over to someone else while the
    /// target carries on.
    ///
    /// `f` is invoked exactly once, for this switch only.
    ///
    /// # Panics
    ///
    /// Panics if the continuation is empty or has already finished.
    pub fn resume_with<F>(mut self, f: F) -> Continuation
    where
        F: FnOnce(Continuation) -> Continuation + 'static,
    {
        let target = self.take_resumable();
        unsafe {
            target.as_ref().set_ontop(Box::new(f));
            Self::switched_from(ActivationRecord::resume(target))
        }
    }

    fn take_resumable(&mut self) -> NonNull<ActivationRecord> {
        let record = self
            .record
            .expect("attempt to resume an empty continuation");
        assert!(
            !unsafe { record.as_ref() }.is_terminated(),
            "attempt to resume a terminated continuation"
        );
        self.record = None;
        record
    }

    /// Completes a switch on the receiving side.
    ///
    /// `prev` is the record that switched to us. A pending forced unwind
    /// takes precedence over a pending transform; either is consumed here.
    pub(crate) unsafe fn switched_from(prev: NonNull<ActivationRecord>) -> Continuation {
        let current = ActivationRecord::current();
        let current = current.as_ref();

        if current.take_force_unwind() {
            drop(current.take_ontop());
            unwind::raise(prev);
        }

        let caller = Continuation::from_raw(prev);
        match current.take_ontop() {
            Some(f) => f(caller),
            None => caller,
        }
    }

    /// Returns whether this continuation can be resumed, i.e. it is not
    /// empty and has not finished.
    #[inline]
    pub fn is_resumable(&self) -> bool {
        match self.record {
            Some(record) => !unsafe { record.as_ref() }.is_terminated(),
            None => false,
        }
    }

    /// Returns whether this handle refers to no context at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }

    /// Exchanges the contexts referred to by two handles.
    #[inline]
    pub fn swap(&mut self, other: &mut Continuation) {
        mem::swap(&mut self.record, &mut other.record);
    }

    #[inline]
    fn addr(&self) -> *const ActivationRecord {
        match self.record {
            Some(record) => record.as_ptr(),
            None => ptr::null(),
        }
    }
}

impl Default for Continuation {
    /// Creates an empty continuation.
    #[inline]
    fn default() -> Self {
        Self {
            record: None,
            marker: PhantomData,
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        let record = match self.record.take() {
            Some(record) => record,
            None => return,
        };

        unsafe {
            let this = record.as_ref();
            if this.is_main() {
                return;
            }

            if !this.is_terminated() {
                this.request_force_unwind();
                ActivationRecord::resume(record);
                assert!(
                    this.is_terminated(),
                    "continuation did not terminate after a forced unwind"
                );
            }

            ActivationRecord::deallocate(record);
        }
    }
}

impl PartialEq for Continuation {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Continuation {}

impl PartialOrd for Continuation {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Continuation {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl Hash for Continuation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Pointer for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.addr(), f)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record {
            Some(record) => write!(f, "Continuation({:p})", record),
            None => f.write_str("Continuation({not-a-context})"),
        }
    }
}
