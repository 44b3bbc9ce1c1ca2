//! Activation records and the per-thread registry of the running record.
//!
//! An activation record is the control block of one suspendable execution.
//! Every continuation owns one, and every thread that has ever used a
//! continuation has an extra "main" record standing for the thread's own
//! stack. Records are only ever touched by the thread that created them,
//! which is why all of their state lives in plain `Cell`s.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::arch;
use crate::stack::{StackContext, StackPointer};
use crate::unwind::fatal;
use crate::Continuation;

/// One-shot function that rewrites the result of a pending resume.
pub(crate) type Transform = Box<dyn FnOnce(Continuation) -> Continuation>;

pub(crate) struct ActivationRecord {
    // Stack pointer at which the record was suspended. `None` while the
    // record is running and once it has terminated.
    sp: Cell<Option<StackPointer>>,

    // Stack the record executes on. `None` for the main record, which runs
    // on the thread's own stack.
    stack: Option<StackContext>,

    // Record that most recently switched to this one. Set by the switching
    // side and consumed once this record is running again.
    from: Cell<Option<NonNull<ActivationRecord>>>,

    // Transform to apply when the pending resume of this record returns.
    ontop: Cell<Option<Transform>>,

    terminated: Cell<bool>,
    force_unwind: Cell<bool>,

    // Frees the record together with its stack.
    destroy: Option<unsafe fn(NonNull<ActivationRecord>)>,
}

impl ActivationRecord {
    fn main() -> Self {
        Self {
            sp: Cell::new(None),
            stack: None,
            from: Cell::new(None),
            ontop: Cell::new(None),
            terminated: Cell::new(false),
            force_unwind: Cell::new(false),
            destroy: None,
        }
    }

    /// Creates the record of a continuation running on `stack`.
    ///
    /// The record is not resumable until it has been given a stack pointer
    /// with [`suspended_at`](Self::suspended_at).
    pub(crate) fn new(stack: StackContext, destroy: unsafe fn(NonNull<ActivationRecord>)) -> Self {
        Self {
            stack: Some(stack),
            destroy: Some(destroy),
            ..Self::main()
        }
    }

    #[inline]
    pub(crate) fn is_main(&self) -> bool {
        self.destroy.is_none()
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    #[inline]
    pub(crate) fn stack(&self) -> Option<StackContext> {
        self.stack
    }

    #[inline]
    pub(crate) fn set_ontop(&self, f: Transform) {
        self.ontop.set(Some(f));
    }

    #[inline]
    pub(crate) fn take_ontop(&self) -> Option<Transform> {
        self.ontop.take()
    }

    #[inline]
    pub(crate) fn request_force_unwind(&self) {
        self.force_unwind.set(true);
    }

    /// Consumes a pending forced unwind request.
    #[inline]
    pub(crate) fn take_force_unwind(&self) -> bool {
        self.force_unwind.replace(false)
    }

    /// Records where this record was suspended. Terminated records are never
    /// resumed again so their final stack pointer is not kept.
    #[inline]
    pub(crate) fn suspended_at(&self, sp: StackPointer) {
        if !self.terminated.get() {
            self.sp.set(Some(sp));
        }
    }

    /// Marks the record as finished. Only the record's own execution calls
    /// this, right before it switches away for the last time.
    pub(crate) fn terminate(&self) {
        self.terminated.set(true);
        self.force_unwind.set(false);
        self.from.set(None);
        drop(self.ontop.take());
        self.sp.set(None);
    }

    /// Returns the record currently running on this thread.
    #[inline]
    pub(crate) fn current() -> NonNull<ActivationRecord> {
        let current = CURRENT.with(Cell::get);
        match NonNull::new(current as *mut ActivationRecord) {
            Some(current) => current,
            None => fatal("no activation record is registered on this thread"),
        }
    }

    /// Switches to `target` and returns once some record switches back,
    /// yielding that record.
    ///
    /// # Safety
    ///
    /// `target` must be a live, suspended record created on this thread.
    pub(crate) unsafe fn resume(target: NonNull<ActivationRecord>) -> NonNull<ActivationRecord> {
        let record = target.as_ref();
        debug_assert!(!record.is_terminated());
        let sp = match record.sp.take() {
            Some(sp) => sp,
            None => fatal("attempt to switch to a continuation that is not suspended"),
        };

        record.from.set(Some(Self::current()));
        CURRENT.with(|current| current.set(target.as_ptr()));

        let from = arch::switch(sp);
        Self::switched_in(from)
    }

    /// Bookkeeping on the receiving side of a switch: consumes the link left
    /// by the record that switched to us and saves its stack pointer.
    ///
    /// This is also the first thing a fresh continuation does on entry.
    pub(crate) unsafe fn switched_in(from: StackPointer) -> NonNull<ActivationRecord> {
        let current = Self::current();
        let prev = match current.as_ref().from.take() {
            Some(prev) => prev,
            None => fatal("switched into a record without a return link"),
        };
        prev.as_ref().suspended_at(from);
        prev
    }

    /// Switches away from a terminated record for the last time.
    pub(crate) unsafe fn resume_final(next: Option<NonNull<ActivationRecord>>) -> ! {
        match next {
            Some(next) if !next.as_ref().is_terminated() => {
                Self::resume(next);
            }
            Some(_) => fatal("continuation finished by returning a terminated continuation"),
            None => fatal("continuation finished by returning an empty continuation"),
        }
        fatal("continuation already terminated")
    }

    /// Frees a record and its stack. Main records are left alone.
    ///
    /// # Safety
    ///
    /// The record must have terminated and must not be used afterwards.
    pub(crate) unsafe fn deallocate(record: NonNull<ActivationRecord>) {
        let this = record.as_ref();
        debug_assert!(this.is_main() || this.is_terminated());
        if let Some(destroy) = this.destroy {
            destroy(record);
        }
    }
}

thread_local! {
    // The record running on this thread. Null until a continuation is created.
    static CURRENT: Cell<*const ActivationRecord> = const { Cell::new(ptr::null()) };

    // Number of live `RegistryRef`s on this thread.
    static USERS: Cell<usize> = const { Cell::new(0) };
}

/// Keeps the main record of the current thread alive.
///
/// The first reference taken on a thread allocates the main record and makes
/// it current; dropping the last one frees it again. Every continuation holds
/// one for as long as its record exists.
///
/// The main record therefore lives for one cycle of continuation use rather
/// than for the whole life of the thread: once every continuation of the
/// thread is gone the record is freed, and the next `acquire` allocates a
/// fresh one. A handle to the main record can only be obtained from inside a
/// continuation, which keeps the record alive, so no handle outlives it
/// unless it is smuggled out past the last continuation.
pub(crate) struct RegistryRef {
    marker: PhantomData<*mut ()>,
}

impl RegistryRef {
    pub(crate) fn acquire() -> Self {
        let users = USERS.with(Cell::get);
        if users == 0 {
            let main = Box::into_raw(Box::new(ActivationRecord::main()));
            CURRENT.with(|current| current.set(main));
            tracing::trace!(main = ?main, "registered main record");
        }
        USERS.with(|count| count.set(users + 1));
        Self {
            marker: PhantomData,
        }
    }
}

impl Drop for RegistryRef {
    fn drop(&mut self) {
        let users = USERS.with(Cell::get) - 1;
        USERS.with(|count| count.set(users));
        if users == 0 {
            let main = CURRENT.with(|current| current.replace(ptr::null())) as *mut ActivationRecord;
            unsafe {
                assert!((*main).is_main(), "main record must be current at teardown");
                drop(Box::from_raw(main));
            }
            tracing::trace!(main = ?main, "released main record");
        }
    }
}
