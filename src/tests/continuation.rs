use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::{println, ptr, thread};

use crate::stack::{
    PooledStack, ProtectedFixedSizeStack, StackAllocator, StackContext, StackError,
};
use crate::{callcc, callcc_with, try_callcc_with, Continuation};

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

// Counts the stacks handed out and given back.
#[derive(Clone, Default)]
struct CountingStack {
    inner: ProtectedFixedSizeStack,
    allocated: Rc<Cell<usize>>,
    released: Rc<Cell<usize>>,
}

unsafe impl StackAllocator for CountingStack {
    fn allocate(&mut self) -> Result<StackContext, StackError> {
        let sctx = self.inner.allocate()?;
        self.allocated.set(self.allocated.get() + 1);
        Ok(sctx)
    }

    unsafe fn deallocate(&mut self, sctx: StackContext) {
        self.inner.deallocate(sctx);
        self.released.set(self.released.get() + 1);
    }
}

#[test]
fn smoke() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let done = callcc(move |main| {
        hit2.set(true);
        main
    });
    assert!(hit.get());
    assert!(!done.is_empty());
    assert!(!done.is_resumable());
}

#[test]
fn suspend_and_resume() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let c = callcc(move |main| {
        let main = main.resume();
        hit2.set(true);
        main.resume()
    });
    assert!(!hit.get());
    assert!(c.is_resumable());
    let c = c.resume();
    assert!(hit.get());
    assert!(c.is_resumable());
    let c = c.resume();
    assert!(!c.is_resumable());
}

// A body which suspends N times hands out N + 1 continuations to main.
#[test]
fn resumable_count() {
    const SUSPENDS: usize = 5;

    let mut handles = 0;
    let mut c = callcc(|mut main| {
        for _ in 0..SUSPENDS {
            main = main.resume();
        }
        main
    });
    handles += 1;
    while c.is_resumable() {
        c = c.resume();
        handles += 1;
    }
    assert_eq!(handles, SUSPENDS + 1);
}

#[test]
fn caller_handle_is_resumable() {
    callcc(|main| {
        assert!(main.is_resumable());
        assert!(!main.is_empty());
        main
    });
}

// Control goes straight from one continuation to another without passing
// through main.
#[test]
fn symmetric_transfer() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let log2 = log.clone();
    let b = callcc(move |caller| {
        log2.borrow_mut().push("b1");
        let a = caller.resume();
        log2.borrow_mut().push("b2");
        a
    });

    let log2 = log.clone();
    let done = callcc(move |main| {
        log2.borrow_mut().push("a1");
        let b = b.resume();
        assert!(!b.is_resumable());
        log2.borrow_mut().push("a2");
        main
    });

    assert!(!done.is_resumable());
    assert_eq!(*log.borrow(), ["b1", "a1", "b2", "a2"]);
}

#[test]
fn resume_with_runs_once() {
    let calls = Rc::new(Cell::new(0));
    let calls2 = calls.clone();
    let c = callcc(move |main| {
        let main = main.resume_with(move |c| {
            calls2.set(calls2.get() + 1);
            c
        });
        main.resume()
    });
    assert_eq!(calls.get(), 1);
    assert!(c.is_resumable());
    let c = c.resume();
    assert_eq!(calls.get(), 1);
    let c = c.resume();
    assert!(!c.is_resumable());
    assert_eq!(calls.get(), 1);
}

// The transform runs before the target's pending resume returns and its
// result is what that resume returns.
#[test]
fn resume_with_replaces_result() {
    let seen = Rc::new(Cell::new(false));
    let seen2 = seen.clone();
    let parked = Rc::new(RefCell::new(None));
    let parked2 = parked.clone();

    let c = callcc(move |main| {
        main.resume_with(move |me| {
            assert!(me.is_resumable());
            seen2.set(true);
            *parked2.borrow_mut() = Some(me);
            Continuation::default()
        })
    });
    assert!(seen.get());
    assert!(c.is_empty());

    let me = parked.borrow_mut().take().unwrap();
    let done = me.resume();
    assert!(!done.is_resumable());
}

// A continuation whose transform drops it while it is the caller: the
// continuation is unwound and the target sees an empty handle.
#[test]
fn resume_with_drops_caller() {
    let inner_dropped = Rc::new(Cell::new(false));
    let inner_dropped2 = inner_dropped.clone();

    let done = callcc(move |main| {
        let c = callcc(move |outer| {
            let _guard = SetOnDrop(inner_dropped2);
            outer.resume_with(|inner| {
                drop(inner);
                Continuation::default()
            })
        });
        assert!(c.is_empty());
        main
    });

    assert!(inner_dropped.get());
    assert!(!done.is_resumable());
}

#[test]
fn resume_with_from_main() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let order2 = order.clone();
    let c = callcc(|main| main.resume());

    let order3 = order.clone();
    let c = c.resume_with(move |main| {
        order2.borrow_mut().push("transform");
        main
    });
    order3.borrow_mut().push("returned");
    assert!(!c.is_resumable());
    assert_eq!(*order.borrow(), ["transform", "returned"]);
}

#[test]
#[should_panic(expected = "attempt to resume an empty continuation")]
fn resume_empty() {
    Continuation::default().resume();
}

#[test]
#[should_panic(expected = "attempt to resume a terminated continuation")]
fn resume_terminated() {
    let c = callcc(|main| main);
    c.resume();
}

#[test]
fn drop_finished() {
    let salloc = CountingStack::default();
    let entered = Rc::new(Cell::new(0));
    let entered2 = entered.clone();

    let c = callcc_with(salloc.clone(), move |main| {
        entered2.set(entered2.get() + 1);
        main
    });
    assert_eq!(entered.get(), 1);
    assert_eq!(salloc.allocated.get(), 1);
    assert_eq!(salloc.released.get(), 0);

    drop(c);
    assert_eq!(entered.get(), 1);
    assert_eq!(salloc.released.get(), 1);
}

#[test]
fn force_unwind() {
    let a = Rc::new(Cell::new(false));
    let b = Rc::new(Cell::new(false));
    let a_drop = SetOnDrop(a.clone());
    let b_drop = SetOnDrop(b.clone());
    let reached = Rc::new(Cell::new(false));
    let reached2 = reached.clone();

    let c = callcc(move |main| {
        drop(a_drop);
        let _b = b_drop;
        let main = main.resume();
        reached2.set(true);
        main
    });
    assert!(a.get());
    assert!(!b.get());

    drop(c);
    assert!(b.get());
    assert!(!reached.get());
}

#[test]
fn force_unwind_many() {
    const COUNT: usize = 8;

    let salloc = CountingStack::default();
    let flags: Vec<_> = (0..COUNT).map(|_| Rc::new(Cell::new(false))).collect();
    let handles: Vec<_> = flags
        .iter()
        .map(|flag| {
            let guard = SetOnDrop(flag.clone());
            callcc_with(salloc.clone(), move |main| {
                let _guard = guard;
                main.resume()
            })
        })
        .collect();

    assert!(handles.iter().all(Continuation::is_resumable));
    assert_eq!(salloc.allocated.get(), COUNT);
    assert_eq!(salloc.released.get(), 0);

    drop(handles);
    assert_eq!(salloc.released.get(), COUNT);
    assert!(flags.iter().all(|flag| flag.get()));
}

// Dropping a continuation which itself holds a suspended continuation
// unwinds both.
#[test]
fn force_unwind_nested() {
    let outer_dropped = Rc::new(Cell::new(false));
    let inner_dropped = Rc::new(Cell::new(false));
    let outer_guard = SetOnDrop(outer_dropped.clone());
    let inner_guard = SetOnDrop(inner_dropped.clone());

    let c = callcc(move |main| {
        let _guard = outer_guard;
        let inner = callcc(move |outer| {
            let _guard = inner_guard;
            outer.resume()
        });
        assert!(inner.is_resumable());
        let main = main.resume();
        drop(inner);
        main
    });

    assert!(!outer_dropped.get());
    assert!(!inner_dropped.get());
    drop(c);
    assert!(outer_dropped.get());
    assert!(inner_dropped.get());
}

#[test]
fn try_callcc_with_reports_errors() {
    struct Exhausted;

    unsafe impl StackAllocator for Exhausted {
        fn allocate(&mut self) -> Result<StackContext, StackError> {
            Err(StackError::TooLarge {
                requested: 1,
                maximum: 0,
            })
        }

        unsafe fn deallocate(&mut self, _sctx: StackContext) {
            unreachable!();
        }
    }

    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let result = try_callcc_with(Exhausted, move |main| {
        hit2.set(true);
        main
    });
    assert!(matches!(result, Err(StackError::TooLarge { .. })));
    assert!(!hit.get());
}

#[test]
fn try_callcc_with_oversized_stack() {
    let salloc = match ProtectedFixedSizeStack::new(usize::MAX) {
        Ok(salloc) => salloc,
        Err(StackError::TooLarge { .. }) => return,
        Err(err) => panic!("unexpected error: {}", err),
    };
    let result = try_callcc_with(salloc, |main| main);
    assert!(matches!(result, Err(StackError::TooLarge { .. })));
}

#[test]
fn pooled_stacks_are_reused() {
    let inner = CountingStack::default();
    let pool = PooledStack::new(inner.clone(), 2);

    for i in 0..4 {
        let c = callcc_with(pool.clone(), move |main| {
            let main = main.resume();
            assert!(i < 4);
            main
        });
        assert_eq!(pool.cached(), 0);
        drop(c);
        assert_eq!(pool.cached(), 1);
    }
    assert_eq!(inner.allocated.get(), 1);
    assert_eq!(inner.released.get(), 0);

    drop(pool);
    assert_eq!(inner.released.get(), 1);
}

#[test]
fn empty_handle() {
    let mut a = Continuation::default();
    let b = Continuation::default();
    assert!(a.is_empty());
    assert!(!a.is_resumable());
    assert_eq!(a, b);
    assert_eq!(format!("{:?}", a), "Continuation({not-a-context})");

    let mut c = callcc(|main| main);
    assert!(a < c);
    assert_ne!(a, c);
    assert!(format!("{:?}", c).starts_with("Continuation(0x"));

    a.swap(&mut c);
    assert!(!a.is_empty());
    assert!(c.is_empty());
}

#[test]
fn identity() {
    let a = callcc(|main| main);
    let b = callcc(|main| main);
    assert_ne!(a, b);
    assert_ne!(a.cmp(&b), std::cmp::Ordering::Equal);
    assert_eq!(format!("{:?}", a), format!("Continuation({:p})", a));

    let set: HashSet<_> = [a, b, Continuation::default()].into_iter().collect();
    assert_eq!(set.len(), 3);
}

#[test]
fn stack_growth() {
    let done = callcc(|main| {
        fn recurse(i: u32, p: &mut [u8; 10000]) {
            unsafe {
                // Ensure the stack allocation isn't optimized away.
                ptr::read_volatile(&p);
            }
            if i > 0 {
                recurse(i - 1, &mut [0; 10000]);
            }
        }

        // Use ~500KB of stack.
        recurse(50, &mut [0; 10000]);
        main
    });
    assert!(!done.is_resumable());
}

#[test]
fn stack_alignment() {
    #[repr(align(128))]
    struct Aligned(u8);

    let c = callcc(|main| {
        let x = Aligned(1);
        assert_eq!(&x as *const Aligned as usize % 128, 0);
        let main = main.resume();
        assert_eq!(unsafe { ptr::read_volatile(&x.0) }, 1);
        main
    });
    let c = c.resume();
    assert!(!c.is_resumable());
}

#[test]
fn backtrace() {
    #[inline(never)] // try to get this to show up in backtraces
    fn look_for_me() {
        let trace = backtrace::Backtrace::new();
        println!("{:?}", trace);
        assert!(trace
            .frames()
            .iter()
            .flat_map(|f| f.symbols())
            .filter_map(|s| Some(s.name()?.to_string()))
            .any(|s| s.contains("look_for_me")));
    }

    let c = callcc(|main| {
        look_for_me();
        let main = main.resume();
        look_for_me();
        main
    });
    let c = c.resume();
    assert!(!c.is_resumable());
}

#[test]
fn threads() {
    let threads: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let mut total = 0;
                let mut c = callcc(move |mut main| {
                    for _ in 0..i {
                        main = main.resume();
                    }
                    main
                });
                while c.is_resumable() {
                    total += 1;
                    c = c.resume();
                }
                total
            })
        })
        .collect();

    for (i, thread) in threads.into_iter().enumerate() {
        assert_eq!(thread.join().unwrap(), i);
    }
}

// The per-thread bookkeeping is released with the last continuation and set
// up again by the next one.
#[test]
fn registry_reinitialized() {
    for _ in 0..3 {
        let c = callcc(|main| {
            assert!(main.is_resumable());
            main.resume()
        });
        assert!(c.is_resumable());
        let c = c.resume();
        assert!(!c.is_resumable());
        drop(c);
    }
}
