use std::cell::RefCell;
use std::rc::Rc;

use super::{StackAllocator, StackContext, StackError};

struct Pool<A: StackAllocator> {
    inner: A,
    free: Vec<StackContext>,
    capacity: usize,
}

impl<A: StackAllocator> Drop for Pool<A> {
    fn drop(&mut self) {
        for sctx in self.free.drain(..) {
            unsafe { self.inner.deallocate(sctx) };
        }
    }
}

/// Allocator adapter which keeps released stacks around for reuse.
///
/// Up to `capacity` stacks are cached; anything beyond that goes straight
/// back to the inner allocator. Clones share the same cache, so a single pool
/// can back any number of continuations on one thread. Cached stacks are
/// released when the last clone is dropped.
///
/// Reused stacks are not cleared.
pub struct PooledStack<A: StackAllocator> {
    pool: Rc<RefCell<Pool<A>>>,
}

impl<A: StackAllocator> PooledStack<A> {
    /// Creates a pool on top of `inner` which caches at most `capacity`
    /// stacks.
    pub fn new(inner: A, capacity: usize) -> Self {
        Self {
            pool: Rc::new(RefCell::new(Pool {
                inner,
                free: Vec::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Number of stacks currently waiting to be reused.
    pub fn cached(&self) -> usize {
        self.pool.borrow().free.len()
    }
}

impl<A: StackAllocator> Clone for PooledStack<A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

unsafe impl<A: StackAllocator> StackAllocator for PooledStack<A> {
    fn allocate(&mut self) -> Result<StackContext, StackError> {
        let mut pool = self.pool.borrow_mut();
        match pool.free.pop() {
            Some(sctx) => Ok(sctx),
            None => pool.inner.allocate(),
        }
    }

    unsafe fn deallocate(&mut self, sctx: StackContext) {
        let mut pool = self.pool.borrow_mut();
        if pool.free.len() < pool.capacity {
            pool.free.push(sctx);
        } else {
            pool.inner.deallocate(sctx);
        }
    }
}
