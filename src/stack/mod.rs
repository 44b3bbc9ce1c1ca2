//! Stacks used by continuations.
//!
//! In most cases the [`ProtectedFixedSizeStack`] used by [`callcc`] is all
//! that is needed. Any other allocator can be plugged in through
//! [`callcc_with`] as long as it implements [`StackAllocator`].
//!
//! [`callcc`]: crate::callcc
//! [`callcc_with`]: crate::callcc_with

use core::num::NonZeroUsize;
use std::io;

mod pool;
mod unix;

pub use self::pool::PooledStack;
pub use self::unix::{ProtectedFixedSizeStack, StackTraits};

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// A region of memory handed out by a [`StackAllocator`].
///
/// Stacks grow downwards, so `sp` is the highest address of the region and
/// `sp - size` the lowest. `size` covers the whole region, guard page
/// included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackContext {
    /// Top of the stack, i.e. one past its highest usable byte.
    pub sp: StackPointer,

    /// Total size of the region in bytes.
    pub size: usize,
}

impl StackContext {
    /// Lowest address of the region.
    #[inline]
    pub fn limit(&self) -> usize {
        self.sp.get() - self.size
    }
}

/// Errors that can occur while obtaining stack memory.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// The operating system refused to map the stack.
    #[error("failed to map {size} bytes of stack memory")]
    AllocationFailure {
        /// Number of bytes that were requested, guard page included.
        size: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The guard page could not be protected.
    #[error("failed to protect the stack guard page")]
    GuardPage {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The requested size exceeds the platform stack limit.
    #[error("requested stack size of {requested} bytes exceeds the limit of {maximum} bytes")]
    TooLarge {
        /// Requested usable size.
        requested: usize,
        /// Largest size the platform allows.
        maximum: usize,
    },
}

/// A source of stack memory for continuations.
///
/// # Safety
///
/// To preserve memory safety, every stack handed out must have a guard page
/// (or an equivalent mechanism) below its usable region, so that an
/// overflowing continuation faults instead of corrupting neighbouring memory.
/// The usable region must be at least [`StackTraits::minimum_size`] bytes.
pub unsafe trait StackAllocator {
    /// Obtains a new stack.
    fn allocate(&mut self) -> Result<StackContext, StackError>;

    /// Returns a stack previously obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `sctx` must come from this allocator and must not be released twice.
    /// Nothing may be executing on the stack anymore.
    unsafe fn deallocate(&mut self, sctx: StackContext);
}
