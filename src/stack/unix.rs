use std::io::Error;
use std::ptr;
use std::sync::OnceLock;

use super::{StackAllocator, StackContext, StackError, StackPointer};

/// Platform limits that apply to continuation stacks.
///
/// The page size and the stack resource limit are queried once per process.
#[derive(Clone, Copy, Debug)]
pub struct StackTraits;

fn stack_limit() -> libc::rlimit {
    static LIMIT: OnceLock<libc::rlimit> = OnceLock::new();
    *LIMIT.get_or_init(|| {
        let mut limit = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        // On failure the limit is left as unbounded.
        unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };
        limit
    })
}

impl StackTraits {
    /// Size of a memory page.
    pub fn page_size() -> usize {
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| {
            let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            assert!(pagesize.is_power_of_two());
            pagesize
        })
    }

    /// Whether the platform imposes no upper bound on stack sizes.
    pub fn is_unbounded() -> bool {
        stack_limit().rlim_max == libc::RLIM_INFINITY
    }

    /// Stack size used when none is specified.
    pub fn default_size() -> usize {
        128 * 1024
    }

    /// Smallest stack that can safely run code, including signal handlers.
    pub fn minimum_size() -> usize {
        libc::MINSIGSTKSZ as usize
    }

    /// Largest stack the platform allows, or `None` if it is unbounded.
    pub fn maximum_size() -> Option<usize> {
        if Self::is_unbounded() {
            None
        } else {
            Some(stack_limit().rlim_max as usize)
        }
    }
}

/// Fixed-size stack allocated with `mmap`, with a guard page below it.
///
/// Overflowing the stack touches the guard page and faults immediately
/// instead of silently corrupting whatever memory lies below.
#[derive(Clone, Copy, Debug)]
pub struct ProtectedFixedSizeStack {
    size: usize,
}

impl ProtectedFixedSizeStack {
    /// Creates an allocator handing out stacks with at least `size` usable
    /// bytes.
    ///
    /// Sizes below [`StackTraits::minimum_size`] are rounded up to it.
    pub fn new(size: usize) -> Result<Self, StackError> {
        let size = size.max(StackTraits::minimum_size());
        if let Some(maximum) = StackTraits::maximum_size() {
            if size > maximum {
                return Err(StackError::TooLarge {
                    requested: size,
                    maximum,
                });
            }
        }
        Ok(Self { size })
    }

    /// Usable size of the stacks handed out, before rounding to pages.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for ProtectedFixedSizeStack {
    fn default() -> Self {
        Self {
            size: StackTraits::default_size().max(StackTraits::minimum_size()),
        }
    }
}

unsafe impl StackAllocator for ProtectedFixedSizeStack {
    fn allocate(&mut self) -> Result<StackContext, StackError> {
        // Round up to whole pages and add a guard page at the bottom.
        let page_size = StackTraits::page_size();
        let mmap_len = self
            .size
            .checked_add(page_size - 1)
            .map(|size| size / page_size)
            .and_then(|pages| pages.checked_add(1))
            .and_then(|pages| pages.checked_mul(page_size))
            .ok_or(StackError::TooLarge {
                requested: self.size,
                // Largest usable size whose mapping, guard page included,
                // still fits in the address space.
                maximum: (usize::MAX / page_size - 1) * page_size,
            })?;

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANON | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(StackError::AllocationFailure {
                    size: mmap_len,
                    source: Error::last_os_error(),
                });
            }

            // Release the mapping again if the guard page can't be set up.
            let unmap = scopeguard::guard(mmap, |mmap| {
                libc::munmap(mmap, mmap_len);
            });

            if libc::mprotect(*unmap, page_size, libc::PROT_NONE) != 0 {
                return Err(StackError::GuardPage {
                    source: Error::last_os_error(),
                });
            }

            let mmap = scopeguard::ScopeGuard::into_inner(unmap);
            tracing::trace!(base = mmap as usize, size = mmap_len, "mapped stack");

            Ok(StackContext {
                sp: StackPointer::new_unchecked(mmap as usize + mmap_len),
                size: mmap_len,
            })
        }
    }

    unsafe fn deallocate(&mut self, sctx: StackContext) {
        let base = sctx.limit();
        let ret = libc::munmap(base as *mut libc::c_void, sctx.size);
        debug_assert_eq!(ret, 0);
        tracing::trace!(base, size = sctx.size, "unmapped stack");
    }
}
