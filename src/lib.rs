//! Stackful, symmetric continuations.
//!
//! ## Overview
//!
//! This crate lets a program run a function on a separate stack, switch away
//! from it at any point in its call stack and later switch back in to carry
//! on exactly where it left off, all on a single OS thread. Control transfer
//! is symmetric: there is no parent/child relationship between contexts, any
//! context can switch to any suspended one as long as it holds its
//! [`Continuation`].
//!
//! ## Example
//!
//! ```rust
//! use callcc::callcc;
//!
//! fn main() {
//!     println!("[main] creating continuation");
//!
//!     let mut counter = 0;
//!     let mut source = callcc(|mut main| {
//!         for i in 0..3 {
//!             println!("[source] switching back with {}", i);
//!             main = main.resume();
//!         }
//!         println!("[source] exiting");
//!         main
//!     });
//!
//!     while source.is_resumable() {
//!         counter += 1;
//!         println!("[main] resuming source");
//!         source = source.resume();
//!     }
//!
//!     assert_eq!(counter, 3);
//!     println!("[main] exiting");
//! }
//! ```
//!
//! #### Output
//!
//! ```text
//! [main] creating continuation
//! [source] switching back with 0
//! [main] resuming source
//! [source] switching back with 1
//! [main] resuming source
//! [source] switching back with 2
//! [main] resuming source
//! [source] exiting
//! [main] exiting
//! ```
//!
//! ## Supported targets
//!
//! |         | ELF (Linux, BSD, etc) | Darwin (macOS, iOS, etc) |
//! |---------|-----------------------|--------------------------|
//! | x86_64  | ✅                     | ✅                        |
//! | AArch64 | ✅                     | ✅                        |
//!
//! ## Features
//!
//! #### Guarded stacks
//!
//! Stacks are mapped with an inaccessible guard page below them, so a
//! continuation that overflows its stack faults instead of corrupting
//! unrelated memory. See the [`stack`] module for the allocator interface.
//!
//! #### Transform on resume
//!
//! [`Continuation::resume_with`] switches to a continuation and runs a
//! function on top of it before its pending `resume` returns. The function
//! receives the continuation of the context that switched in and decides
//! what that `resume` returns.
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use callcc::{callcc, Continuation};
//!
//! // Somewhere to park a suspended context, e.g. a timer callback.
//! let parked: Rc<RefCell<Option<Continuation>>> = Default::default();
//! let parked2 = parked.clone();
//!
//! let c = callcc(move |main| {
//!     // Suspend, and have main's pending resume see an empty handle while
//!     // our own continuation is parked for later.
//!     let main = main.resume_with(move |me| {
//!         *parked2.borrow_mut() = Some(me);
//!         Continuation::default()
//!     });
//!     main
//! });
//! assert!(c.is_empty());
//!
//! // Later on, whoever holds the parked continuation resumes it.
//! let me = parked.borrow_mut().take().unwrap();
//! let done = me.resume();
//! assert!(!done.is_resumable());
//! ```
//!
//! #### Cleanup on drop
//!
//! If the last handle to a suspended continuation is dropped, the
//! continuation's stack is safely unwound using the same mechanism as
//! panics, which drops all local variables on it, before the stack is
//! freed. This requires `-C panic=unwind`.
//!
//! A panic escaping the function passed to [`callcc`] aborts the process:
//! there is no parent to propagate it to.

#![warn(missing_docs)]

// Must come first because it defines macros used by other modules.
mod arch;

mod capture;
mod continuation;
mod record;
pub mod stack;
mod unwind;

pub use continuation::*;

#[cfg(test)]
mod tests;
