//! # Kernel synchronization primitives
//!
//! * [`SpinLock`] guards state shared across cores: the heap allocators,
//!   the shared-object registry, wait queues. It is held only for short,
//!   non-blocking critical sections.
//! * [`WaitChannel`] is the single suspension point. A task sleeping on a
//!   channel atomically gives up the spin lock guarding its condition.
//! * [`SleepLock`] and [`Semaphore`] are built on a channel and may block.
//!
//! Blocking needs a scheduler, which lives outside this crate; the
//! [`Scheduler`] trait is the seam.
//!
//! ```rust
//! use kernel_sync::SpinLock;
//!
//! static FREE_PAGES: SpinLock<u32> = SpinLock::named("free pages", 16);
//! let taken = FREE_PAGES.with_lock(|free| {
//!     *free -= 1;
//!     *free
//! });
//! assert_eq!(taken, 15);
//! assert!(!FREE_PAGES.is_locked());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod channel;
mod scheduler;
mod semaphore;
mod sleep_lock;
mod spin_lock;

pub use channel::WaitChannel;
pub use scheduler::Scheduler;
pub use semaphore::Semaphore;
pub use sleep_lock::SleepLock;
pub use spin_lock::{SpinLock, SpinLockGuard};
