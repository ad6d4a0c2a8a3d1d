//! # Kernel and User Heap Allocation
//!
//! Two-tier heap allocators sharing one placement policy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │      Kernel Heap (kheap)     │   │      User Heap (uheap)       │
//! │  kmalloc / kfree / krealloc  │   │ malloc / free / smalloc /    │
//! │  physical ⇄ virtual lookup   │   │ sget / sfree / realloc       │
//! └───────┬──────────────┬───────┘   └───────┬──────────────┬───────┘
//!         │ ≤ 2 KiB      │ > 2 KiB           │ ≤ 2 KiB      │ > 2 KiB
//! ┌───────▼──────┐ ┌─────▼────────┐  ┌───────▼──────┐ ┌─────▼────────┐
//! │    Block     │ │    Chunk     │  │    Block     │ │    Chunk     │
//! │  Allocator   │ │  Allocator   │  │  Allocator   │ │  Allocator   │
//! └───────┬──────┘ └─────┬────────┘  └───────┬──────┘ └─────┬────────┘
//!         │              │                   │              │
//! ┌───────▼──────────────▼───────┐   ┌───────▼──────────────▼───────┐
//! │ frames + kernel page tables  │   │   UserMemorySyscalls (kernel) │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ### Block Allocator ([`block`])
//! Slab-style allocation in nine power-of-two size classes from 8 to 2048
//! bytes. Pages are carved into blocks of one class on demand and handed
//! back through a [`PageProvider`] once all their blocks are free.
//!
//! ### Chunk Allocator ([`chunk`])
//! Page-granular allocation over an address-ordered list of chunks. Placement
//! is exact fit, then worst fit with a split, then bumping the break. Freed
//! chunks coalesce with free neighbours immediately and a free chunk at the
//! end of the list gives its space back to the break.
//!
//! ### Kernel Heap ([`kheap`]) and User Heap ([`uheap`])
//! Front ends that route a request to one of the two tiers. The kernel heap
//! backs pages with frames it maps itself and can translate between
//! physical and virtual addresses; the user heap asks the kernel through
//! [`UserMemorySyscalls`](uheap::UserMemorySyscalls).
//!
//! ## Bookkeeping
//!
//! Free blocks and chunk records are tracked in side tables (`Vec`s of
//! addresses and an index-linked record pool), never inside the memory they
//! describe. Nothing here dereferences a heap address.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod block;
pub mod chunk;
pub mod kheap;
pub mod uheap;

pub use block::BlockAllocator;
pub use chunk::{Chunk, ChunkAllocator, Placement, find_placement};
pub use kheap::{KernelHeap, KernelMemory, LockedKernelHeap};
pub use uheap::{UserHeap, UserMemorySyscalls};

use kernel_memory_addresses::VirtualAddress;
use kernel_shm::ShareError;

/// Backs and releases single pages of a heap's address range.
pub trait PageProvider {
    /// Make the page at `va` usable.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no memory is available for it.
    fn get_page(&mut self, va: VirtualAddress) -> Result<(), AllocError>;

    /// Give the page at `va` back.
    fn return_page(&mut self, va: VirtualAddress);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("chunk record pool exhausted")]
    PoolExhausted,
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("address {0} is not managed by this heap")]
    InvalidAddress(VirtualAddress),
    #[error("address {0} is not an allocated block or chunk")]
    NotAllocated(VirtualAddress),
    #[error("heap is not initialized")]
    Uninitialized,
    #[error("shared object: {0}")]
    Share(#[from] ShareError),
}
