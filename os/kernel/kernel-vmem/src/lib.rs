//! # Paging Capabilities
//!
//! The page-table and physical-frame primitives the heap allocators and the
//! fault handler are written against.
//!
//! ## Overview
//!
//! * [`FrameAllocator`] hands out zero-filled physical frames and exposes
//!   their descriptors ([`FrameInfo`]) and contents.
//! * [`AddressSpace`] is one page directory: it answers "is the table for
//!   this address present", reads and edits [`PagePermissions`], and installs
//!   or clears entries.
//! * [`map_frame`] and [`unmap_frame`] are the *only* operations that create or
//!   destroy a mapping. They maintain the frame's reference count and its
//!   reverse mapping ([`FrameInfo::virtual_address`]) together, so physical→
//!   virtual translation stays O(1) and never disagrees with the tables.
//!
//! ```text
//!   map_frame(space, frames, pa, va, perms)
//!        │
//!        ├── frames[pa].references += 1
//!        ├── frames[pa].virt_addr   = va
//!        └── space[va]              = pa | perms | PRESENT
//!
//!   unmap_frame(space, frames, va)
//!        │
//!        ├── space[va]              = (marker bits only)
//!        ├── frames[pa].virt_addr   = None
//!        └── frames[pa].references -= 1  ──► 0 ⇒ frame returns to the pool
//! ```
//!
//! ## Implementations
//!
//! [`FrameTable`] and [`SoftAddressSpace`] implement the traits in ordinary
//! memory. They model the hardware-maintained `used` and `modified` bits via
//! [`SoftAddressSpace::touch`], which makes the replacement policies testable
//! on a host.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod address_space;
mod fault_error;
mod frame;
mod mapping;
mod permissions;

pub use address_space::{AddressSpace, SoftAddressSpace};
pub use fault_error::PageFaultError;
pub use frame::{FrameAllocator, FrameInfo, FrameTable};
pub use mapping::{allocate_and_map, map_frame, release_frame, retain_frame, unmap_frame};
pub use permissions::PagePermissions;

pub use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmemError {
    #[error("out of physical frames")]
    OutOfMemory,
    #[error("no page table covers the address")]
    TableMissing,
    #[error("address is not mapped")]
    NotMapped,
    #[error("physical address {0} is not a managed frame")]
    UnknownFrame(PhysicalAddress),
}
