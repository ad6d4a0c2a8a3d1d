//! # Kernel Memory Layout
//!
//! Compile-time constants describing the virtual address-space layout that
//! the heap allocators, the fault handler and the replacement engine agree
//! on. This crate is the single source of truth for those boundaries; every
//! range check in the paging code is phrased against the constants in
//! [`memory`].
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   Program image, data, bss      │
//! USER_HEAP_  ├─────────────────────────────────┤ 0x8000_0000
//!   START     │   User block-allocator pages    │
//!             ├─────────────────────────────────┤ + DYN_ALLOC_MAX_SIZE
//!             │   guard page                    │
//!             ├─────────────────────────────────┤
//!             │   User page allocator (chunks)  │
//! USER_HEAP_  ├─────────────────────────────────┤ 0xA000_0000
//!   MAX       │                                 │
//! USTACK-     ├─────────────────────────────────┤
//!   BOTTOM    │   User stack (grows down)       │
//! USTACKTOP   ├─────────────────────────────────┤
//!             │   stack-underflow gap           │
//! USER_TOP    ├─────────────────────────────────┤ 0xEEC0_0000
//!             │   Kernel stacks, per-CPU data   │
//! KERNEL_BASE ├─────────────────────────────────┤ 0xF000_0000
//!             │   Direct map of physical memory │
//! KERNEL_HEAP_├─────────────────────────────────┤ 0xF600_0000
//!   START     │   Kernel block-allocator pages  │
//!             ├─────────────────────────────────┤ + DYN_ALLOC_MAX_SIZE
//!             │   guard page                    │
//!             ├─────────────────────────────────┤
//!             │   Kernel page allocator         │
//! KERNEL_HEAP_└─────────────────────────────────┘ 0xFFFF_F000
//!   MAX
//! ```
//!
//! Both heaps share the same two-tier shape: a block allocator for requests
//! of at most [`memory::DYN_ALLOC_MAX_BLOCK_SIZE`] bytes and a page-granular
//! chunk allocator above it.
//!
//! ### Design Principles
//! * **Fixed Layout**: Compile-time constants, validated with `const`
//!   assertions, so an inconsistent layout fails the build.
//! * **Demand-Zero Regions**: The user heap and user stack are the only
//!   ranges where a page may be touched before it was ever written to the
//!   page file.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
