//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// Start of the kernel's statically direct-mapped region.
///
/// Any kernel virtual address at or above this value that has no page-table
/// entry translates to physical memory by subtracting [`KERNEL_BASE`].
pub const KERNEL_BASE: u64 = 0xF000_0000;

/// First address of the kernel heap.
pub const KERNEL_HEAP_START: u64 = 0xF600_0000;

/// Upper bound (exclusive) of the kernel heap; faults above it are fatal.
pub const KERNEL_HEAP_MAX: u64 = 0xFFFF_F000;

/// Bytes reserved at the start of each heap for the block allocator.
pub const DYN_ALLOC_MAX_SIZE: u64 = 32 << 20;

/// Largest request served by the block allocator.
pub const DYN_ALLOC_MAX_BLOCK_SIZE: u64 = 2048;

/// Smallest block size class.
pub const DYN_ALLOC_MIN_BLOCK_SIZE: u64 = 8;

/// First address of the kernel page allocator: past the block pages and a guard page.
pub const KERNEL_PAGE_ALLOC_START: u64 = KERNEL_HEAP_START + DYN_ALLOC_MAX_SIZE + PAGE_SIZE;

/// Ceiling of the user portion of the address space.
pub const USER_TOP: u64 = 0xEEC0_0000;

/// Top of the user stack. `[USTACKTOP, USER_TOP)` is an unmapped gap.
pub const USTACKTOP: u64 = USER_TOP - 2 * PAGE_SIZE;

/// Maximum size of the user stack.
pub const USER_STACK_SIZE: u64 = 8 << 20;

/// Lowest address the user stack may grow down to.
pub const USTACKBOTTOM: u64 = USTACKTOP - USER_STACK_SIZE;

/// First address of the user heap.
pub const USER_HEAP_START: u64 = 0x8000_0000;

/// Upper bound (exclusive) of the user heap.
pub const USER_HEAP_MAX: u64 = 0xA000_0000;

/// First address of the user page allocator: past the block pages and a guard page.
pub const USER_PAGE_ALLOC_START: u64 = USER_HEAP_START + DYN_ALLOC_MAX_SIZE + PAGE_SIZE;

/// Capacity of the user heap's chunk record pool.
pub const MAX_USER_CHUNKS: usize = 4000;

/// Pages per kernel stack, including the guard page at its bottom.
pub const KERNEL_STACK_PAGES: u64 = 8;

/// The size of a kernel stack.
pub const KERNEL_STACK_SIZE: u64 = KERNEL_STACK_PAGES * PAGE_SIZE;

const _: () = {
    assert!(DYN_ALLOC_MAX_BLOCK_SIZE.is_power_of_two());
    assert!(DYN_ALLOC_MIN_BLOCK_SIZE.is_power_of_two());
    assert!(DYN_ALLOC_MAX_BLOCK_SIZE < PAGE_SIZE);
    assert!(DYN_ALLOC_MAX_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_START >= KERNEL_BASE);
    assert!(KERNEL_PAGE_ALLOC_START < KERNEL_HEAP_MAX);
    assert!(USER_PAGE_ALLOC_START < USER_HEAP_MAX);
    assert!(USER_HEAP_MAX <= USTACKBOTTOM);
    assert!(USTACKTOP < USER_TOP);
    assert!(USER_TOP < KERNEL_BASE);
};
