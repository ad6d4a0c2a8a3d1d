//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the paging,
//! heap and page-replacement code.
//!
//! ## Overview
//!
//! The kernel manages memory in fixed [`PAGE_SIZE`] pages. Every subsystem
//! above this crate moves addresses around: the heap hands out virtual
//! addresses, the frame table hands out physical ones, the fault handler
//! receives a faulting virtual address from the trap frame. Mixing the two
//! kinds is the classic bug, so they are kept apart at the type level:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address translated by the page tables. |
//! | [`PhysicalAddress`] | An address of a physical frame or MMIO region. |
//!
//! Both are zero-cost `#[repr(transparent)]` wrappers around `u64`.
//!
//! ## Page Arithmetic
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x8000_1234);
//! assert_eq!(va.page_base(), VirtualAddress::new(0x8000_1000));
//! assert_eq!(va.page_offset(), 0x234);
//! assert_eq!(round_up_to_page(4097), Some(8192));
//! assert_eq!(pages_for(1), Some(1));
//! assert_eq!(round_up_to_page(u64::MAX), None);
//! ```
//!
//! ## Two-Level Paging
//!
//! The fault handler distinguishes a missing page *table* from a missing
//! page. [`VirtualAddress::directory_index`] selects the page-directory
//! entry covering an address, [`VirtualAddress::table_index`] the entry
//! inside that table:
//!
//! ```text
//!  31            22 21            12 11             0
//! ┌────────────────┬────────────────┬────────────────┐
//! │ directory idx  │   table idx    │  page offset   │
//! └────────────────┴────────────────┴────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// Number of address bits covered by one page-directory entry.
pub const DIRECTORY_SHIFT: u32 = 22;

/// Bytes of address space mapped by one page table.
pub const TABLE_SPAN: u64 = 1 << DIRECTORY_SHIFT;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(TABLE_SPAN.is_multiple_of(PAGE_SIZE));
};

/// Round `value` up to the next multiple of [`PAGE_SIZE`].
///
/// Returns `None` when the rounded value does not fit in a `u64`.
#[inline]
#[must_use]
pub const fn round_up_to_page(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn round_down_to_page(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Number of pages needed to hold `bytes`; zero bytes still take one page.
///
/// `None` when `bytes` is too close to `u64::MAX` to round up.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> Option<u64> {
    match round_up_to_page(bytes) {
        Some(0) => Some(1),
        Some(rounded) => Some(rounded / PAGE_SIZE),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up_to_page(0), Some(0));
        assert_eq!(round_up_to_page(1), Some(PAGE_SIZE));
        assert_eq!(round_up_to_page(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(round_down_to_page(PAGE_SIZE + 1), PAGE_SIZE);
        assert_eq!(round_down_to_page(PAGE_SIZE - 1), 0);
    }

    #[test]
    fn pages_for_has_a_floor_of_one() {
        assert_eq!(pages_for(0), Some(1));
        assert_eq!(pages_for(1), Some(1));
        assert_eq!(pages_for(PAGE_SIZE), Some(1));
        assert_eq!(pages_for(PAGE_SIZE + 1), Some(2));
        assert_eq!(pages_for(3 * PAGE_SIZE), Some(3));
    }

    #[test]
    fn rounding_near_the_top_does_not_wrap() {
        assert_eq!(round_up_to_page(u64::MAX - PAGE_SIZE + 1), Some(u64::MAX - PAGE_SIZE + 1));
        assert_eq!(round_up_to_page(u64::MAX - PAGE_SIZE + 2), None);
        assert_eq!(round_up_to_page(u64::MAX - 100), None);
        assert_eq!(pages_for(u64::MAX), None);
    }

    #[test]
    fn address_split() {
        let va = VirtualAddress::new(0xF600_3ABC);
        assert_eq!(va.page_base().as_u64(), 0xF600_3000);
        assert_eq!(va.page_offset(), 0xABC);
        assert_eq!(va.directory_index(), 0xF600_3ABC >> 22);
        assert_eq!(va.table_index(), (0xF600_3ABC >> 12) & 0x3FF);
        assert!(!va.is_page_aligned());
        assert!(va.page_base().is_page_aligned());
    }

    #[test]
    fn add_and_distance() {
        let a = VirtualAddress::new(0x1000);
        let b = a + 3 * PAGE_SIZE;
        assert_eq!(b.as_u64(), 0x4000);
        assert_eq!(b.distance_from(a), 3 * PAGE_SIZE);
        assert_eq!(a.checked_sub(b), None);

        let pa = PhysicalAddress::new(0x20_0042);
        assert_eq!(pa.frame_number(), 0x200);
        assert_eq!(pa.page_offset(), 0x42);
        assert_eq!(PhysicalAddress::from_frame_number(0x200) + 0x42, pa);
    }

    #[test]
    fn formatting() {
        extern crate std;
        use std::format;
        assert_eq!(format!("{:?}", VirtualAddress::new(0x1000)), "VA(0x0000000000001000)");
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x0000000000001000)");
        assert_eq!(format!("{}", VirtualAddress::new(0xABC)), "0x0000000000000ABC");
    }
}
