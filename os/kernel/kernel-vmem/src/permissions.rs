use bitfield_struct::bitfield;
use core::ops::{BitOr, BitOrAssign};

/// Permission and status bits of a page-table entry.
///
/// Mirrors the low 12 bits of an x86 PTE. The frame number is tracked
/// separately by the [`AddressSpace`](crate::AddressSpace), so the upper bits
/// are unused here.
///
/// | Bit | Name            | Set by   |
/// |-----|-----------------|----------|
/// | 0   | `present`       | kernel   |
/// | 1   | `writable`      | kernel   |
/// | 2   | `user`          | kernel   |
/// | 3   | `write_through` | kernel   |
/// | 4   | `cache_disabled`| kernel   |
/// | 5   | `used`          | hardware |
/// | 6   | `modified`      | hardware |
/// | 7   | `pat`           | kernel   |
/// | 8   | `global`        | kernel   |
/// | 9   | `heap_page`     | kernel   |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PagePermissions;
/// let p = PagePermissions::USER | PagePermissions::WRITABLE;
/// assert!(p.user() && p.writable() && !p.present());
/// assert!(p.contains(PagePermissions::USER));
/// assert_eq!(p.without(PagePermissions::WRITABLE), PagePermissions::USER);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PagePermissions {
    /// The entry maps a frame.
    pub present: bool,
    /// Writes are allowed.
    pub writable: bool,
    /// User mode may access the page.
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    /// Accessed since the bit was last cleared.
    pub used: bool,
    /// Written since the bit was last cleared.
    pub modified: bool,
    /// Page attribute table index.
    pub pat: bool,
    pub global: bool,

    /// OS-available bit marking a page reserved by the user heap.
    ///
    /// Survives unmapping so an evicted heap page remains recognisable.
    pub heap_page: bool,

    #[bits(22)]
    __: u32,
}

impl PagePermissions {
    pub const NONE: Self = Self::new();
    pub const PRESENT: Self = Self::new().with_present(true);
    pub const WRITABLE: Self = Self::new().with_writable(true);
    pub const USER: Self = Self::new().with_user(true);
    pub const USED: Self = Self::new().with_used(true);
    pub const MODIFIED: Self = Self::new().with_modified(true);
    pub const HEAP_PAGE: Self = Self::new().with_heap_page(true);

    /// Bits that describe the current mapping and are dropped on unmap.
    pub const MAPPING_BITS: Self = Self::from_bits(
        Self::PRESENT.into_bits()
            | Self::WRITABLE.into_bits()
            | Self::USER.into_bits()
            | Self::USED.into_bits()
            | Self::MODIFIED.into_bits()
            | Self::new()
                .with_write_through(true)
                .with_cache_disabled(true)
                .with_pat(true)
                .with_global(true)
                .into_bits(),
    );

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() & !other.into_bits())
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }
}

impl BitOr for PagePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for PagePermissions {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}
