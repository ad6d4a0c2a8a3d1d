use crate::{PagePermissions, VmemError};
use alloc::collections::{BTreeMap, BTreeSet};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// One page directory and the page tables below it.
///
/// All addresses are rounded down to their page by the implementation.
pub trait AddressSpace {
    /// Whether the page-directory entry covering `va` points at a table.
    fn table_present(&self, va: VirtualAddress) -> bool;

    /// Allocate the page table covering `va`.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if no memory is left for the table.
    fn create_table(&mut self, va: VirtualAddress) -> Result<(), VmemError>;

    /// Permission bits of the entry for `va`; empty when there is none.
    fn permissions(&self, va: VirtualAddress) -> PagePermissions;

    /// Set then clear permission bits of the entry for `va`.
    ///
    /// The entry need not map a frame, which is how the heap marker is placed
    /// on reserved pages.
    ///
    /// # Errors
    /// [`VmemError::TableMissing`] if no table covers `va`.
    fn set_permissions(
        &mut self,
        va: VirtualAddress,
        set: PagePermissions,
        clear: PagePermissions,
    ) -> Result<(), VmemError>;

    /// Frame recorded in the entry for `va`.
    ///
    /// A page whose present bit was cleared without unmapping it still
    /// reports its frame.
    fn frame(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Write an entry mapping `frame` at `va`, creating the table if needed.
    ///
    /// Bits outside [`PagePermissions::MAPPING_BITS`] already on the entry are
    /// kept. Use [`map_frame`](crate::map_frame) rather than calling this
    /// directly.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if a table was needed and could not be made.
    fn install(
        &mut self,
        va: VirtualAddress,
        frame: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<(), VmemError>;

    /// Remove the frame from the entry for `va`, keeping only marker bits.
    fn clear(&mut self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Drop any cached translation for `va`.
    fn invalidate(&mut self, va: VirtualAddress);

    /// Drop all cached translations.
    fn flush_tlb(&mut self);

    /// Physical address `va` currently translates to.
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.permissions(va).present() {
            return None;
        }
        self.frame(va).map(|frame| frame + va.page_offset())
    }
}

#[derive(Debug, Copy, Clone)]
struct SoftEntry {
    frame: Option<PhysicalAddress>,
    permissions: PagePermissions,
}

/// An address space held in ordinary maps.
///
/// Hardware behaviour the replacement policies depend on is reproduced by
/// [`touch`](Self::touch): an access sets `used`, a write also sets
/// `modified`.
#[derive(Debug, Default)]
pub struct SoftAddressSpace {
    tables: BTreeSet<u64>,
    entries: BTreeMap<u64, SoftEntry>,
    tlb_flushes: u64,
}

impl SoftAddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Perform an access like the MMU would.
    ///
    /// Returns `false` where the hardware would raise a page fault: missing
    /// table, non-present page, or a write to a read-only page.
    pub fn touch(&mut self, va: VirtualAddress, write: bool) -> bool {
        if !self.table_present(va) {
            return false;
        }
        let Some(entry) = self.entries.get_mut(&va.page_number()) else {
            return false;
        };
        let p = entry.permissions;
        if !p.present() || (write && !p.writable()) {
            return false;
        }
        entry.permissions = p.with_used(true).with_modified(p.modified() || write);
        true
    }

    /// Number of full TLB flushes requested so far.
    #[must_use]
    pub const fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes
    }

    /// Pages with a present mapping, in address order.
    pub fn mapped_pages(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        self.entries
            .iter()
            .filter(|(_, e)| e.permissions.present())
            .map(|(page, _)| VirtualAddress::new(page << kernel_memory_addresses::PAGE_SHIFT))
    }
}

impl AddressSpace for SoftAddressSpace {
    fn table_present(&self, va: VirtualAddress) -> bool {
        self.tables.contains(&va.directory_index())
    }

    fn create_table(&mut self, va: VirtualAddress) -> Result<(), VmemError> {
        self.tables.insert(va.directory_index());
        Ok(())
    }

    fn permissions(&self, va: VirtualAddress) -> PagePermissions {
        self.entries
            .get(&va.page_number())
            .map_or(PagePermissions::NONE, |e| e.permissions)
    }

    fn set_permissions(
        &mut self,
        va: VirtualAddress,
        set: PagePermissions,
        clear: PagePermissions,
    ) -> Result<(), VmemError> {
        if !self.table_present(va) {
            return Err(VmemError::TableMissing);
        }
        let entry = self.entries.entry(va.page_number()).or_insert(SoftEntry {
            frame: None,
            permissions: PagePermissions::NONE,
        });
        entry.permissions = entry.permissions.union(set).without(clear);
        if entry.frame.is_none() && entry.permissions.is_empty() {
            self.entries.remove(&va.page_number());
        }
        Ok(())
    }

    fn frame(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entries.get(&va.page_number()).and_then(|e| e.frame)
    }

    fn install(
        &mut self,
        va: VirtualAddress,
        frame: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<(), VmemError> {
        self.create_table(va)?;
        let markers = self
            .permissions(va)
            .without(PagePermissions::MAPPING_BITS);
        self.entries.insert(
            va.page_number(),
            SoftEntry {
                frame: Some(frame.page_base()),
                permissions: markers.union(permissions),
            },
        );
        Ok(())
    }

    fn clear(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = va.page_number();
        let entry = self.entries.get_mut(&page)?;
        let frame = entry.frame.take();
        entry.permissions = entry.permissions.without(PagePermissions::MAPPING_BITS);
        if entry.permissions.is_empty() {
            self.entries.remove(&page);
        }
        frame
    }

    fn invalidate(&mut self, _va: VirtualAddress) {}

    fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
    }
}
