//! Kernel side of lazily backed user heap memory.
//!
//! Reserving a range only marks its entries with the heap marker. Frames
//! arrive later through the fault handler, and freeing the range drops
//! whatever is resident or paged out.

use crate::{Environment, PageFile};
use kernel_info::memory::{USER_HEAP_MAX, USER_HEAP_START};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, pages_for};
use kernel_vmem::{AddressSpace, FrameAllocator, PagePermissions, VmemError, unmap_frame};

/// Whether `va` lies in the user heap range.
#[must_use]
pub const fn is_user_heap_page(va: VirtualAddress) -> bool {
    va.is_within(USER_HEAP_START, USER_HEAP_MAX)
}

fn pages(va: VirtualAddress, size: u64) -> impl Iterator<Item = VirtualAddress> {
    let base = va.page_base();
    let count = pages_for(size.saturating_add(va.page_offset())).unwrap_or(u64::MAX / PAGE_SIZE);
    (0..count).map_while(move |page| base.checked_add(page * PAGE_SIZE))
}

/// Mark every page of `[va, va + size)` as reserved heap memory, creating
/// page tables where needed.
///
/// # Errors
/// [`VmemError::OutOfMemory`] if a page table cannot be created. Pages marked
/// before the failure stay marked.
pub fn allocate_user_mem<A: AddressSpace>(
    env: &mut Environment<A>,
    va: VirtualAddress,
    size: u64,
) -> Result<(), VmemError> {
    for page in pages(va, size) {
        if !env.space.table_present(page) {
            env.space.create_table(page)?;
        }
        env.space
            .set_permissions(page, PagePermissions::HEAP_PAGE, PagePermissions::NONE)?;
    }
    log::trace!("{:?}: reserved {size} bytes at {va}", env.id);
    Ok(())
}

/// Release every page of `[va, va + size)`: clear the heap marker, forget the
/// page-file copy, unmap a resident frame and drop it from the working set.
pub fn free_user_mem<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    va: VirtualAddress,
    size: u64,
) where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    for page in pages(va, size) {
        if !env.space.table_present(page) {
            continue;
        }
        if let Err(e) =
            env.space
                .set_permissions(page, PagePermissions::NONE, PagePermissions::HEAP_PAGE)
        {
            log::warn!("{:?}: cannot unmark {page}: {e}", env.id);
        }
        page_file.remove_page(env.id, page);
        if env.space.frame(page).is_some() {
            unmap_frame(&mut env.space, frames, page);
        }
        if let Some(index) = env.working_set.position(page) {
            env.working_set.remove(index);
        }
    }
    env.space.flush_tlb();
    log::trace!("{:?}: released {size} bytes at {va}", env.id);
}
