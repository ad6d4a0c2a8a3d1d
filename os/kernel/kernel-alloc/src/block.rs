//! # Dynamic Block Allocator
//!
//! Serves requests of up to [`DYN_ALLOC_MAX_BLOCK_SIZE`] bytes from pages
//! carved into equal blocks.
//!
//! ```text
//!  page (class 512)                    free_blocks[6] (stack)
//! ┌──────┬──────┬──────┬──────┬─ ─ ┐  ┌──────────────┐
//! │ used │ free │ used │ free │    │  │ page + 0x600 │ ◄─ pop / push
//! └──────┴──────┴──────┴──────┴─ ─ ┘  │ page + 0x200 │
//!                                     └──────────────┘
//! ```
//!
//! # Invariants
//! - A page is either unused or carved into blocks of exactly one class.
//! - `free_block_count` of a page equals the number of its blocks on the
//!   class's free stack.
//! - A page whose blocks are all free is returned immediately, so there is
//!   never a fully free carved page.

use crate::{AllocError, PageProvider};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use kernel_info::memory::{DYN_ALLOC_MAX_BLOCK_SIZE, DYN_ALLOC_MIN_BLOCK_SIZE};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, round_down_to_page};

/// Number of size classes: 8, 16, 32, ..., 2048.
pub const SIZE_CLASS_COUNT: usize = 9;

const _: () = assert!(DYN_ALLOC_MIN_BLOCK_SIZE << (SIZE_CLASS_COUNT - 1) == DYN_ALLOC_MAX_BLOCK_SIZE);

/// Size class serving a request of `size` bytes.
#[must_use]
pub const fn size_class(size: u64) -> Option<usize> {
    if size == 0 || size > DYN_ALLOC_MAX_BLOCK_SIZE {
        return None;
    }
    let rounded = if size < DYN_ALLOC_MIN_BLOCK_SIZE {
        DYN_ALLOC_MIN_BLOCK_SIZE
    } else {
        size.next_power_of_two()
    };
    Some((rounded.trailing_zeros() - DYN_ALLOC_MIN_BLOCK_SIZE.trailing_zeros()) as usize)
}

/// Block size of `class`.
#[must_use]
pub const fn class_size(class: usize) -> u64 {
    DYN_ALLOC_MIN_BLOCK_SIZE << class
}

/// Per-page bookkeeping.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PageInfo {
    /// Block size the page is carved into; 0 while the page is unused.
    pub block_size: u64,
    pub free_block_count: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockAllocator {
    start: VirtualAddress,
    end: VirtualAddress,
    pages: Vec<PageInfo>,
    free_blocks: [Vec<VirtualAddress>; SIZE_CLASS_COUNT],
    unused_pages: VecDeque<usize>,
}

impl BlockAllocator {
    /// An allocator managing the pages of `[start, end)`.
    #[must_use]
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        let mut allocator = Self {
            start,
            end: start,
            pages: Vec::new(),
            free_blocks: [const { Vec::new() }; SIZE_CLASS_COUNT],
            unused_pages: VecDeque::new(),
        };
        allocator.initialize(start, end);
        allocator
    }

    /// Reset the allocator to manage `[start, end)` with every page unused.
    ///
    /// Pages already backed are not returned; only call this on a fresh range.
    pub fn initialize(&mut self, start: VirtualAddress, end: VirtualAddress) {
        let start = start.page_base();
        let end = VirtualAddress::new(round_down_to_page(end.as_u64()).max(start.as_u64()));
        #[allow(clippy::cast_possible_truncation)]
        let count = (end.distance_from(start) / PAGE_SIZE) as usize;

        self.start = start;
        self.end = end;
        self.pages.clear();
        self.pages.resize(count, PageInfo::default());
        self.free_blocks.iter_mut().for_each(Vec::clear);
        self.unused_pages = (0..count).collect();
        log::debug!("block allocator over [{start}, {end}): {count} pages");
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va.is_within(self.start.as_u64(), self.end.as_u64())
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Returns `None` for a size of zero, a size above the largest class, or
    /// when neither a free block nor a backable page is left.
    pub fn alloc<P>(&mut self, pages: &mut P, size: u64) -> Option<VirtualAddress>
    where
        P: PageProvider + ?Sized,
    {
        let class = size_class(size)?;
        if let Some(block) = self.pop_block(class) {
            return Some(block);
        }
        if self.carve_page(pages, class) {
            return self.pop_block(class);
        }

        // degraded: waste space in a larger class rather than fail
        let larger = (class + 1..SIZE_CLASS_COUNT).find(|c| !self.free_blocks[*c].is_empty());
        match larger {
            Some(larger) => {
                log::debug!(
                    "no page for a {}-byte block, using a {}-byte block",
                    class_size(class),
                    class_size(larger)
                );
                self.pop_block(larger)
            }
            None => {
                log::warn!("block allocator exhausted serving {size} bytes");
                None
            }
        }
    }

    /// Return a block to its class. A page whose blocks are now all free goes
    /// back to `pages`.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] outside the managed range,
    /// [`AllocError::NotAllocated`] for addresses that are not an allocated block.
    pub fn free<P>(&mut self, pages: &mut P, va: VirtualAddress) -> Result<(), AllocError>
    where
        P: PageProvider + ?Sized,
    {
        let index = self.page_index(va).ok_or(AllocError::InvalidAddress(va))?;
        let info = self.pages[index];
        let block_size = info.block_size;
        if block_size == 0 || va.page_offset() % block_size != 0 {
            return Err(AllocError::NotAllocated(va));
        }
        let capacity = PAGE_SIZE / block_size;
        if info.free_block_count >= capacity {
            return Err(AllocError::NotAllocated(va));
        }
        let class = size_class(block_size).ok_or(AllocError::NotAllocated(va))?;
        if self.free_blocks[class].contains(&va) {
            log::warn!("double free of block {va}");
            return Err(AllocError::NotAllocated(va));
        }

        self.free_blocks[class].push(va);
        self.pages[index].free_block_count += 1;
        if self.pages[index].free_block_count < capacity {
            return Ok(());
        }

        let page = va.page_base();
        self.free_blocks[class].retain(|block| block.page_base() != page);
        self.pages[index] = PageInfo::default();
        self.unused_pages.push_front(index);
        pages.return_page(page);
        log::trace!("returned page {page} of class {block_size}");
        Ok(())
    }

    /// Resize the block at `va` to hold `size` bytes.
    ///
    /// A null `va` allocates, a zero `size` frees. A block whose class still
    /// serves `size` is kept in place; otherwise a new block is allocated,
    /// `copy(pages, from, to, len)` moves the contents and the old block is
    /// freed. On `Ok(None)` with a non-zero `size` the old block is left
    /// untouched.
    ///
    /// # Errors
    /// Same as [`free`](Self::free) for an invalid `va`, or the error of
    /// `copy`, in which case the new block is freed again.
    pub fn realloc<P, C>(
        &mut self,
        pages: &mut P,
        va: VirtualAddress,
        size: u64,
        copy: C,
    ) -> Result<Option<VirtualAddress>, AllocError>
    where
        P: PageProvider + ?Sized,
        C: FnOnce(&mut P, VirtualAddress, VirtualAddress, u64) -> Result<(), AllocError>,
    {
        if va.is_null() {
            return Ok(self.alloc(pages, size));
        }
        let current = self.block_size_of(va).ok_or(AllocError::NotAllocated(va))?;
        if size == 0 {
            self.free(pages, va)?;
            return Ok(None);
        }
        if size_class(size) == size_class(current) {
            return Ok(Some(va));
        }
        let Some(moved) = self.alloc(pages, size) else {
            return Ok(None);
        };
        if let Err(e) = copy(pages, va, moved, current.min(size)) {
            self.free(pages, moved)?;
            return Err(e);
        }
        self.free(pages, va)?;
        Ok(Some(moved))
    }

    /// Block size of the page holding `va`, if it is carved.
    #[must_use]
    pub fn block_size_of(&self, va: VirtualAddress) -> Option<u64> {
        self.page_index(va)
            .map(|i| self.pages[i].block_size)
            .filter(|size| *size != 0)
    }

    #[must_use]
    pub fn page_info(&self, va: VirtualAddress) -> Option<PageInfo> {
        self.page_index(va).map(|i| self.pages[i])
    }

    /// Free blocks of `class`, in stack order (last is popped next).
    #[must_use]
    pub fn free_blocks(&self, class: usize) -> &[VirtualAddress] {
        self.free_blocks.get(class).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn unused_page_count(&self) -> usize {
        self.unused_pages.len()
    }

    fn page_index(&self, va: VirtualAddress) -> Option<usize> {
        if !self.contains(va) {
            return None;
        }
        usize::try_from(va.distance_from(self.start) / PAGE_SIZE).ok()
    }

    fn page_va(&self, index: usize) -> VirtualAddress {
        self.start + index as u64 * PAGE_SIZE
    }

    fn pop_block(&mut self, class: usize) -> Option<VirtualAddress> {
        let block = self.free_blocks[class].pop()?;
        if let Some(index) = self.page_index(block) {
            self.pages[index].free_block_count -= 1;
        }
        Some(block)
    }

    /// Carve an unused page into blocks of `class`; false if none could be backed.
    fn carve_page<P>(&mut self, pages: &mut P, class: usize) -> bool
    where
        P: PageProvider + ?Sized,
    {
        let Some(index) = self.unused_pages.pop_front() else {
            return false;
        };
        let page = self.page_va(index);
        if let Err(e) = pages.get_page(page) {
            log::warn!("cannot back block page {page}: {e}");
            self.unused_pages.push_front(index);
            return false;
        }

        let block_size = class_size(class);
        let count = PAGE_SIZE / block_size;
        self.pages[index] = PageInfo {
            block_size,
            free_block_count: count,
        };
        self.free_blocks[class].extend((0..count).map(|i| page + i * block_size));
        log::trace!("carved page {page} into {count} blocks of {block_size}");
        true
    }
}
