//! # Kernel Heap
//!
//! ```text
//! KERNEL_HEAP_START          +DYN_ALLOC_MAX_SIZE   +PAGE_SIZE             KERNEL_HEAP_MAX
//!        │   block allocator         │   guard   │   chunk allocator          │
//!        ▼                           ▼           ▼                            ▼
//!        ┌───────────────────────────┬───────────┬─────────────────── ─ ─ ─ ─┐
//!        │ pages carved into blocks  │  unmapped │ chunks ──► brk             │
//!        └───────────────────────────┴───────────┴─────────────────── ─ ─ ─ ─┘
//! ```
//!
//! Pages of both tiers are backed by frames mapped writable, kernel only, in
//! the kernel address space. Frames record their mapping so the heap can
//! answer physical-to-virtual lookups without a search.

use crate::{AllocError, BlockAllocator, ChunkAllocator, PageProvider};
use alloc::vec;
use kernel_info::memory::{
    DYN_ALLOC_MAX_BLOCK_SIZE, DYN_ALLOC_MAX_SIZE, KERNEL_BASE, KERNEL_HEAP_MAX, KERNEL_HEAP_START,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, round_up_to_page};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, FrameAllocator, PagePermissions, allocate_and_map, unmap_frame};

#[allow(clippy::cast_possible_truncation)]
const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// The kernel address space and the frames behind it.
#[derive(Debug)]
pub struct KernelMemory<A, F> {
    pub space: A,
    pub frames: F,
}

impl<A: AddressSpace, F: FrameAllocator> PageProvider for KernelMemory<A, F> {
    fn get_page(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        allocate_and_map(&mut self.space, &mut self.frames, va, PagePermissions::WRITABLE)
            .map(|_| ())
            .map_err(|e| {
                log::warn!("kernel heap page {va}: {e}");
                AllocError::OutOfMemory
            })
    }

    fn return_page(&mut self, va: VirtualAddress) {
        if unmap_frame(&mut self.space, &mut self.frames, va).is_none() {
            log::warn!("returned kernel heap page {va} was not mapped");
        }
    }
}

impl<A: AddressSpace, F: FrameAllocator> KernelMemory<A, F> {
    /// Copy bytes out of mapped kernel memory.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] at the first unmapped page.
    pub fn read(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), AllocError> {
        let mut done = 0;
        while done < buf.len() {
            let at = va + done as u64;
            let bytes = self.page_bytes(at).ok_or(AllocError::InvalidAddress(at))?;
            let n = bytes.len().min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&bytes[..n]);
            done += n;
        }
        Ok(())
    }

    /// Copy bytes into mapped kernel memory.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] at the first unmapped page.
    pub fn write(&mut self, va: VirtualAddress, data: &[u8]) -> Result<(), AllocError> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done as u64;
            let frame = self.space.translate(at).ok_or(AllocError::InvalidAddress(at))?;
            let bytes = self
                .frames
                .frame_bytes_mut(frame.page_base())
                .ok_or(AllocError::InvalidAddress(at))?;
            let offset = usize::try_from(frame.page_offset()).map_err(|_| AllocError::InvalidAddress(at))?;
            let n = (bytes.len() - offset).min(data.len() - done);
            bytes[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Move `len` bytes from `from` to `to`, which must not overlap.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if either range is not fully mapped.
    pub fn copy(&mut self, from: VirtualAddress, to: VirtualAddress, len: u64) -> Result<(), AllocError> {
        let mut buf = vec![0; PAGE_BYTES];
        let mut done = 0;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let n = (len - done).min(PAGE_SIZE) as usize;
            self.read(from + done, &mut buf[..n])?;
            self.write(to + done, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// The rest of the page holding `va`, as mapped.
    fn page_bytes(&self, va: VirtualAddress) -> Option<&[u8]> {
        let frame = self.space.translate(va)?;
        let bytes = self.frames.frame_bytes(frame.page_base())?;
        bytes.get(usize::try_from(frame.page_offset()).ok()?..)
    }
}

/// Kernel heap over the block and chunk tiers.
#[derive(Debug)]
pub struct KernelHeap<A, F> {
    memory: KernelMemory<A, F>,
    blocks: BlockAllocator,
    chunks: ChunkAllocator,
}

impl<A: AddressSpace, F: FrameAllocator> KernelHeap<A, F> {
    /// A heap over the standard kernel heap range.
    #[must_use]
    pub fn new(space: A, frames: F) -> Self {
        Self::with_layout(
            space,
            frames,
            VirtualAddress::new(KERNEL_HEAP_START),
            DYN_ALLOC_MAX_SIZE,
            VirtualAddress::new(KERNEL_HEAP_MAX),
        )
    }

    /// A heap whose block tier spans `block_area` bytes from `start` and
    /// whose chunk tier starts one guard page later and ends at `limit`.
    #[must_use]
    pub fn with_layout(
        space: A,
        frames: F,
        start: VirtualAddress,
        block_area: u64,
        limit: VirtualAddress,
    ) -> Self {
        let block_end = round_up_to_page(block_area)
            .and_then(|area| start.checked_add(area))
            .map_or(limit, |end| end.min(limit));
        let chunk_start = block_end + PAGE_SIZE;
        #[allow(clippy::cast_possible_truncation)]
        let max_chunks = (limit.distance_from(chunk_start) / PAGE_SIZE) as usize;
        log::info!("kernel heap: blocks [{start}, {block_end}), chunks [{chunk_start}, {limit})");
        Self {
            memory: KernelMemory { space, frames },
            blocks: BlockAllocator::new(start, block_end),
            chunks: ChunkAllocator::new(chunk_start, limit, max_chunks),
        }
    }

    #[must_use]
    pub const fn memory(&self) -> &KernelMemory<A, F> {
        &self.memory
    }

    pub const fn memory_mut(&mut self) -> &mut KernelMemory<A, F> {
        &mut self.memory
    }

    #[must_use]
    pub const fn blocks(&self) -> &BlockAllocator {
        &self.blocks
    }

    #[must_use]
    pub const fn chunks(&self) -> &ChunkAllocator {
        &self.chunks
    }

    /// Allocate `size` bytes of mapped kernel memory.
    ///
    /// # Errors
    /// [`AllocError::ZeroSize`], or [`AllocError::OutOfMemory`] /
    /// [`AllocError::PoolExhausted`] when neither tier can serve the request.
    pub fn kmalloc(&mut self, size: u64) -> Result<VirtualAddress, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if size <= DYN_ALLOC_MAX_BLOCK_SIZE {
            return self
                .blocks
                .alloc(&mut self.memory, size)
                .ok_or(AllocError::OutOfMemory);
        }

        let chunk = self.chunks.reserve(size)?;
        for (i, page) in chunk.page_addresses().enumerate() {
            if let Err(e) = self.memory.get_page(page) {
                chunk
                    .page_addresses()
                    .take(i)
                    .for_each(|p| self.memory.return_page(p));
                self.chunks.release(chunk.start)?;
                return Err(e);
            }
        }
        log::trace!("kmalloc({size}) = {}", chunk.start);
        Ok(chunk.start)
    }

    /// Free an allocation made by [`kmalloc`](Self::kmalloc).
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] outside the heap, or
    /// [`AllocError::NotAllocated`] if `va` is not the start of an allocation.
    pub fn kfree(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        if self.blocks.contains(va) {
            return self.blocks.free(&mut self.memory, va);
        }
        if !self.chunks.contains(va) {
            return Err(AllocError::InvalidAddress(va));
        }
        let chunk = self.chunks.chunk_at(va).ok_or(AllocError::NotAllocated(va))?;
        chunk
            .page_addresses()
            .for_each(|p| self.memory.return_page(p));
        self.chunks.release(va)?;
        Ok(())
    }

    /// Resize an allocation, moving it if needed.
    ///
    /// `None` allocates; a zero `size` frees and yields `Ok(None)`. When a
    /// move is needed and no memory is available the call fails and the old
    /// allocation is untouched.
    ///
    /// # Errors
    /// As for [`kmalloc`](Self::kmalloc) and [`kfree`](Self::kfree).
    pub fn krealloc(
        &mut self,
        va: Option<VirtualAddress>,
        size: u64,
    ) -> Result<Option<VirtualAddress>, AllocError> {
        let Some(va) = va else {
            return self.kmalloc(size).map(Some);
        };
        if size == 0 {
            self.kfree(va)?;
            return Ok(None);
        }
        let current = self.allocation_size(va).ok_or(AllocError::NotAllocated(va))?;

        if self.blocks.contains(va) && size <= DYN_ALLOC_MAX_BLOCK_SIZE {
            return self
                .blocks
                .realloc(&mut self.memory, va, size, KernelMemory::copy)?
                .ok_or(AllocError::OutOfMemory)
                .map(Some);
        }
        if self.chunks.contains(va) && round_up_to_page(size) == Some(current) {
            return Ok(Some(va));
        }

        let moved = self.kmalloc(size)?;
        if let Err(e) = self.memory.copy(va, moved, current.min(size)) {
            self.kfree(moved)?;
            return Err(e);
        }
        self.kfree(va)?;
        Ok(Some(moved))
    }

    /// Usable size of the allocation at `va`.
    #[must_use]
    pub fn allocation_size(&self, va: VirtualAddress) -> Option<u64> {
        if self.blocks.contains(va) {
            self.blocks.block_size_of(va)
        } else {
            self.chunks.size_of(va)
        }
    }

    /// Physical address behind `va`.
    ///
    /// Kernel addresses no page table covers fall back to the direct map at
    /// [`KERNEL_BASE`]. A page whose table exists but which is not present has
    /// no physical address.
    #[must_use]
    pub fn physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if let Some(pa) = self.memory.space.translate(va) {
            return Some(pa);
        }
        if self.memory.space.table_present(va) {
            return None;
        }
        (va.as_u64() >= KERNEL_BASE).then(|| PhysicalAddress::new(va.as_u64() - KERNEL_BASE))
    }

    /// Virtual address `pa` is mapped at, through the frame's reverse mapping.
    #[must_use]
    pub fn virtual_address(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let page = self.memory.frames.frame_info(pa.page_base())?.virtual_address()?;
        Some(page + pa.page_offset())
    }
}

/// A [`KernelHeap`] behind a spin lock, installed once during boot.
pub struct LockedKernelHeap<A, F> {
    heap: SpinLock<Option<KernelHeap<A, F>>>,
}

impl<A, F> LockedKernelHeap<A, F> {
    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            heap: SpinLock::named("kernel heap", None),
        }
    }
}

impl<A: AddressSpace, F: FrameAllocator> LockedKernelHeap<A, F> {
    /// Install `heap`, returning any heap installed before.
    pub fn install(&self, heap: KernelHeap<A, F>) -> Option<KernelHeap<A, F>> {
        let previous = self.heap.lock().replace(heap);
        if previous.is_some() {
            log::warn!("kernel heap replaced");
        }
        previous
    }

    pub fn is_installed(&self) -> bool {
        self.heap.lock().is_some()
    }

    /// Run `f` on the installed heap.
    ///
    /// # Errors
    /// [`AllocError::Uninitialized`] before [`install`](Self::install).
    pub fn with_heap<R>(
        &self,
        f: impl FnOnce(&mut KernelHeap<A, F>) -> Result<R, AllocError>,
    ) -> Result<R, AllocError> {
        self.heap
            .with_lock(|heap| heap.as_mut().ok_or(AllocError::Uninitialized).and_then(f))
    }

    /// # Errors
    /// See [`KernelHeap::kmalloc`].
    pub fn kmalloc(&self, size: u64) -> Result<VirtualAddress, AllocError> {
        self.with_heap(|heap| heap.kmalloc(size))
    }

    /// # Errors
    /// See [`KernelHeap::kfree`].
    pub fn kfree(&self, va: VirtualAddress) -> Result<(), AllocError> {
        self.with_heap(|heap| heap.kfree(va))
    }

    /// # Errors
    /// See [`KernelHeap::krealloc`].
    pub fn krealloc(
        &self,
        va: Option<VirtualAddress>,
        size: u64,
    ) -> Result<Option<VirtualAddress>, AllocError> {
        self.with_heap(|heap| heap.krealloc(va, size))
    }
}

impl<A, F> Default for LockedKernelHeap<A, F> {
    fn default() -> Self {
        Self::uninit()
    }
}
