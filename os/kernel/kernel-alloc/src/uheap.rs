//! # User Heap
//!
//! The user-space half of the heap. Placement runs in the process, backing
//! is requested from the kernel:
//!
//! | Request                  | Placement            | Kernel call                                   |
//! |--------------------------|----------------------|-----------------------------------------------|
//! | `malloc` ≤ 2 KiB         | block allocator      | [`allocate_page`] per carved page             |
//! | `malloc` > 2 KiB         | chunk allocator      | [`allocate_user_mem`], pages fault in lazily  |
//! | `smalloc` / `sget`       | chunk allocator      | [`create_shared_object`] / [`get_shared_object`] |
//!
//! [`allocate_page`]: UserMemorySyscalls::allocate_page
//! [`allocate_user_mem`]: UserMemorySyscalls::allocate_user_mem
//! [`create_shared_object`]: UserMemorySyscalls::create_shared_object
//! [`get_shared_object`]: UserMemorySyscalls::get_shared_object

use crate::{AllocError, BlockAllocator, ChunkAllocator, PageProvider};
use alloc::vec::Vec;
use kernel_info::memory::{
    DYN_ALLOC_MAX_BLOCK_SIZE, DYN_ALLOC_MAX_SIZE, MAX_USER_CHUNKS, USER_HEAP_MAX, USER_HEAP_START,
};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, round_up_to_page};
use kernel_shm::{OwnerId, ShareError, ShareId};

/// Kernel services behind the user heap.
pub trait UserMemorySyscalls {
    /// Mark `[va, va + size)` as heap pages. Frames are supplied on fault.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if the range cannot be marked.
    fn allocate_user_mem(&mut self, va: VirtualAddress, size: u64) -> Result<(), AllocError>;

    /// Unmark `[va, va + size)` and drop whatever is resident there.
    fn free_user_mem(&mut self, va: VirtualAddress, size: u64);

    /// Map a fresh writable heap page at `va`.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no frame is available.
    fn allocate_page(&mut self, va: VirtualAddress) -> Result<(), AllocError>;

    /// Unmap the page at `va`.
    fn unmap_page(&mut self, va: VirtualAddress);

    /// # Errors
    /// See [`kernel_shm::ShareRegistry::create`].
    fn create_shared_object(
        &mut self,
        name: &str,
        size: u64,
        writable: bool,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError>;

    /// # Errors
    /// See [`kernel_shm::ShareRegistry::get`].
    fn get_shared_object(
        &mut self,
        owner: OwnerId,
        name: &str,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError>;

    /// # Errors
    /// See [`kernel_shm::ShareRegistry::size_of`].
    fn size_of_shared_object(&mut self, owner: OwnerId, name: &str) -> Result<u64, ShareError>;

    /// # Errors
    /// See [`kernel_shm::ShareRegistry::delete`].
    fn delete_shared_object(&mut self, id: ShareId, va: VirtualAddress) -> Result<(), ShareError>;

    /// Copy `len` bytes of the caller's memory from `from` to `to`.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if either range is unusable.
    fn move_user_mem(
        &mut self,
        from: VirtualAddress,
        to: VirtualAddress,
        len: u64,
    ) -> Result<(), AllocError>;
}

/// Block pages come from the kernel one at a time.
struct SyscallPages<'a, S: ?Sized>(&'a mut S);

impl<S: UserMemorySyscalls + ?Sized> PageProvider for SyscallPages<'_, S> {
    fn get_page(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        self.0.allocate_page(va)
    }

    fn return_page(&mut self, va: VirtualAddress) {
        self.0.unmap_page(va);
    }
}

/// A process's heap.
#[derive(Debug)]
pub struct UserHeap<S> {
    syscalls: S,
    blocks: BlockAllocator,
    chunks: ChunkAllocator,
    shared: Vec<(VirtualAddress, ShareId)>,
}

impl<S: UserMemorySyscalls> UserHeap<S> {
    /// A heap over the standard user heap range.
    #[must_use]
    pub fn new(syscalls: S) -> Self {
        let start = VirtualAddress::new(USER_HEAP_START);
        let block_end = start + DYN_ALLOC_MAX_SIZE;
        Self {
            syscalls,
            blocks: BlockAllocator::new(start, block_end),
            chunks: ChunkAllocator::new(
                block_end + PAGE_SIZE,
                VirtualAddress::new(USER_HEAP_MAX),
                MAX_USER_CHUNKS,
            ),
            shared: Vec::new(),
        }
    }

    #[must_use]
    pub const fn syscalls(&self) -> &S {
        &self.syscalls
    }

    pub const fn syscalls_mut(&mut self) -> &mut S {
        &mut self.syscalls
    }

    #[must_use]
    pub const fn chunks(&self) -> &ChunkAllocator {
        &self.chunks
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    /// [`AllocError::ZeroSize`], [`AllocError::OutOfMemory`] or
    /// [`AllocError::PoolExhausted`].
    pub fn malloc(&mut self, size: u64) -> Result<VirtualAddress, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if size <= DYN_ALLOC_MAX_BLOCK_SIZE {
            return self
                .blocks
                .alloc(&mut SyscallPages(&mut self.syscalls), size)
                .ok_or(AllocError::OutOfMemory);
        }

        let chunk = self.chunks.reserve(size)?;
        if let Err(e) = self.syscalls.allocate_user_mem(chunk.start, chunk.size) {
            self.chunks.release(chunk.start)?;
            return Err(e);
        }
        Ok(chunk.start)
    }

    /// Free an allocation. Shared regions are detached as by [`sfree`](Self::sfree).
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] outside the heap, or
    /// [`AllocError::NotAllocated`] if `va` is not the start of an allocation.
    pub fn free(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        if self.blocks.contains(va) {
            return self.blocks.free(&mut SyscallPages(&mut self.syscalls), va);
        }
        if !self.chunks.contains(va) {
            return Err(AllocError::InvalidAddress(va));
        }
        if self.shared_id(va).is_some() {
            return self.sfree(va);
        }
        let chunk = self.chunks.chunk_at(va).ok_or(AllocError::NotAllocated(va))?;
        self.syscalls.free_user_mem(chunk.start, chunk.size);
        self.chunks.release(va)?;
        Ok(())
    }

    /// Resize an allocation, moving its contents if needed.
    ///
    /// `None` allocates; a zero `size` frees and yields `Ok(None)`. If a move
    /// fails the old allocation stays valid.
    ///
    /// # Errors
    /// As for [`malloc`](Self::malloc) and [`free`](Self::free); shared
    /// regions cannot be resized.
    pub fn realloc(
        &mut self,
        va: Option<VirtualAddress>,
        size: u64,
    ) -> Result<Option<VirtualAddress>, AllocError> {
        let Some(va) = va else {
            return self.malloc(size).map(Some);
        };
        if self.shared_id(va).is_some() {
            return Err(AllocError::NotAllocated(va));
        }
        if size == 0 {
            self.free(va)?;
            return Ok(None);
        }
        let current = self.size_of(va).ok_or(AllocError::NotAllocated(va))?;

        if self.blocks.contains(va) && size <= DYN_ALLOC_MAX_BLOCK_SIZE {
            return self
                .blocks
                .realloc(&mut SyscallPages(&mut self.syscalls), va, size, |pages, from, to, len| {
                    pages.0.move_user_mem(from, to, len)
                })?
                .ok_or(AllocError::OutOfMemory)
                .map(Some);
        }
        if self.chunks.contains(va) && round_up_to_page(size) == Some(current) {
            return Ok(Some(va));
        }

        let moved = self.malloc(size)?;
        if let Err(e) = self.syscalls.move_user_mem(va, moved, current.min(size)) {
            self.free(moved)?;
            return Err(e);
        }
        self.free(va)?;
        Ok(Some(moved))
    }

    /// Create a shared object named `name` and map it into this heap.
    ///
    /// # Errors
    /// Placement errors, or [`AllocError::Share`] from the registry, after
    /// which the placed chunk is released again.
    pub fn smalloc(&mut self, name: &str, size: u64, writable: bool) -> Result<VirtualAddress, AllocError> {
        let chunk = self.chunks.reserve(size.max(1))?;
        match self
            .syscalls
            .create_shared_object(name, size, writable, chunk.start)
        {
            Ok(id) => {
                self.shared.push((chunk.start, id));
                Ok(chunk.start)
            }
            Err(e) => {
                log::debug!("smalloc({name:?}) failed: {e}");
                self.chunks.release(chunk.start)?;
                Err(e.into())
            }
        }
    }

    /// Map the object `name` of `owner` into this heap.
    ///
    /// # Errors
    /// [`AllocError::Share`] with [`ShareError::NotFound`] if there is no such
    /// object; placement errors as for [`smalloc`](Self::smalloc).
    pub fn sget(&mut self, owner: OwnerId, name: &str) -> Result<VirtualAddress, AllocError> {
        let size = self.syscalls.size_of_shared_object(owner, name)?;
        let chunk = self.chunks.reserve(size.max(1))?;
        match self.syscalls.get_shared_object(owner, name, chunk.start) {
            Ok(id) => {
                self.shared.push((chunk.start, id));
                Ok(chunk.start)
            }
            Err(e) => {
                log::debug!("sget({owner:?}, {name:?}) failed: {e}");
                self.chunks.release(chunk.start)?;
                Err(e.into())
            }
        }
    }

    /// Detach the shared object mapped at `va`.
    ///
    /// # Errors
    /// [`AllocError::NotAllocated`] if no shared object is mapped there.
    pub fn sfree(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        let index = self
            .shared
            .iter()
            .position(|(at, _)| *at == va)
            .ok_or(AllocError::NotAllocated(va))?;
        let (_, id) = self.shared[index];
        self.syscalls.delete_shared_object(id, va)?;
        self.shared.swap_remove(index);
        self.chunks.release(va)?;
        Ok(())
    }

    /// Usable size of the allocation at `va`.
    #[must_use]
    pub fn size_of(&self, va: VirtualAddress) -> Option<u64> {
        if self.blocks.contains(va) {
            self.blocks.block_size_of(va)
        } else {
            self.chunks.size_of(va)
        }
    }

    /// Object mapped at `va`, if `va` starts a shared region.
    #[must_use]
    pub fn shared_id(&self, va: VirtualAddress) -> Option<ShareId> {
        self.shared.iter().find(|(at, _)| *at == va).map(|(_, id)| *id)
    }
}
