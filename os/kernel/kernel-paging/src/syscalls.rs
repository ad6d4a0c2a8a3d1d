//! The user heap's system calls, served against one environment.

use crate::{Environment, PageFile, ReplacementPolicy, replacement, user_memory};
use alloc::vec;
use kernel_alloc::{AllocError, UserMemorySyscalls};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_shm::{OwnerId, ShareError, ShareId, ShareRegistry};
use kernel_vmem::{AddressSpace, FrameAllocator, PagePermissions, allocate_and_map, unmap_frame};

const PAGE_BYTES: usize = PAGE_SIZE as usize;

const BLOCK_PAGE: PagePermissions = PagePermissions::USER
    .union(PagePermissions::WRITABLE)
    .union(PagePermissions::HEAP_PAGE);

/// [`UserMemorySyscalls`] for the environment `env`.
///
/// Pages the kernel has to touch on the caller's behalf in
/// [`move_user_mem`](UserMemorySyscalls::move_user_mem) are faulted in with
/// `policy`.
pub struct KernelSyscalls<'a, A, F: ?Sized, P: ?Sized> {
    pub env: &'a mut Environment<A>,
    pub frames: &'a mut F,
    pub page_file: &'a mut P,
    pub registry: &'a ShareRegistry,
    pub policy: ReplacementPolicy,
}

impl<'a, A, F, P> KernelSyscalls<'a, A, F, P>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    #[must_use]
    pub fn new(
        env: &'a mut Environment<A>,
        frames: &'a mut F,
        page_file: &'a mut P,
        registry: &'a ShareRegistry,
    ) -> Self {
        Self {
            env,
            frames,
            page_file,
            registry,
            policy: ReplacementPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn owner(&self) -> OwnerId {
        OwnerId::from(self.env.id)
    }

    /// Make the page at `va` resident the way a user access would.
    fn touch(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        let permissions = self.env.space.permissions(va);
        if permissions.present() {
            return Ok(());
        }
        if !permissions.heap_page() {
            return Err(AllocError::InvalidAddress(va));
        }
        replacement::resolve(self.env, self.frames, self.page_file, self.policy, va).map_err(
            |reason| {
                log::warn!("{:?}: cannot fault in {va}: {reason}", self.env.id);
                AllocError::OutOfMemory
            },
        )
    }
}

impl<A, F, P> UserMemorySyscalls for KernelSyscalls<'_, A, F, P>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    fn allocate_user_mem(&mut self, va: VirtualAddress, size: u64) -> Result<(), AllocError> {
        user_memory::allocate_user_mem(self.env, va, size).map_err(|e| {
            log::warn!("{:?}: cannot reserve {size} bytes at {va}: {e}", self.env.id);
            AllocError::OutOfMemory
        })
    }

    fn free_user_mem(&mut self, va: VirtualAddress, size: u64) {
        user_memory::free_user_mem(self.env, self.frames, self.page_file, va, size);
    }

    fn allocate_page(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        allocate_and_map(&mut self.env.space, self.frames, va, BLOCK_PAGE)
            .map(|_| ())
            .map_err(|_| AllocError::OutOfMemory)
    }

    fn unmap_page(&mut self, va: VirtualAddress) {
        unmap_frame(&mut self.env.space, self.frames, va);
        self.env.space.invalidate(va);
    }

    fn create_shared_object(
        &mut self,
        name: &str,
        size: u64,
        writable: bool,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError> {
        let owner = self.owner();
        self.registry.create(
            &mut self.env.space,
            self.frames,
            owner,
            name,
            size,
            writable,
            va,
        )
    }

    fn get_shared_object(
        &mut self,
        owner: OwnerId,
        name: &str,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError> {
        self.registry
            .get(&mut self.env.space, self.frames, owner, name, va)
    }

    fn size_of_shared_object(&mut self, owner: OwnerId, name: &str) -> Result<u64, ShareError> {
        self.registry.size_of(owner, name)
    }

    fn delete_shared_object(&mut self, id: ShareId, va: VirtualAddress) -> Result<(), ShareError> {
        self.registry.delete(&mut self.env.space, self.frames, id, va)
    }

    fn move_user_mem(
        &mut self,
        from: VirtualAddress,
        to: VirtualAddress,
        len: u64,
    ) -> Result<(), AllocError> {
        let mut buffer = vec![0; PAGE_BYTES];
        let mut done = 0;
        while done < len {
            let src = from + done;
            let dst = to + done;
            let chunk = (len - done)
                .min(PAGE_SIZE - src.page_offset())
                .min(PAGE_SIZE - dst.page_offset());
            let bytes = &mut buffer[..chunk as usize];

            self.touch(src)?;
            read(&self.env.space, &*self.frames, src, bytes)?;
            self.touch(dst)?;
            write(&mut self.env.space, self.frames, dst, bytes)?;
            done += chunk;
        }
        log::trace!("{:?}: moved {len} bytes {from} -> {to}", self.env.id);
        Ok(())
    }
}

fn read<A, F>(space: &A, frames: &F, va: VirtualAddress, out: &mut [u8]) -> Result<(), AllocError>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
{
    let bytes = space
        .frame(va)
        .and_then(|frame| frames.frame_bytes(frame))
        .ok_or(AllocError::InvalidAddress(va))?;
    let offset = va.page_offset() as usize;
    out.copy_from_slice(&bytes[offset..offset + out.len()]);
    Ok(())
}

fn write<A, F>(space: &mut A, frames: &mut F, va: VirtualAddress, data: &[u8]) -> Result<(), AllocError>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
{
    let bytes = space
        .frame(va)
        .and_then(|frame| frames.frame_bytes_mut(frame))
        .ok_or(AllocError::InvalidAddress(va))?;
    let offset = va.page_offset() as usize;
    bytes[offset..offset + data.len()].copy_from_slice(data);
    space
        .set_permissions(
            va,
            PagePermissions::USED | PagePermissions::MODIFIED,
            PagePermissions::NONE,
        )
        .map_err(|_| AllocError::InvalidAddress(va))
}
