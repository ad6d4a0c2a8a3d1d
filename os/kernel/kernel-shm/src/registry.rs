use crate::{MAX_SHARE_NAME_LEN, OwnerId, ShareError, ShareId};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use kernel_sync::SpinLock;
use kernel_vmem::{
    AddressSpace, FrameAllocator, PagePermissions, map_frame, release_frame, retain_frame,
    unmap_frame,
};

/// One registered object.
#[derive(Debug, Clone)]
pub struct SharedObject {
    pub id: ShareId,
    pub owner: OwnerId,
    pub name: String,
    pub size: u64,
    pub writable: bool,
    /// Processes that created or attached the object and have not deleted it.
    pub references: u32,
    /// Backing frames, one per page.
    pub frames: Vec<PhysicalAddress>,
}

impl SharedObject {
    fn permissions(&self) -> PagePermissions {
        if self.writable {
            PagePermissions::USER | PagePermissions::WRITABLE
        } else {
            PagePermissions::USER
        }
    }
}

/// The global catalogue of shared objects.
///
/// All lookups and mutations happen under one spin lock; frame allocation
/// and mapping never block, so holding it across them is fine.
pub struct ShareRegistry {
    shares: SpinLock<Vec<SharedObject>>,
    next_id: AtomicU32,
}

impl Default for ShareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shares: SpinLock::named("shares lock", Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Create an object and map it into the creator's space at `va`.
    ///
    /// # Errors
    /// * [`ShareError::AlreadyExists`] if `owner` already has an object named `name`.
    /// * [`ShareError::NoShare`] if frames run out; everything allocated is released.
    ///   A size too large to round up to whole pages fails the same way.
    pub fn create<A, F>(
        &self,
        space: &mut A,
        frames: &mut F,
        owner: OwnerId,
        name: &str,
        size: u64,
        writable: bool,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError>
    where
        A: AddressSpace + ?Sized,
        F: FrameAllocator + ?Sized,
    {
        let name = truncate_name(name);
        let mut shares = self.shares.lock();
        if find(&shares, owner, name).is_some() {
            log::debug!("shared object {name:?} of {owner:?} already exists");
            return Err(ShareError::AlreadyExists);
        }
        let Some(pages) = pages_for(size) else {
            log::warn!("shared object {name:?} of {size} bytes cannot be backed");
            return Err(ShareError::NoShare);
        };

        let mut object = SharedObject {
            id: ShareId(self.next_id.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF),
            owner,
            name: String::from(name),
            size,
            writable,
            references: 1,
            frames: Vec::new(),
        };
        let permissions = object.permissions();

        for page in 0..pages {
            match back_page(space, frames, va + page * PAGE_SIZE, permissions) {
                Ok(frame) => object.frames.push(frame),
                Err(e) => {
                    log::warn!("out of frames creating shared object {name:?}: {e}");
                    unback(space, frames, &object.frames, va);
                    return Err(ShareError::NoShare);
                }
            }
        }

        log::debug!(
            "created shared object {:?} {name:?} ({} bytes, {} frames)",
            object.id,
            size,
            object.frames.len()
        );
        let id = object.id;
        shares.push(object);
        Ok(id)
    }

    /// Attach an existing object into the caller's space at `va`.
    ///
    /// # Errors
    /// [`ShareError::NotFound`] if there is no such object. A mapping failure
    /// undoes the pages mapped so far and leaves the reference count alone.
    pub fn get<A, F>(
        &self,
        space: &mut A,
        frames: &mut F,
        owner: OwnerId,
        name: &str,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError>
    where
        A: AddressSpace + ?Sized,
        F: FrameAllocator + ?Sized,
    {
        let mut shares = self.shares.lock();
        let index = find(&shares, owner, truncate_name(name)).ok_or(ShareError::NotFound)?;
        let object = &mut shares[index];
        let permissions = object.permissions();

        for (page, frame) in object.frames.iter().enumerate() {
            let page_va = va + page as u64 * PAGE_SIZE;
            if let Err(e) = map_frame(space, frames, *frame, page_va, permissions) {
                for undo in 0..page as u64 {
                    unmap_frame(space, frames, va + undo * PAGE_SIZE);
                }
                return Err(e.into());
            }
        }

        object.references += 1;
        Ok(object.id)
    }

    /// Size in bytes of an object.
    ///
    /// # Errors
    /// [`ShareError::NotFound`] if there is no such object.
    pub fn size_of(&self, owner: OwnerId, name: &str) -> Result<u64, ShareError> {
        let shares = self.shares.lock();
        find(&shares, owner, truncate_name(name))
            .map(|i| shares[i].size)
            .ok_or(ShareError::NotFound)
    }

    /// [`size_of`](Self::size_of) in system-call form: the size, or a negative status code.
    #[must_use]
    pub fn size_of_status(&self, owner: OwnerId, name: &str) -> i64 {
        self.size_of(owner, name)
            .map_or_else(|e| i64::from(e.status_code()), |size| size.cast_signed())
    }

    /// Detach the object `id` mapped at `va` from the caller's space.
    ///
    /// The object and its frames are released with the last reference. Only
    /// a caller that maps the object at `va` gives up a reference.
    ///
    /// # Errors
    /// [`ShareError::NotFound`] if `id` is not registered or none of its
    /// frames is mapped at `va`.
    pub fn delete<A, F>(
        &self,
        space: &mut A,
        frames: &mut F,
        id: ShareId,
        va: VirtualAddress,
    ) -> Result<(), ShareError>
    where
        A: AddressSpace + ?Sized,
        F: FrameAllocator + ?Sized,
    {
        let mut shares = self.shares.lock();
        let index = shares
            .iter()
            .position(|s| s.id == id)
            .ok_or(ShareError::NotFound)?;

        let object = &mut shares[index];
        let mut detached = 0;
        for (page, frame) in object.frames.iter().enumerate() {
            let Some(page_va) = va.checked_add(page as u64 * PAGE_SIZE) else {
                break;
            };
            if space.frame(page_va) == Some(*frame) {
                unmap_frame(space, frames, page_va);
                detached += 1;
            }
        }
        if detached == 0 {
            log::warn!("shared object {id:?} is not mapped at {va}");
            return Err(ShareError::NotFound);
        }
        space.flush_tlb();

        object.references = object.references.saturating_sub(1);
        if object.references > 0 {
            return Ok(());
        }

        let object = shares.swap_remove(index);
        for frame in object.frames {
            release_frame(frames, frame);
        }
        log::debug!("released shared object {id:?} {:?}", object.name);
        Ok(())
    }

    /// Current reference count of `id`.
    #[must_use]
    pub fn references(&self, id: ShareId) -> Option<u32> {
        self.shares
            .lock()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.references)
    }

    /// A copy of the record for `id`.
    #[must_use]
    pub fn object(&self, id: ShareId) -> Option<SharedObject> {
        self.shares.lock().iter().find(|s| s.id == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shares.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn find(shares: &[SharedObject], owner: OwnerId, name: &str) -> Option<usize> {
    shares
        .iter()
        .position(|s| s.owner == owner && s.name == name)
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_SHARE_NAME_LEN {
        return name;
    }
    let mut end = MAX_SHARE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Allocate a frame owned by the registry and map it at `va`.
fn back_page<A, F>(
    space: &mut A,
    frames: &mut F,
    va: VirtualAddress,
    permissions: PagePermissions,
) -> Result<PhysicalAddress, kernel_vmem::VmemError>
where
    A: AddressSpace + ?Sized,
    F: FrameAllocator + ?Sized,
{
    let frame = frames.allocate_frame()?;
    retain_frame(frames, frame)?;
    if let Err(e) = map_frame(space, frames, frame, va, permissions) {
        release_frame(frames, frame);
        return Err(e);
    }
    Ok(frame)
}

fn unback<A, F>(space: &mut A, frames: &mut F, backed: &[PhysicalAddress], va: VirtualAddress)
where
    A: AddressSpace + ?Sized,
    F: FrameAllocator + ?Sized,
{
    for (page, frame) in backed.iter().enumerate() {
        unmap_frame(space, frames, va + page as u64 * PAGE_SIZE);
        release_frame(frames, *frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        let long = "x".repeat(100);
        assert_eq!(truncate_name(&long).len(), MAX_SHARE_NAME_LEN);
        let wide = "é".repeat(40); // 80 bytes
        let cut = truncate_name(&wide);
        assert!(cut.len() <= MAX_SHARE_NAME_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_name("short"), "short");
    }

    #[test]
    fn status_codes_are_negative_and_distinct() {
        let codes = [
            ShareError::AlreadyExists.status_code(),
            ShareError::NotFound.status_code(),
            ShareError::NoShare.status_code(),
        ];
        assert!(codes.iter().all(|c| *c < 0));
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
    }
}
