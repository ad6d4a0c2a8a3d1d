use crate::{AddressSpace, FrameAllocator, PagePermissions, VmemError};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Map `frame` at the page containing `va`.
///
/// Any other frame mapped there is unmapped first. The frame gains one
/// reference and records `va` as its reverse mapping. `PRESENT` is implied.
///
/// # Errors
/// [`VmemError::UnknownFrame`] if `frame` does not belong to `frames`, or
/// the error of [`AddressSpace::install`].
pub fn map_frame<A, F>(
    space: &mut A,
    frames: &mut F,
    frame: PhysicalAddress,
    va: VirtualAddress,
    permissions: PagePermissions,
) -> Result<(), VmemError>
where
    A: AddressSpace + ?Sized,
    F: FrameAllocator + ?Sized,
{
    let page = va.page_base();
    let frame = frame.page_base();

    // retain first so remapping the same frame keeps it alive
    retain_frame(frames, frame)?;
    if space.frame(page).is_some() {
        unmap_frame(space, frames, page);
    }

    if let Err(e) = space.install(page, frame, permissions | PagePermissions::PRESENT) {
        release_frame(frames, frame);
        return Err(e);
    }
    if let Some(info) = frames.frame_info_mut(frame) {
        info.set_virtual_address(Some(page));
    }
    space.invalidate(page);
    Ok(())
}

/// Unmap the page containing `va`, returning the frame that was mapped.
///
/// The frame loses one reference and is freed when none remain.
pub fn unmap_frame<A, F>(space: &mut A, frames: &mut F, va: VirtualAddress) -> Option<PhysicalAddress>
where
    A: AddressSpace + ?Sized,
    F: FrameAllocator + ?Sized,
{
    let page = va.page_base();
    let frame = space.clear(page)?;
    if let Some(info) = frames.frame_info_mut(frame)
        && info.virtual_address() == Some(page)
    {
        info.set_virtual_address(None);
    }
    release_frame(frames, frame);
    space.invalidate(page);
    Some(frame)
}

/// Allocate a zeroed frame and map it at `va`.
///
/// # Errors
/// [`VmemError::OutOfMemory`] when no frame is free or no table could be
/// made for `va`; the frame is freed again in the latter case.
pub fn allocate_and_map<A, F>(
    space: &mut A,
    frames: &mut F,
    va: VirtualAddress,
    permissions: PagePermissions,
) -> Result<PhysicalAddress, VmemError>
where
    A: AddressSpace + ?Sized,
    F: FrameAllocator + ?Sized,
{
    let frame = frames.allocate_frame()?;
    // a failed install drops the only reference, which frees the frame
    map_frame(space, frames, frame, va, permissions)?;
    Ok(frame)
}

/// Take an additional reference on `frame`, returning the new count.
///
/// # Errors
/// [`VmemError::UnknownFrame`] if `frame` does not belong to `frames`.
pub fn retain_frame<F>(frames: &mut F, frame: PhysicalAddress) -> Result<u32, VmemError>
where
    F: FrameAllocator + ?Sized,
{
    frames
        .frame_info_mut(frame)
        .map(|info| info.retain())
        .ok_or(VmemError::UnknownFrame(frame))
}

/// Drop one reference on `frame`; returns `true` if that freed it.
pub fn release_frame<F>(frames: &mut F, frame: PhysicalAddress) -> bool
where
    F: FrameAllocator + ?Sized,
{
    let Some(info) = frames.frame_info_mut(frame) else {
        log::warn!("release of unmanaged frame {frame:?}");
        return false;
    };
    if info.release() > 0 {
        return false;
    }
    frames.free_frame(frame);
    true
}
