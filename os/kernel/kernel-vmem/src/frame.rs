use crate::VmemError;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Descriptor of one physical frame.
///
/// The fields can only be changed by [`map_frame`](crate::map_frame),
/// [`unmap_frame`](crate::unmap_frame), [`retain_frame`](crate::retain_frame)
/// and [`release_frame`](crate::release_frame); allocators merely store it.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameInfo {
    references: u32,
    virt_addr: Option<VirtualAddress>,
}

impl FrameInfo {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            references: 0,
            virt_addr: None,
        }
    }

    /// Number of mappings and explicit owners holding the frame.
    #[must_use]
    pub const fn references(&self) -> u32 {
        self.references
    }

    /// Page the frame was most recently mapped at, while it is mapped there.
    #[must_use]
    pub const fn virtual_address(&self) -> Option<VirtualAddress> {
        self.virt_addr
    }

    pub(crate) const fn retain(&mut self) -> u32 {
        self.references += 1;
        self.references
    }

    pub(crate) const fn release(&mut self) -> u32 {
        self.references = self.references.saturating_sub(1);
        self.references
    }

    pub(crate) const fn set_virtual_address(&mut self, va: Option<VirtualAddress>) {
        self.virt_addr = va;
    }
}

/// Source of physical frames.
pub trait FrameAllocator {
    /// Take a free frame. Its contents are zeroed and it has no references.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] when the pool is empty.
    fn allocate_frame(&mut self) -> Result<PhysicalAddress, VmemError>;

    /// Put a frame back into the pool.
    ///
    /// Callers go through [`release_frame`](crate::release_frame), which only
    /// frees a frame once its reference count drops to zero.
    fn free_frame(&mut self, frame: PhysicalAddress);

    fn frame_info(&self, frame: PhysicalAddress) -> Option<&FrameInfo>;

    fn frame_info_mut(&mut self, frame: PhysicalAddress) -> Option<&mut FrameInfo>;

    /// The page of memory backing `frame`.
    fn frame_bytes(&self, frame: PhysicalAddress) -> Option<&[u8]>;

    fn frame_bytes_mut(&mut self, frame: PhysicalAddress) -> Option<&mut [u8]>;

    /// Number of frames currently available.
    fn free_frames(&self) -> usize;
}

/// A pool of frames backed by owned memory.
///
/// Frames are numbered upwards from `base`. Allocation returns the lowest
/// free frame first.
pub struct FrameTable {
    base: PhysicalAddress,
    infos: Vec<FrameInfo>,
    allocated: Vec<bool>,
    free: Vec<usize>,
    memory: Vec<u8>,
}

impl FrameTable {
    /// A pool of `frames` frames starting at physical address `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        Self {
            base: base.page_base(),
            infos: vec![FrameInfo::new(); frames],
            allocated: vec![false; frames],
            free: (0..frames).rev().collect(),
            memory: vec![0; frames * PAGE_SIZE as usize],
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.infos.len()
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalAddress) -> bool {
        self.index_of(frame).is_some_and(|i| self.allocated[i])
    }

    fn index_of(&self, frame: PhysicalAddress) -> Option<usize> {
        let offset = frame.as_u64().checked_sub(self.base.as_u64())?;
        let index = usize::try_from(offset / PAGE_SIZE).ok()?;
        (index < self.infos.len()).then_some(index)
    }

    fn page_range(index: usize) -> core::ops::Range<usize> {
        let start = index * PAGE_SIZE as usize;
        start..start + PAGE_SIZE as usize
    }
}

impl FrameAllocator for FrameTable {
    fn allocate_frame(&mut self) -> Result<PhysicalAddress, VmemError> {
        let index = self.free.pop().ok_or(VmemError::OutOfMemory)?;
        self.allocated[index] = true;
        self.infos[index] = FrameInfo::new();
        self.memory[Self::page_range(index)].fill(0);

        let frame = self.base + index as u64 * PAGE_SIZE;
        log::trace!("allocated frame {frame:?}");
        Ok(frame)
    }

    fn free_frame(&mut self, frame: PhysicalAddress) {
        let Some(index) = self.index_of(frame) else {
            log::warn!("free of unmanaged frame {frame:?}");
            return;
        };
        if !self.allocated[index] {
            log::warn!("double free of frame {frame:?}");
            return;
        }
        self.allocated[index] = false;
        self.infos[index] = FrameInfo::new();
        self.free.push(index);
        log::trace!("freed frame {frame:?}");
    }

    fn frame_info(&self, frame: PhysicalAddress) -> Option<&FrameInfo> {
        self.index_of(frame).map(|i| &self.infos[i])
    }

    fn frame_info_mut(&mut self, frame: PhysicalAddress) -> Option<&mut FrameInfo> {
        self.index_of(frame).map(|i| &mut self.infos[i])
    }

    fn frame_bytes(&self, frame: PhysicalAddress) -> Option<&[u8]> {
        self.index_of(frame).map(|i| &self.memory[Self::page_range(i)])
    }

    fn frame_bytes_mut(&mut self, frame: PhysicalAddress) -> Option<&mut [u8]> {
        self.index_of(frame).map(|i| &mut self.memory[Self::page_range(i)])
    }

    fn free_frames(&self) -> usize {
        self.free.len()
    }
}
