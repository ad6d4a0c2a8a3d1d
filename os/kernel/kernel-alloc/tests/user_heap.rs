use kernel_alloc::{AllocError, UserHeap, UserMemorySyscalls};
use kernel_info::memory::{USER_HEAP_START, USER_PAGE_ALLOC_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_shm::{OwnerId, ShareError, ShareId, ShareRegistry};
use kernel_vmem::{
    AddressSpace, FrameAllocator, FrameTable, PagePermissions, SoftAddressSpace, allocate_and_map,
    unmap_frame,
};
use std::cell::RefCell;
use std::rc::Rc;

/// One process's view of a small machine: its own address space, frames and
/// the share registry shared with every other process.
struct Process {
    owner: OwnerId,
    space: SoftAddressSpace,
    frames: Rc<RefCell<FrameTable>>,
    registry: Rc<ShareRegistry>,
    reserved: Vec<(VirtualAddress, u64)>,
    moves: Vec<(VirtualAddress, VirtualAddress, u64)>,
}

impl UserMemorySyscalls for Process {
    fn allocate_user_mem(&mut self, va: VirtualAddress, size: u64) -> Result<(), AllocError> {
        self.reserved.push((va, size));
        Ok(())
    }

    fn free_user_mem(&mut self, va: VirtualAddress, size: u64) {
        let index = self.reserved.iter().position(|r| *r == (va, size)).unwrap();
        self.reserved.remove(index);
    }

    fn allocate_page(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        let permissions = PagePermissions::USER | PagePermissions::WRITABLE;
        allocate_and_map(&mut self.space, &mut *self.frames.borrow_mut(), va, permissions)
            .map(|_| ())
            .map_err(|_| AllocError::OutOfMemory)
    }

    fn unmap_page(&mut self, va: VirtualAddress) {
        unmap_frame(&mut self.space, &mut *self.frames.borrow_mut(), va).unwrap();
    }

    fn create_shared_object(
        &mut self,
        name: &str,
        size: u64,
        writable: bool,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError> {
        let mut frames = self.frames.borrow_mut();
        self.registry
            .create(&mut self.space, &mut *frames, self.owner, name, size, writable, va)
    }

    fn get_shared_object(
        &mut self,
        owner: OwnerId,
        name: &str,
        va: VirtualAddress,
    ) -> Result<ShareId, ShareError> {
        let mut frames = self.frames.borrow_mut();
        self.registry.get(&mut self.space, &mut *frames, owner, name, va)
    }

    fn size_of_shared_object(&mut self, owner: OwnerId, name: &str) -> Result<u64, ShareError> {
        self.registry.size_of(owner, name)
    }

    fn delete_shared_object(&mut self, id: ShareId, va: VirtualAddress) -> Result<(), ShareError> {
        let mut frames = self.frames.borrow_mut();
        self.registry.delete(&mut self.space, &mut *frames, id, va)
    }

    fn move_user_mem(
        &mut self,
        from: VirtualAddress,
        to: VirtualAddress,
        len: u64,
    ) -> Result<(), AllocError> {
        self.moves.push((from, to, len));
        Ok(())
    }
}

struct Machine {
    frames: Rc<RefCell<FrameTable>>,
    registry: Rc<ShareRegistry>,
}

impl Machine {
    fn new(frames: usize) -> Self {
        Self {
            frames: Rc::new(RefCell::new(FrameTable::new(PhysicalAddress::new(0x80_0000), frames))),
            registry: Rc::new(ShareRegistry::new()),
        }
    }

    fn process(&self, id: u32) -> UserHeap<Process> {
        UserHeap::new(Process {
            owner: OwnerId(id),
            space: SoftAddressSpace::new(),
            frames: Rc::clone(&self.frames),
            registry: Rc::clone(&self.registry),
            reserved: Vec::new(),
            moves: Vec::new(),
        })
    }

    fn free_frames(&self) -> usize {
        self.frames.borrow().free_frames()
    }
}

#[test]
fn small_allocations_map_block_pages() {
    let machine = Machine::new(8);
    let mut heap = machine.process(1);
    let a = heap.malloc(40).unwrap();
    let b = heap.malloc(64).unwrap();
    assert_eq!(a.page_base(), VirtualAddress::new(USER_HEAP_START));
    assert_eq!(heap.size_of(a), Some(64));
    assert_eq!(machine.free_frames(), 7);
    assert!(heap.syscalls().space.permissions(a).user());

    heap.free(a).unwrap();
    heap.free(b).unwrap();
    assert_eq!(machine.free_frames(), 8);
}

#[test]
fn large_allocations_reserve_lazily() {
    let machine = Machine::new(4);
    let mut heap = machine.process(1);
    let va = heap.malloc(3 * PAGE_SIZE - 7).unwrap();
    assert_eq!(va, VirtualAddress::new(USER_PAGE_ALLOC_START));
    assert_eq!(heap.syscalls().reserved, [(va, 3 * PAGE_SIZE)]);
    assert_eq!(machine.free_frames(), 4, "no frames until the pages fault in");

    heap.free(va).unwrap();
    assert!(heap.syscalls().reserved.is_empty());
    assert_eq!(heap.malloc(0), Err(AllocError::ZeroSize));
}

#[test]
fn oversized_requests_are_out_of_memory() {
    let machine = Machine::new(4);
    let mut heap = machine.process(1);
    let start = heap.chunks().brk();

    assert_eq!(heap.malloc(u64::MAX - 100), Err(AllocError::OutOfMemory));
    assert_eq!(heap.malloc(u64::MAX), Err(AllocError::OutOfMemory));
    assert_eq!(heap.smalloc("huge", u64::MAX - 100, true), Err(AllocError::OutOfMemory));
    assert_eq!(heap.chunks().brk(), start);
    assert_eq!(heap.chunks().chunks().count(), 0);
    assert!(heap.syscalls().reserved.is_empty());
    assert!(machine.registry.is_empty());
    assert_eq!(machine.free_frames(), 4);
}

#[test]
fn realloc_asks_the_kernel_to_move() {
    let machine = Machine::new(8);
    let mut heap = machine.process(1);
    let small = heap.malloc(100).unwrap();
    let big = heap.realloc(Some(small), 6000).unwrap().unwrap();
    assert_eq!(heap.syscalls().moves, [(small, big, 128)]);
    assert_eq!(heap.size_of(big), Some(2 * PAGE_SIZE));
    assert_eq!(heap.size_of(small), None);

    assert_eq!(heap.realloc(Some(big), 7000), Ok(Some(big)));
    assert_eq!(heap.realloc(Some(big), 0), Ok(None));
    assert!(heap.syscalls().reserved.is_empty());
}

#[test]
fn shared_objects_map_the_same_frames() {
    let machine = Machine::new(8);
    let mut creator = machine.process(1);
    let mut consumer = machine.process(2);

    let mine = creator.smalloc("ring", PAGE_SIZE + 10, true).unwrap();
    let theirs = consumer.sget(OwnerId(1), "ring").unwrap();
    assert_eq!(machine.free_frames(), 6);
    for page in 0..2 {
        let offset = page * PAGE_SIZE;
        assert_eq!(
            creator.syscalls().space.frame(mine + offset),
            consumer.syscalls().space.frame(theirs + offset)
        );
        assert!(consumer.syscalls().space.permissions(theirs + offset).writable());
    }

    let id = creator.shared_id(mine).unwrap();
    assert_eq!(consumer.shared_id(theirs), Some(id));
    assert_eq!(machine.registry.references(id), Some(2));

    consumer.sfree(theirs).unwrap();
    assert_eq!(machine.registry.references(id), Some(1));
    assert_eq!(consumer.syscalls().space.frame(theirs), None);
    assert_eq!(machine.free_frames(), 6);

    // free on a shared region detaches it as well
    creator.free(mine).unwrap();
    assert!(machine.registry.is_empty());
    assert_eq!(machine.free_frames(), 8);
    assert_eq!(creator.chunks().chunks().count(), 0);
}

#[test]
fn failed_share_calls_release_the_placement() {
    let machine = Machine::new(8);
    let mut creator = machine.process(1);
    let mut consumer = machine.process(2);
    creator.smalloc("log", 100, false).unwrap();
    let brk = creator.chunks().brk();

    assert_eq!(
        creator.smalloc("log", 100, false),
        Err(AllocError::Share(ShareError::AlreadyExists))
    );
    assert_eq!(creator.chunks().brk(), brk);

    assert_eq!(
        consumer.sget(OwnerId(1), "missing"),
        Err(AllocError::Share(ShareError::NotFound))
    );
    assert_eq!(consumer.chunks().chunks().count(), 0);

    let big = Machine::new(1);
    let mut starved = big.process(3);
    assert_eq!(
        starved.smalloc("huge", 4 * PAGE_SIZE, true),
        Err(AllocError::Share(ShareError::NoShare))
    );
    assert_eq!(starved.chunks().chunks().count(), 0);
    assert_eq!(big.free_frames(), 1);
}

#[test]
fn read_only_objects_are_not_writable_for_consumers() {
    let machine = Machine::new(4);
    let mut creator = machine.process(1);
    let mut consumer = machine.process(2);
    creator.smalloc("ro", 10, false).unwrap();
    let va = consumer.sget(OwnerId(1), "ro").unwrap();
    let permissions = consumer.syscalls().space.permissions(va);
    assert!(permissions.present() && permissions.user() && !permissions.writable());
    assert_eq!(consumer.sfree(va + PAGE_SIZE), Err(AllocError::NotAllocated(va + PAGE_SIZE)));
}
