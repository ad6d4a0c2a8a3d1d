//! # Page-Granular Chunk Allocator
//!
//! An address-ordered list of chunks covering `[start, brk)`, each either
//! allocated or free. The list records live in a fixed-capacity pool and are
//! linked by index, so the allocator never writes into the memory it manages.
//!
//! ```text
//!  start                                              brk        limit
//!    │                                                 │           │
//!    ▼                                                 ▼           ▼
//!    ┌────────┬──────────────┬────────┬────────────────┬─ ─ ─ ─ ─ ─┐
//!    │ used 1 │   free 3     │ used 2 │     used 1     │  unused    │
//!    └────────┴──────────────┴────────┴────────────────┴─ ─ ─ ─ ─ ─┘
//! ```
//!
//! Placement tries an exact fit, then the largest free chunk (split, the
//! prefix is handed out), then bumps `brk`.

use crate::AllocError;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, round_up_to_page};

/// A contiguous run of pages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Chunk {
    pub start: VirtualAddress,
    /// Size in bytes, a multiple of [`PAGE_SIZE`].
    pub size: u64,
    pub free: bool,
}

impl Chunk {
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.size)
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.size / PAGE_SIZE
    }

    /// Start addresses of the chunk's pages.
    pub fn page_addresses(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let start = self.start;
        (0..self.pages()).map(move |i| start + i * PAGE_SIZE)
    }
}

/// Index of a record in a [`ChunkList`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChunkHandle(usize);

#[derive(Debug, Clone)]
struct Node {
    chunk: Chunk,
    prev: Option<ChunkHandle>,
    next: Option<ChunkHandle>,
}

/// A doubly linked list of chunks over a bounded record pool.
///
/// Removed records are recycled before the pool grows.
#[derive(Debug, Clone)]
pub struct ChunkList {
    slots: Vec<Option<Node>>,
    vacant: Vec<usize>,
    head: Option<ChunkHandle>,
    tail: Option<ChunkHandle>,
    len: usize,
    capacity: usize,
}

impl ChunkList {
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            capacity,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn head(&self) -> Option<ChunkHandle> {
        self.head
    }

    #[must_use]
    pub const fn tail(&self) -> Option<ChunkHandle> {
        self.tail
    }

    #[must_use]
    pub fn get(&self, handle: ChunkHandle) -> Option<&Chunk> {
        self.node(handle).map(|n| &n.chunk)
    }

    pub fn get_mut(&mut self, handle: ChunkHandle) -> Option<&mut Chunk> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .map(|n| &mut n.chunk)
    }

    #[must_use]
    pub fn next(&self, handle: ChunkHandle) -> Option<ChunkHandle> {
        self.node(handle).and_then(|n| n.next)
    }

    #[must_use]
    pub fn prev(&self, handle: ChunkHandle) -> Option<ChunkHandle> {
        self.node(handle).and_then(|n| n.prev)
    }

    /// Chunks in address order.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkHandle, &Chunk)> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let handle = cursor?;
            let node = self.node(handle)?;
            cursor = node.next;
            Some((handle, &node.chunk))
        })
    }

    /// Append a chunk at the tail.
    ///
    /// # Errors
    /// [`AllocError::PoolExhausted`] if every record is in use.
    pub fn push_back(&mut self, chunk: Chunk) -> Result<ChunkHandle, AllocError> {
        let handle = self.claim(Node {
            chunk,
            prev: self.tail,
            next: None,
        })?;
        match self.tail {
            Some(tail) => self.link_next(tail, Some(handle)),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        Ok(handle)
    }

    /// Insert a chunk right after `after`.
    ///
    /// # Errors
    /// [`AllocError::PoolExhausted`] if every record is in use.
    pub fn insert_after(
        &mut self,
        after: ChunkHandle,
        chunk: Chunk,
    ) -> Result<ChunkHandle, AllocError> {
        let next = self.next(after);
        let handle = self.claim(Node {
            chunk,
            prev: Some(after),
            next,
        })?;
        self.link_next(after, Some(handle));
        match next {
            Some(next) => self.link_prev(next, Some(handle)),
            None => self.tail = Some(handle),
        }
        Ok(handle)
    }

    /// Unlink a chunk and recycle its record.
    pub fn remove(&mut self, handle: ChunkHandle) -> Option<Chunk> {
        let node = self.slots.get_mut(handle.0)?.take()?;
        match node.prev {
            Some(prev) => self.link_next(prev, node.next),
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.link_prev(next, node.prev),
            None => self.tail = node.prev,
        }
        self.vacant.push(handle.0);
        self.len -= 1;
        Some(node.chunk)
    }

    fn node(&self, handle: ChunkHandle) -> Option<&Node> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    fn claim(&mut self, node: Node) -> Result<ChunkHandle, AllocError> {
        let index = if let Some(index) = self.vacant.pop() {
            self.slots[index] = Some(node);
            index
        } else if self.slots.len() < self.capacity {
            self.slots.push(Some(node));
            self.slots.len() - 1
        } else {
            return Err(AllocError::PoolExhausted);
        };
        self.len += 1;
        Ok(ChunkHandle(index))
    }

    fn link_next(&mut self, handle: ChunkHandle, next: Option<ChunkHandle>) {
        if let Some(node) = self.slots.get_mut(handle.0).and_then(Option::as_mut) {
            node.next = next;
        }
    }

    fn link_prev(&mut self, handle: ChunkHandle, prev: Option<ChunkHandle>) {
        if let Some(node) = self.slots.get_mut(handle.0).and_then(Option::as_mut) {
            node.prev = prev;
        }
    }
}

/// Where a request of a given size goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Placement<H> {
    /// A free chunk of exactly the requested size.
    Exact(H),
    /// The largest free chunk, strictly larger than the request.
    Split(H),
    /// No free chunk fits; grow the break.
    Extend,
}

/// Pick the placement for `size` bytes among `chunks`, in address order.
///
/// The first exact fit wins. Failing that, the first of the largest free
/// chunks larger than `size` is split.
pub fn find_placement<'a, H, I>(chunks: I, size: u64) -> Placement<H>
where
    H: Copy,
    I: IntoIterator<Item = (H, &'a Chunk)>,
{
    let mut worst: Option<(H, u64)> = None;
    for (handle, chunk) in chunks {
        if !chunk.free {
            continue;
        }
        if chunk.size == size {
            return Placement::Exact(handle);
        }
        if chunk.size > size && worst.is_none_or(|(_, best)| chunk.size > best) {
            worst = Some((handle, chunk.size));
        }
    }
    worst.map_or(Placement::Extend, |(handle, _)| Placement::Split(handle))
}

/// Chunk allocator over `[start, limit)`.
#[derive(Debug, Clone)]
pub struct ChunkAllocator {
    list: ChunkList,
    start: VirtualAddress,
    brk: VirtualAddress,
    limit: VirtualAddress,
}

impl ChunkAllocator {
    /// # Panics
    /// If `start` is not page aligned.
    #[must_use]
    pub fn new(start: VirtualAddress, limit: VirtualAddress, max_chunks: usize) -> Self {
        assert!(start.is_page_aligned(), "chunk area must start on a page");
        Self {
            list: ChunkList::with_capacity(max_chunks),
            start,
            brk: start,
            limit,
        }
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// First address past the last chunk.
    #[must_use]
    pub const fn brk(&self) -> VirtualAddress {
        self.brk
    }

    #[must_use]
    pub const fn limit(&self) -> VirtualAddress {
        self.limit
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va.is_within(self.start.as_u64(), self.limit.as_u64())
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.list.iter().map(|(_, chunk)| chunk)
    }

    /// The allocated chunk starting at `va`.
    #[must_use]
    pub fn chunk_at(&self, va: VirtualAddress) -> Option<Chunk> {
        self.find(va).map(|(_, chunk)| chunk)
    }

    /// Size of the allocated chunk starting at `va`.
    #[must_use]
    pub fn size_of(&self, va: VirtualAddress) -> Option<u64> {
        self.chunk_at(va).map(|c| c.size)
    }

    /// Reserve `size` bytes, rounded up to whole pages.
    ///
    /// The returned chunk is marked allocated; backing it is up to the caller.
    ///
    /// # Errors
    /// - [`AllocError::ZeroSize`] for an empty request.
    /// - [`AllocError::PoolExhausted`] when a new record is needed but none is left.
    /// - [`AllocError::OutOfMemory`] when the break would pass the limit, or
    ///   when `size` cannot be rounded up to whole pages.
    pub fn reserve(&mut self, size: u64) -> Result<Chunk, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let size = round_up_to_page(size).ok_or(AllocError::OutOfMemory)?;

        match find_placement(self.list.iter(), size) {
            Placement::Exact(handle) => {
                let chunk = self.list.get_mut(handle).ok_or(AllocError::OutOfMemory)?;
                chunk.free = false;
                log::debug!("exact fit {} at {}", chunk.size, chunk.start);
                Ok(*chunk)
            }
            Placement::Split(handle) => {
                let whole = *self.list.get(handle).ok_or(AllocError::OutOfMemory)?;
                self.list.insert_after(
                    handle,
                    Chunk {
                        start: whole.start + size,
                        size: whole.size - size,
                        free: true,
                    },
                )?;
                let chunk = self.list.get_mut(handle).ok_or(AllocError::OutOfMemory)?;
                chunk.size = size;
                chunk.free = false;
                log::debug!("worst fit: split {} at {} for {size}", whole.size, whole.start);
                Ok(*chunk)
            }
            Placement::Extend => {
                let end = self
                    .brk
                    .checked_add(size)
                    .filter(|end| *end <= self.limit)
                    .ok_or(AllocError::OutOfMemory)?;
                let chunk = Chunk {
                    start: self.brk,
                    size,
                    free: false,
                };
                self.list.push_back(chunk)?;
                self.brk = end;
                log::debug!("extended break to {end} for {size}");
                Ok(chunk)
            }
        }
    }

    /// Free the chunk starting at `va` and return it as it was allocated.
    ///
    /// The chunk coalesces with free neighbours. A free chunk left at the end
    /// is dropped and the break moves down to its start.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] outside `[start, limit)`,
    /// [`AllocError::NotAllocated`] if no allocated chunk starts at `va`.
    pub fn release(&mut self, va: VirtualAddress) -> Result<Chunk, AllocError> {
        if !self.contains(va) {
            return Err(AllocError::InvalidAddress(va));
        }
        let (mut handle, released) = self.find(va).ok_or(AllocError::NotAllocated(va))?;
        if let Some(chunk) = self.list.get_mut(handle) {
            chunk.free = true;
        }

        if let Some(next) = self.list.next(handle)
            && self.list.get(next).is_some_and(|c| c.free)
            && let Some(absorbed) = self.list.remove(next)
            && let Some(chunk) = self.list.get_mut(handle)
        {
            chunk.size += absorbed.size;
        }

        if let Some(prev) = self.list.prev(handle)
            && self.list.get(prev).is_some_and(|c| c.free)
            && let Some(absorbed) = self.list.remove(handle)
            && let Some(chunk) = self.list.get_mut(prev)
        {
            chunk.size += absorbed.size;
            handle = prev;
        }

        if self.list.tail() == Some(handle)
            && let Some(last) = self.list.remove(handle)
        {
            self.brk = last.start;
            log::debug!("lowered break to {}", self.brk);
        }

        Ok(released)
    }

    fn find(&self, va: VirtualAddress) -> Option<(ChunkHandle, Chunk)> {
        self.list
            .iter()
            .take_while(|(_, c)| c.start <= va)
            .find(|(_, c)| c.start == va && !c.free)
            .map(|(h, c)| (h, *c))
    }
}
