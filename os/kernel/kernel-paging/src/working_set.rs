use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

/// A resident page of an environment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WorkingSetElement {
    pub va: VirtualAddress,
    /// LRU age; larger is younger.
    pub time_stamp: u32,
    /// Consecutive sweeps that found the page unused.
    pub sweeps_counter: u32,
    /// Slot held without a page.
    pub empty: bool,
}

impl WorkingSetElement {
    /// A freshly placed page, the youngest there is.
    #[must_use]
    pub const fn new(va: VirtualAddress) -> Self {
        Self {
            va: va.page_base(),
            time_stamp: u32::MAX,
            sweeps_counter: 0,
            empty: false,
        }
    }
}

/// The bounded, ordered list of an environment's resident pages.
///
/// The list doubles as the clock ring. Once it has been full, the cursor
/// marks where the next sweep starts and new pages are placed right before
/// it, i.e. at the back of the ring.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WorkingSet {
    elements: Vec<WorkingSetElement>,
    max: usize,
    cursor: Option<usize>,
}

impl WorkingSet {
    /// An empty set holding at most `max` pages (at least one).
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            elements: Vec::new(),
            max: max.max(1),
            cursor: None,
        }
    }

    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.elements.len() >= self.max
    }

    #[must_use]
    pub const fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&WorkingSetElement> {
        self.elements.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut WorkingSetElement> {
        self.elements.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkingSetElement> + '_ {
        self.elements.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkingSetElement> + '_ {
        self.elements.iter_mut()
    }

    /// Page addresses in list order.
    pub fn addresses(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        self.elements.iter().map(|e| e.va)
    }

    #[must_use]
    pub fn position(&self, va: VirtualAddress) -> Option<usize> {
        let page = va.page_base();
        self.elements.iter().position(|e| e.va == page)
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.position(va).is_some()
    }

    /// Add a page while the set is below its maximum; returns its index.
    ///
    /// Before the set first fills up pages are appended, and the cursor is
    /// set to the first element once it does. After that pages go right
    /// before the cursor.
    pub(crate) fn place(&mut self, element: WorkingSetElement) -> usize {
        debug_assert!(!self.is_full(), "placement into a full working set");
        match self.cursor {
            None => {
                self.elements.push(element);
                if self.is_full() {
                    self.cursor = Some(0);
                }
                self.elements.len() - 1
            }
            Some(cursor) => {
                self.elements.insert(cursor, element);
                self.cursor = Some(cursor + 1);
                cursor
            }
        }
    }

    /// Append at the tail, keeping the cursor on the same element.
    pub(crate) fn push_back(&mut self, element: WorkingSetElement) {
        self.elements.push(element);
        if self.cursor.is_none() && self.is_full() {
            self.cursor = Some(0);
        }
    }

    pub(crate) fn replace(&mut self, index: usize, element: WorkingSetElement) {
        if let Some(slot) = self.elements.get_mut(index) {
            *slot = element;
        }
    }

    /// Move the cursor to the element after `index`, wrapping around.
    pub(crate) fn advance_past(&mut self, index: usize) {
        if !self.elements.is_empty() {
            self.cursor = Some((index + 1) % self.elements.len());
        }
    }

    /// Remove the element at `index`, keeping the cursor on the element it
    /// pointed at, or on its successor if that element was removed.
    pub fn remove(&mut self, index: usize) -> Option<WorkingSetElement> {
        if index >= self.elements.len() {
            return None;
        }
        let element = self.elements.remove(index);
        self.cursor = match self.cursor {
            _ if self.elements.is_empty() => None,
            Some(c) if c > index => Some(c - 1),
            Some(c) if c >= self.elements.len() => Some(0),
            other => other,
        };
        Some(element)
    }
}
