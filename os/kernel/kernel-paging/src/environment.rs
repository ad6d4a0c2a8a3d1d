use crate::WorkingSet;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_shm::OwnerId;

/// Identity of a user environment (process).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EnvId(pub u32);

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env#{}", self.0)
    }
}

impl From<EnvId> for OwnerId {
    fn from(id: EnvId) -> Self {
        Self(id.0)
    }
}

/// State kept for the OPTIMAL diagnostic policy.
#[derive(Debug, Clone, Default)]
pub(crate) struct OptimalState {
    /// Every faulting page, in order.
    pub(crate) references: Vec<VirtualAddress>,
    /// Pages considered resident; seeded from the working set on first use.
    pub(crate) shadow: Option<Vec<VirtualAddress>>,
}

/// The paging view of one user environment.
#[derive(Debug)]
pub struct Environment<A> {
    pub id: EnvId,
    pub space: A,
    pub working_set: WorkingSet,
    /// Lowest address of the kernel stack; its first page is the guard page.
    pub kernel_stack: Option<VirtualAddress>,
    pub(crate) optimal: OptimalState,
    pub(crate) page_faults: u64,
    pub(crate) table_faults: u64,
}

impl<A> Environment<A> {
    #[must_use]
    pub fn new(id: EnvId, space: A, working_set_max: usize) -> Self {
        Self {
            id,
            space,
            working_set: WorkingSet::new(working_set_max),
            kernel_stack: None,
            optimal: OptimalState::default(),
            page_faults: 0,
            table_faults: 0,
        }
    }

    #[must_use]
    pub const fn with_kernel_stack(mut self, bottom: VirtualAddress) -> Self {
        self.kernel_stack = Some(bottom);
        self
    }

    /// Data faults handled so far.
    #[must_use]
    pub const fn page_faults(&self) -> u64 {
        self.page_faults
    }

    /// Faults that only needed a page table.
    #[must_use]
    pub const fn table_faults(&self) -> u64 {
        self.table_faults
    }

    /// Pages referenced under the OPTIMAL policy, in fault order.
    #[must_use]
    pub fn reference_stream(&self) -> &[VirtualAddress] {
        &self.optimal.references
    }

    /// The OPTIMAL shadow working set.
    #[must_use]
    pub fn shadow_set(&self) -> &[VirtualAddress] {
        self.optimal.shadow.as_deref().unwrap_or_default()
    }
}
