/// How a victim is chosen when a working set is full.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ReplacementPolicy {
    /// The page at the cursor, in placement order.
    Fifo,
    /// Second chance on the used bit.
    #[default]
    Clock,
    /// Prefer pages that are neither used nor modified.
    ModifiedClock,
    /// A page is evicted after this many sweeps found it unused.
    NChanceClock(u32),
    /// Smallest aging time stamp.
    Lru,
    /// Diagnostic mode that records the reference stream for
    /// [`count_optimal_faults`](crate::count_optimal_faults).
    Optimal,
}

/// Run-time paging configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PagingConfig {
    policy: ReplacementPolicy,
    buffering_enabled: bool,
    modified_buffering_enabled: bool,
    modified_list_max: u32,
}

impl PagingConfig {
    pub const DEFAULT_MODIFIED_LIST_MAX: u32 = 1000;

    /// CLOCK, buffering off.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            policy: ReplacementPolicy::Clock,
            buffering_enabled: false,
            modified_buffering_enabled: false,
            modified_list_max: Self::DEFAULT_MODIFIED_LIST_MAX,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ReplacementPolicy {
        self.policy
    }

    pub const fn set_policy(&mut self, policy: ReplacementPolicy) {
        self.policy = policy;
    }

    pub const fn set_fifo(&mut self) {
        self.policy = ReplacementPolicy::Fifo;
    }

    pub const fn set_clock(&mut self) {
        self.policy = ReplacementPolicy::Clock;
    }

    pub const fn set_modified_clock(&mut self) {
        self.policy = ReplacementPolicy::ModifiedClock;
    }

    pub const fn set_nchance_clock(&mut self, max_sweeps: u32) {
        self.policy = ReplacementPolicy::NChanceClock(max_sweeps);
    }

    pub const fn set_lru(&mut self) {
        self.policy = ReplacementPolicy::Lru;
    }

    pub const fn set_optimal(&mut self) {
        self.policy = ReplacementPolicy::Optimal;
    }

    #[must_use]
    pub const fn is_buffering_enabled(&self) -> bool {
        self.buffering_enabled
    }

    /// Page buffering is accepted but faults are always handled unbuffered.
    pub const fn enable_buffering(&mut self, enable: bool) {
        self.buffering_enabled = enable;
    }

    #[must_use]
    pub const fn is_modified_buffering_enabled(&self) -> bool {
        self.modified_buffering_enabled
    }

    pub const fn enable_modified_buffering(&mut self, enable: bool) {
        self.modified_buffering_enabled = enable;
    }

    #[must_use]
    pub const fn modified_list_max(&self) -> u32 {
        self.modified_list_max
    }

    pub const fn set_modified_list_max(&mut self, length: u32) {
        self.modified_list_max = length;
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self::new()
    }
}
