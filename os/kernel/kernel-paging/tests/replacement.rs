use kernel_info::memory::USER_PAGE_ALLOC_START;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_paging::{
    CpuState, EnvId, Environment, FaultContext, FaultHandler, FaultResolution, MemoryPageFile,
    PagingConfig, ReplacementPolicy, TerminationReason, TrapFrame, age_working_set,
    allocate_user_mem, count_optimal_faults,
};
use kernel_vmem::{AddressSpace, FrameAllocator, FrameTable, SoftAddressSpace};

const FRAMES: usize = 32;

/// One environment on a machine with a small frame pool, driven access by
/// access the way the MMU would.
struct Machine {
    handler: FaultHandler,
    cpu: CpuState,
    frames: FrameTable,
    file: MemoryPageFile,
    env: Environment<SoftAddressSpace>,
}

impl Machine {
    fn new(policy: ReplacementPolicy, working_set_max: usize) -> Self {
        let mut config = PagingConfig::new();
        config.set_policy(policy);
        let mut env = Environment::new(EnvId(3), SoftAddressSpace::new(), working_set_max);
        allocate_user_mem(&mut env, page(0), 64 * PAGE_SIZE).unwrap();
        Self {
            handler: FaultHandler::new(config),
            cpu: CpuState {
                scheduler_stack: VirtualAddress::new(0xF100_0000),
            },
            frames: FrameTable::new(PhysicalAddress::new(0x20_0000), FRAMES),
            file: MemoryPageFile::new(64),
            env,
        }
    }

    /// Access `page(n)`, faulting it in if needed.
    fn access(&mut self, n: u64, write: bool) -> Result<(), TerminationReason> {
        let va = page(n);
        for _ in 0..2 {
            if self.env.space.touch(va, write) {
                return Ok(());
            }
            let ctx = FaultContext {
                env: Some(&mut self.env),
                cpu: &self.cpu,
                frames: &mut self.frames,
                page_file: &mut self.file,
            };
            match self.handler.handle(ctx, &TrapFrame::missing(va, 0x1000, true, write)) {
                Ok(FaultResolution::Terminated(reason)) => return Err(reason),
                Ok(_) => {}
                Err(fatal) => panic!("{fatal}"),
            }
        }
        panic!("{va} still faults after it was resolved");
    }

    fn read(&mut self, n: u64) -> u8 {
        self.access(n, false).unwrap();
        let frame = self.env.space.frame(page(n)).unwrap();
        self.frames.frame_bytes(frame).unwrap()[7]
    }

    fn write(&mut self, n: u64, value: u8) {
        self.access(n, true).unwrap();
        let frame = self.env.space.frame(page(n)).unwrap();
        self.frames.frame_bytes_mut(frame).unwrap()[7] = value;
    }

    fn resident(&self) -> Vec<u64> {
        self.env.working_set.addresses().map(number).collect()
    }

    fn assert_consistent(&self) {
        let mut mapped: Vec<u64> = self.env.space.mapped_pages().map(number).collect();
        let mut resident = self.resident();
        mapped.sort_unstable();
        resident.sort_unstable();
        assert_eq!(mapped, resident);
        assert!(resident.len() <= self.env.working_set.max());
        assert_eq!(self.frames.free_frames(), FRAMES - resident.len());
    }
}

fn page(n: u64) -> VirtualAddress {
    VirtualAddress::new(USER_PAGE_ALLOC_START + n * PAGE_SIZE)
}

fn number(va: VirtualAddress) -> u64 {
    (va.as_u64() - USER_PAGE_ALLOC_START) / PAGE_SIZE
}

#[test]
fn every_policy_respects_the_working_set_bound() {
    let policies = [
        ReplacementPolicy::Fifo,
        ReplacementPolicy::Clock,
        ReplacementPolicy::ModifiedClock,
        ReplacementPolicy::NChanceClock(2),
        ReplacementPolicy::Lru,
    ];
    for policy in policies {
        let mut m = Machine::new(policy, 4);
        let mut seed = 0x2545_f491_u32;
        for step in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let n = u64::from(seed % 10);
            m.access(n, seed & 1 == 1).unwrap();
            if step % 16 == 0 {
                age_working_set(&mut m.env);
            }
            m.assert_consistent();
        }
        assert!(m.env.page_faults() > 10, "{policy:?}");
    }
}

#[test]
fn evicted_pages_come_back_with_their_content() {
    for policy in [ReplacementPolicy::Fifo, ReplacementPolicy::ModifiedClock, ReplacementPolicy::Lru] {
        let mut m = Machine::new(policy, 3);
        for n in 0..8 {
            m.write(n, 0x40 + n as u8);
        }
        for n in 0..8 {
            assert_eq!(m.read(n), 0x40 + n as u8, "{policy:?} page {n}");
        }
        m.assert_consistent();
    }
}

#[test]
fn clean_pages_are_not_written_back() {
    let mut m = Machine::new(ReplacementPolicy::Fifo, 2);
    for n in 0..6 {
        m.access(n, false).unwrap();
    }
    assert_eq!(m.file.writes(), 0);
    assert!(m.file.is_empty());
    // never written, so they come back zeroed
    assert_eq!(m.read(0), 0);
}

#[test]
fn fifo_evicts_in_arrival_order() {
    let mut m = Machine::new(ReplacementPolicy::Fifo, 3);
    for n in 0..3 {
        m.access(n, false).unwrap();
    }
    assert_eq!(m.env.working_set.cursor(), Some(0));

    m.access(0, false).unwrap();
    m.access(3, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 2]);
    m.access(4, false).unwrap();
    assert_eq!(m.resident(), [3, 4, 2]);
    assert_eq!(m.env.working_set.cursor(), Some(2));
}

#[test]
fn clock_gives_used_pages_a_second_chance() {
    let mut m = Machine::new(ReplacementPolicy::Clock, 3);
    for n in 0..3 {
        m.access(n, false).unwrap();
    }

    // every page is used: one ring clears them all and the cursor page goes
    m.access(3, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 2]);
    assert!(!m.env.space.permissions(page(1)).used());

    m.access(1, false).unwrap();
    m.access(4, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 4]);
}

#[test]
fn modified_clock_writes_back_during_the_second_pass() {
    let mut m = Machine::new(ReplacementPolicy::ModifiedClock, 3);
    m.write(0, 9);
    m.access(1, false).unwrap();
    m.access(2, true).unwrap();

    m.access(3, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 2]);
    assert_eq!(m.file.stored(m.env.id, page(0)).unwrap()[7], 9);
    assert!(m.file.stored(m.env.id, page(2)).is_some());
    assert!(!m.env.space.permissions(page(2)).modified());
    assert_eq!(m.file.writes(), 2);
}

#[test]
fn modified_clock_prefers_unused_clean_pages() {
    let mut m = Machine::new(ReplacementPolicy::ModifiedClock, 3);
    m.write(0, 1);
    m.access(1, false).unwrap();
    m.access(2, true).unwrap();
    m.access(3, false).unwrap();

    // the sweep starts at 1, which was used again; 2 is unused and clean
    m.access(1, false).unwrap();
    m.access(0, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 0]);
    assert_eq!(m.read(0), 1);
    assert_eq!(m.file.writes(), 2);
}

#[test]
fn nchance_clock_waits_n_sweeps() {
    let mut m = Machine::new(ReplacementPolicy::NChanceClock(2), 3);
    for n in 0..3 {
        m.access(n, false).unwrap();
    }

    m.access(3, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 2]);
    assert_eq!(m.env.working_set.get(1).unwrap().sweeps_counter, 1);

    m.access(1, false).unwrap();
    m.access(4, false).unwrap();
    assert_eq!(m.resident(), [3, 1, 4]);
    assert_eq!(m.env.working_set.get(1).unwrap().sweeps_counter, 0);
}

#[test]
fn lru_evicts_the_oldest_time_stamp() {
    let mut m = Machine::new(ReplacementPolicy::Lru, 3);
    for n in 0..3 {
        m.access(n, false).unwrap();
    }
    age_working_set(&mut m.env);
    m.access(0, false).unwrap();
    m.access(2, false).unwrap();
    age_working_set(&mut m.env);

    m.access(3, false).unwrap();
    assert_eq!(m.resident(), [0, 2, 3]);
    assert_eq!(m.env.working_set.get(2).unwrap().time_stamp, u32::MAX);
}

#[test]
fn optimal_records_references_and_toggles_presence() {
    let mut m = Machine::new(ReplacementPolicy::Optimal, 2);
    let pages = [0, 1, 2, 0, 3, 1];
    for n in pages {
        m.access(n, false).unwrap();
    }

    let expected: Vec<_> = pages.iter().map(|&n| page(n)).collect();
    assert_eq!(m.env.reference_stream(), expected.as_slice());
    assert_eq!(m.env.shadow_set(), [page(3), page(1)]);
    assert_eq!(count_optimal_faults(&[], 2, m.env.reference_stream()), 5);

    // pages outside the shadow set stay mapped but not present
    assert!(!m.env.space.permissions(page(0)).present());
    assert!(m.env.space.frame(page(0)).is_some());
    assert!(m.env.working_set.is_empty());
}

#[test]
fn a_full_page_file_terminates() {
    let mut m = Machine::new(ReplacementPolicy::Fifo, 1);
    m.file = MemoryPageFile::new(1);
    m.write(0, 1);
    m.write(1, 2);
    assert_eq!(
        m.access(2, false),
        Err(TerminationReason::PageFileFull(page(1)))
    );
}

#[test]
fn running_out_of_frames_terminates() {
    let mut m = Machine::new(ReplacementPolicy::Clock, 8);
    m.frames = FrameTable::new(PhysicalAddress::new(0x20_0000), 2);
    m.access(0, false).unwrap();
    m.access(1, false).unwrap();
    assert_eq!(m.access(2, false), Err(TerminationReason::OutOfMemory(page(2))));
    assert_eq!(m.resident(), [0, 1]);
}
