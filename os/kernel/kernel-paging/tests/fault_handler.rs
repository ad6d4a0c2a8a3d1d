use kernel_info::memory::{
    KERNEL_BASE, KERNEL_HEAP_MAX, KERNEL_STACK_SIZE, USER_PAGE_ALLOC_START, USER_TOP, USTACKTOP,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_paging::{
    CpuState, EnvId, Environment, FatalFault, FaultContext, FaultHandler, FaultResolution,
    MemoryPageFile, PagingConfig, ProcessControl, TerminationReason, TrapFrame, allocate_user_mem,
};
use kernel_vmem::{
    AddressSpace, FrameAllocator, FrameTable, PageFaultError, PagePermissions, SoftAddressSpace, allocate_and_map,
};

const EIP: u64 = 0x0080_0040;
const KERNEL_STACK: u64 = KERNEL_BASE + 0x0100_0000;
const SCHEDULER_STACK: u64 = KERNEL_BASE + 0x0200_0000;

type Env = Environment<SoftAddressSpace>;

struct Kernel {
    handler: FaultHandler,
    cpu: CpuState,
    frames: FrameTable,
    file: MemoryPageFile,
}

impl Kernel {
    fn new() -> Self {
        Self {
            handler: FaultHandler::new(PagingConfig::new()),
            cpu: CpuState {
                scheduler_stack: VirtualAddress::new(SCHEDULER_STACK),
            },
            frames: FrameTable::new(PhysicalAddress::new(0x10_0000), 16),
            file: MemoryPageFile::new(16),
        }
    }

    fn handle(&mut self, env: Option<&mut Env>, tf: TrapFrame) -> Result<FaultResolution, FatalFault> {
        let ctx = FaultContext {
            env,
            cpu: &self.cpu,
            frames: &mut self.frames,
            page_file: &mut self.file,
        };
        self.handler.handle(ctx, &tf)
    }

    fn trap(&mut self, env: Option<&mut Env>, tf: TrapFrame, control: &mut Exits) -> FaultResolution {
        let ctx = FaultContext {
            env,
            cpu: &self.cpu,
            frames: &mut self.frames,
            page_file: &mut self.file,
        };
        self.handler.trap(ctx, &tf, control)
    }
}

#[derive(Default)]
struct Exits(Vec<(EnvId, TerminationReason)>);

impl ProcessControl for Exits {
    fn exit(&mut self, env: EnvId, reason: TerminationReason) {
        self.0.push((env, reason));
    }
}

fn env() -> Env {
    Environment::new(EnvId(1), SoftAddressSpace::new(), 4)
        .with_kernel_stack(VirtualAddress::new(KERNEL_STACK))
}

fn user(va: u64, write: bool) -> TrapFrame {
    TrapFrame::missing(VirtualAddress::new(va), EIP, true, write)
}

fn kernel(va: u64) -> TrapFrame {
    TrapFrame::missing(VirtualAddress::new(va), EIP, false, false)
}

#[test]
fn a_missing_table_is_created_before_the_page() {
    let mut k = Kernel::new();
    let mut env = env();
    let va = USTACKTOP - 0x10;

    assert_eq!(k.handle(Some(&mut env), user(va, true)), Ok(FaultResolution::TableCreated));
    assert_eq!((env.table_faults(), env.page_faults()), (1, 0));
    assert!(!env.space.touch(VirtualAddress::new(va), true));

    assert_eq!(k.handle(Some(&mut env), user(va, true)), Ok(FaultResolution::Resolved));
    assert_eq!((env.table_faults(), env.page_faults()), (1, 1));
    assert!(env.space.touch(VirtualAddress::new(va), true));
    assert!(env.working_set.contains(VirtualAddress::new(va)));
    assert_eq!(env.space.tlb_flushes(), 2);
}

#[test]
fn the_third_identical_fault_is_fatal() {
    let mut k = Kernel::new();
    let a = 0x0080_0000;
    let b = 0x0080_1000;
    let no_process = |va: u64| -> Result<FaultResolution, FatalFault> {
        Err(FatalFault::NoCurrentProcess(VirtualAddress::new(va)))
    };

    assert_eq!(k.handle(None, kernel(a)), no_process(a));
    assert_eq!(k.handle(None, kernel(a)), no_process(a));
    assert_eq!(k.handle(None, kernel(b)), no_process(b));
    assert_eq!(k.handle(None, kernel(a)), no_process(a));
    assert_eq!(k.handle(None, kernel(a)), no_process(a));
    assert_eq!(
        k.handle(None, kernel(a)),
        Err(FatalFault::RepeatedFault {
            va: VirtualAddress::new(a),
            eip: EIP,
        })
    );
}

#[test]
fn the_same_address_in_another_environment_is_not_a_repeat() {
    let mut k = Kernel::new();
    let mut first = env();
    let mut second = Environment::new(EnvId(2), SoftAddressSpace::new(), 4);
    let va = USTACKTOP - PAGE_SIZE;

    let created = Ok(FaultResolution::TableCreated);
    let resolved = Ok(FaultResolution::Resolved);
    assert_eq!(k.handle(Some(&mut first), user(va, false)), created);
    assert_eq!(k.handle(Some(&mut second), user(va, false)), created);
    assert_eq!(k.handle(Some(&mut first), user(va, false)), resolved);
    assert_eq!(k.handle(Some(&mut second), user(va, false)), resolved);
}

#[test]
fn kernel_guard_pages_and_heap_overflow_are_fatal() {
    let mut env = env();
    let stack_guard = KERNEL_STACK + 0x20;
    let scheduler_guard = SCHEDULER_STACK + PAGE_SIZE - 1;

    assert_eq!(
        Kernel::new().handle(Some(&mut env), kernel(stack_guard)),
        Err(FatalFault::KernelStackOverflow(VirtualAddress::new(stack_guard)))
    );
    assert_eq!(
        Kernel::new().handle(Some(&mut env), kernel(scheduler_guard)),
        Err(FatalFault::SchedulerStackOverflow(VirtualAddress::new(scheduler_guard)))
    );
    assert_eq!(
        Kernel::new().handle(Some(&mut env), kernel(KERNEL_HEAP_MAX)),
        Err(FatalFault::KernelHeapOverflow(VirtualAddress::new(KERNEL_HEAP_MAX)))
    );

    // above the guard page the stack is ordinary memory
    let in_stack = KERNEL_STACK + KERNEL_STACK_SIZE - 8;
    assert_eq!(
        Kernel::new().handle(Some(&mut env), kernel(in_stack)),
        Ok(FaultResolution::TableCreated)
    );
}

#[test]
fn user_stack_underflow_terminates() {
    let mut k = Kernel::new();
    let mut env = env();
    for va in [USTACKTOP, USER_TOP - 1] {
        assert_eq!(
            k.handle(Some(&mut env), user(va, false)),
            Ok(FaultResolution::Terminated(TerminationReason::StackUnderflow(
                VirtualAddress::new(va)
            )))
        );
    }
    assert_eq!(env.page_faults(), 0);
}

#[test]
fn protection_violations_terminate_user_faults() {
    let mut k = Kernel::new();
    let mut env = env();
    let kernel_page = VirtualAddress::new(0x0040_0000);
    let read_only = VirtualAddress::new(0x0040_1000);
    let unmarked = VirtualAddress::new(USER_PAGE_ALLOC_START);

    allocate_and_map(&mut env.space, &mut k.frames, kernel_page, PagePermissions::WRITABLE).unwrap();
    allocate_and_map(&mut env.space, &mut k.frames, read_only, PagePermissions::USER).unwrap();
    env.space.create_table(unmarked).unwrap();

    let terminated = |reason| -> Result<FaultResolution, FatalFault> {
        Ok(FaultResolution::Terminated(reason))
    };
    assert_eq!(
        k.handle(Some(&mut env), user(kernel_page.as_u64(), false)),
        terminated(TerminationReason::KernelPage(kernel_page))
    );
    assert_eq!(
        k.handle(Some(&mut env), user(read_only.as_u64(), true)),
        terminated(TerminationReason::ReadOnlyPage(read_only))
    );
    assert_eq!(
        k.handle(Some(&mut env), user(unmarked.as_u64(), false)),
        terminated(TerminationReason::UnmarkedHeapPage(unmarked))
    );

    // a read fault on a present page has no legitimate cause
    assert_eq!(
        k.handle(Some(&mut env), user(read_only.as_u64() + 8, false)),
        Err(FatalFault::AccessRightsViolation(read_only + 8))
    );
}

#[test]
fn reserved_heap_pages_fault_in_zeroed() {
    let mut k = Kernel::new();
    let mut env = env();
    let va = VirtualAddress::new(USER_PAGE_ALLOC_START + 3 * PAGE_SIZE + 5);
    allocate_user_mem(&mut env, va.page_base(), PAGE_SIZE).unwrap();

    assert_eq!(k.handle(Some(&mut env), user(va.as_u64(), true)), Ok(FaultResolution::Resolved));
    let permissions = env.space.permissions(va);
    assert!(permissions.present() && permissions.user() && permissions.writable());
    assert!(permissions.heap_page());
}

#[test]
fn code_pages_need_page_file_content() {
    let mut k = Kernel::new();
    let mut env = env();
    let va = VirtualAddress::new(0x0080_0000);
    env.space.create_table(va).unwrap();

    assert_eq!(
        k.handle(Some(&mut env), user(va.as_u64(), false)),
        Ok(FaultResolution::Terminated(TerminationReason::MissingPage(va)))
    );
    assert_eq!(env.space.frame(va), None);
    assert!(env.working_set.is_empty());
    assert_eq!(k.frames.free_frames(), 16);
}

#[test]
fn buffering_falls_back_to_the_unbuffered_path() {
    let mut k = Kernel::new();
    k.handler.config_mut().enable_buffering(true);
    let mut env = env();
    let va = USTACKTOP - PAGE_SIZE;

    k.handle(Some(&mut env), user(va, true)).unwrap();
    assert_eq!(k.handle(Some(&mut env), user(va, true)), Ok(FaultResolution::Resolved));
}

#[test]
fn trap_exits_terminated_environments() {
    let mut k = Kernel::new();
    let mut env = env();
    let mut exits = Exits::default();

    let resolution = k.trap(Some(&mut env), user(USTACKTOP, false), &mut exits);
    let reason = TerminationReason::StackUnderflow(VirtualAddress::new(USTACKTOP));
    assert_eq!(resolution, FaultResolution::Terminated(reason));
    assert_eq!(exits.0, vec![(EnvId(1), reason)]);

    let resolution = k.trap(Some(&mut env), user(USTACKTOP - 8, false), &mut exits);
    assert_eq!(resolution, FaultResolution::TableCreated);
    assert_eq!(exits.0.len(), 1);
}

#[test]
#[should_panic(expected = "no current environment")]
fn trap_halts_on_fatal_faults() {
    let mut k = Kernel::new();
    k.trap(None, kernel(0x0080_0000), &mut Exits::default());
}

#[test]
fn error_codes_reach_the_handler_unchanged() {
    let mut k = Kernel::new();
    let mut env = env();
    let va = VirtualAddress::new(USTACKTOP - PAGE_SIZE);
    let error = PageFaultError::from_bits(0b110);
    assert!(error.user() && error.write());

    let tf = TrapFrame::new(va, EIP, error);
    assert_eq!(k.handle(Some(&mut env), tf), Ok(FaultResolution::TableCreated));
}
