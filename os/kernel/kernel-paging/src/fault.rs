use crate::replacement;
use crate::{EnvId, Environment, PageFile, PagingConfig, is_user_heap_page};
use kernel_info::memory::{KERNEL_HEAP_MAX, USER_TOP, USTACKTOP};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAllocator, PageFaultError};

/// What the CPU reports for a page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TrapFrame {
    /// The faulting address (CR2).
    pub fault_va: VirtualAddress,
    /// The faulting instruction.
    pub eip: u64,
    pub error: PageFaultError,
}

impl TrapFrame {
    #[must_use]
    pub const fn new(fault_va: VirtualAddress, eip: u64, error: PageFaultError) -> Self {
        Self { fault_va, eip, error }
    }

    /// A fault on a non-present page.
    #[must_use]
    pub const fn missing(fault_va: VirtualAddress, eip: u64, user: bool, write: bool) -> Self {
        Self::new(
            fault_va,
            eip,
            PageFaultError::new().with_user(user).with_write(write),
        )
    }
}

/// Per-CPU state the handler inspects.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CpuState {
    /// Lowest address of the scheduler stack; its first page is the guard page.
    pub scheduler_stack: VirtualAddress,
}

/// Why an environment had to be terminated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TerminationReason {
    #[error("user stack underflow at {0}")]
    StackUnderflow(VirtualAddress),
    #[error("access to kernel page {0}")]
    KernelPage(VirtualAddress),
    #[error("access to unreserved heap page {0}")]
    UnmarkedHeapPage(VirtualAddress),
    #[error("write to read-only page {0}")]
    ReadOnlyPage(VirtualAddress),
    #[error("page {0} has no content to restore")]
    MissingPage(VirtualAddress),
    #[error("no memory for page {0}")]
    OutOfMemory(VirtualAddress),
    #[error("page file full evicting {0}")]
    PageFileFull(VirtualAddress),
}

/// Faults the kernel cannot recover from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FatalFault {
    #[error("fault at {va} from eip {eip:#x} repeated three times")]
    RepeatedFault { va: VirtualAddress, eip: u64 },
    #[error("kernel stack overflow at {0}")]
    KernelStackOverflow(VirtualAddress),
    #[error("scheduler stack overflow at {0}")]
    SchedulerStackOverflow(VirtualAddress),
    #[error("kernel heap overflow at {0}")]
    KernelHeapOverflow(VirtualAddress),
    #[error("page fault at {0} with no current environment")]
    NoCurrentProcess(VirtualAddress),
    #[error("page {0} is present: access rights violation")]
    AccessRightsViolation(VirtualAddress),
}

/// Outcome of a recoverable fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// The page is resident; retry the access.
    Resolved,
    /// A page table was created; retry the access.
    TableCreated,
    /// The faulting environment must exit.
    Terminated(TerminationReason),
}

/// Ends environments on behalf of the fault handler.
pub trait ProcessControl {
    fn exit(&mut self, env: EnvId, reason: TerminationReason);
}

/// Everything a fault is handled against.
pub struct FaultContext<'a, A, F: ?Sized, P: ?Sized> {
    /// The environment running on this CPU, if any.
    pub env: Option<&'a mut Environment<A>>,
    pub cpu: &'a CpuState,
    pub frames: &'a mut F,
    pub page_file: &'a mut P,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct FaultRecord {
    va: VirtualAddress,
    eip: u64,
    env: Option<EnvId>,
}

/// The page-fault dispatcher.
#[derive(Debug, Clone)]
pub struct FaultHandler {
    config: PagingConfig,
    last: Option<FaultRecord>,
    before_last: Option<FaultRecord>,
    repeats: u8,
    buffering_warned: bool,
}

impl FaultHandler {
    /// Identical consecutive faults tolerated before giving up.
    pub const MAX_REPEATS: u8 = 3;

    #[must_use]
    pub const fn new(config: PagingConfig) -> Self {
        Self {
            config,
            last: None,
            before_last: None,
            repeats: 0,
            buffering_warned: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PagingConfig {
        &self.config
    }

    pub const fn config_mut(&mut self) -> &mut PagingConfig {
        &mut self.config
    }

    /// Classify and resolve a page fault.
    ///
    /// # Errors
    /// A [`FatalFault`] when the kernel itself is at fault or the same fault
    /// keeps repeating.
    pub fn handle<A, F, P>(
        &mut self,
        ctx: FaultContext<'_, A, F, P>,
        frame: &TrapFrame,
    ) -> Result<FaultResolution, FatalFault>
    where
        A: AddressSpace,
        F: FrameAllocator + ?Sized,
        P: PageFile + ?Sized,
    {
        let va = frame.fault_va;
        let user = frame.error.user();
        self.check_repeated(frame, ctx.env.as_ref().map(|e| e.id))?;

        if user {
            if va.is_within(USTACKTOP, USER_TOP) {
                return Ok(FaultResolution::Terminated(
                    TerminationReason::StackUnderflow(va),
                ));
            }
        } else {
            if let Some(bottom) = ctx.env.as_ref().and_then(|e| e.kernel_stack)
                && in_guard_page(va, bottom)
            {
                return Err(FatalFault::KernelStackOverflow(va));
            }
            if in_guard_page(va, ctx.cpu.scheduler_stack) {
                return Err(FatalFault::SchedulerStackOverflow(va));
            }
            if va.as_u64() >= KERNEL_HEAP_MAX {
                return Err(FatalFault::KernelHeapOverflow(va));
            }
        }

        let env = ctx.env.ok_or(FatalFault::NoCurrentProcess(va))?;

        if !env.space.table_present(va) {
            env.table_faults += 1;
            if let Err(e) = env.space.create_table(va) {
                log::error!("{:?}: no page table for {va}: {e}", env.id);
                return Ok(FaultResolution::Terminated(TerminationReason::OutOfMemory(va)));
            }
            env.space.flush_tlb();
            return Ok(FaultResolution::TableCreated);
        }

        let permissions = env.space.permissions(va);
        if user {
            if permissions.present() && !permissions.user() {
                return Ok(FaultResolution::Terminated(TerminationReason::KernelPage(va)));
            }
            if is_user_heap_page(va) && !permissions.heap_page() {
                return Ok(FaultResolution::Terminated(
                    TerminationReason::UnmarkedHeapPage(va),
                ));
            }
            if permissions.present() && !permissions.writable() && frame.error.write() {
                return Ok(FaultResolution::Terminated(TerminationReason::ReadOnlyPage(va)));
            }
        }
        if permissions.present() {
            return Err(FatalFault::AccessRightsViolation(va));
        }

        env.page_faults += 1;
        if self.config.is_buffering_enabled() && !self.buffering_warned {
            log::warn!("page buffering is not supported; handling faults unbuffered");
            self.buffering_warned = true;
        }

        let result = replacement::resolve(env, ctx.frames, ctx.page_file, self.config.policy(), va);
        env.space.flush_tlb();
        Ok(result.map_or_else(FaultResolution::Terminated, |()| FaultResolution::Resolved))
    }

    /// Trap entry: handle the fault, exit the environment if it has to go
    /// and halt the kernel on a fatal fault.
    ///
    /// # Panics
    /// On any [`FatalFault`].
    pub fn trap<A, F, P, C>(
        &mut self,
        ctx: FaultContext<'_, A, F, P>,
        frame: &TrapFrame,
        control: &mut C,
    ) -> FaultResolution
    where
        A: AddressSpace,
        F: FrameAllocator + ?Sized,
        P: PageFile + ?Sized,
        C: ProcessControl + ?Sized,
    {
        let env = ctx.env.as_ref().map(|e| e.id);
        match self.handle(ctx, frame) {
            Ok(FaultResolution::Terminated(reason)) => {
                log::error!("{env:?} terminated: {reason}");
                if let Some(env) = env {
                    control.exit(env, reason);
                }
                FaultResolution::Terminated(reason)
            }
            Ok(resolution) => resolution,
            Err(fatal) => {
                log::error!("fatal page fault: {fatal} ({})", frame.error.explain());
                panic!("{fatal}");
            }
        }
    }

    /// Three identical (address, environment) faults in a row are fatal.
    fn check_repeated(&mut self, frame: &TrapFrame, env: Option<EnvId>) -> Result<(), FatalFault> {
        let current = FaultRecord {
            va: frame.fault_va,
            eip: frame.eip,
            env,
        };
        if self
            .last
            .is_some_and(|last| last.va == current.va && last.env == current.env)
        {
            self.repeats += 1;
            if self.repeats >= Self::MAX_REPEATS {
                if let Some(first) = self.before_last {
                    log::error!("fault streak started after {} from eip {:#x}", first.va, first.eip);
                }
                self.repeats = 0;
                self.last = None;
                return Err(FatalFault::RepeatedFault {
                    va: current.va,
                    eip: current.eip,
                });
            }
        } else {
            self.before_last = self.last;
            self.repeats = 1;
        }
        self.last = Some(current);
        Ok(())
    }
}

impl Default for FaultHandler {
    fn default() -> Self {
        Self::new(PagingConfig::new())
    }
}

fn in_guard_page(va: VirtualAddress, bottom: VirtualAddress) -> bool {
    va.is_within(bottom.as_u64(), bottom.as_u64() + PAGE_SIZE)
}

