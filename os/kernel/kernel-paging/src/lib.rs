//! # Demand Paging
//!
//! Page-fault handling and page replacement for user environments.
//!
//! ```text
//!                         ┌──────────┐
//!            trap ───────►│ Dispatch │── repeated / overflow / no process ──► Fatal
//!                         └────┬─────┘
//!          ┌───────────────────┼──────────────────────┐
//!          ▼                   ▼                      ▼
//!   ┌─────────────┐    ┌───────────────┐     ┌────────────────┐
//!   │ TableFault  │    │ AccessRights  │     │   DataFault    │
//!   │ create table│    │ checks (user) │     │ place / replace│
//!   └──────┬──────┘    └───────┬───────┘     └───────┬────────┘
//!          ▼                   ▼                     ▼
//!    TableCreated          Terminated        Resolved | Terminated
//! ```
//!
//! The [`FaultHandler`] classifies a fault and hands data faults to the
//! [`replacement`] engine, which keeps each environment's resident pages in a
//! bounded [`WorkingSet`] and moves evicted pages through a [`PageFile`].
//! Which victim is chosen is decided by the [`ReplacementPolicy`] in
//! [`PagingConfig`].
//!
//! ```
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_paging::count_optimal_faults;
//!
//! let [a, b, c, d] = [0x1000, 0x2000, 0x3000, 0x4000].map(VirtualAddress::new);
//! assert_eq!(count_optimal_faults(&[], 2, &[a, b, c, a, d, b]), 5);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod config;
mod environment;
mod fault;
mod page_file;
pub mod replacement;
mod syscalls;
mod user_memory;
mod working_set;

pub use config::{PagingConfig, ReplacementPolicy};
pub use environment::{EnvId, Environment};
pub use fault::{
    CpuState, FatalFault, FaultContext, FaultHandler, FaultResolution, ProcessControl,
    TerminationReason, TrapFrame,
};
pub use page_file::{MemoryPageFile, PageFile, PageFileError};
pub use replacement::{age_working_set, count_optimal_faults};
pub use syscalls::KernelSyscalls;
pub use user_memory::{allocate_user_mem, free_user_mem, is_user_heap_page};
pub use working_set::{WorkingSet, WorkingSetElement};
