//! # Page Replacement
//!
//! Resolves a data fault by bringing the page in, evicting at most one
//! resident page when the working set is full.
//!
//! ```text
//!   working set (max 4), cursor ─┐
//!                                ▼
//!   ┌─────────┬─────────┬─────────┬─────────┐
//!   │ 0x80000 │ 0x80001 │ 0x80002 │ 0x80003 │   sweep: 2 → 3 → 0 → 1
//!   └─────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! The clock policies sweep from the cursor and the new page takes the
//! victim's slot, leaving the cursor just past it. LRU removes its victim and
//! appends the new page at the tail.
//!
//! A new page is zero-filled and then restored from the [`PageFile`]. A page
//! the file has never seen is only acceptable in the user heap or the user
//! stack; anywhere else the environment is terminated.

use crate::{
    Environment, PageFile, PageFileError, ReplacementPolicy, TerminationReason, WorkingSetElement,
};
use alloc::vec::Vec;
use kernel_info::memory::{USER_HEAP_MAX, USER_HEAP_START, USTACKBOTTOM, USTACKTOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, FrameAllocator, PagePermissions, allocate_and_map, unmap_frame};

/// Sweeps of Modified-CLOCK: unused and clean, unused, then unused and clean again.
const MODIFIED_CLOCK_RINGS: usize = 3;

/// Permissions of a page brought in on a fault. The retried access counts as a use.
const FAULTED_PAGE: PagePermissions = PagePermissions::new()
    .with_user(true)
    .with_writable(true)
    .with_used(true);

/// Make the page holding `fault_va` resident for `env`.
///
/// # Errors
/// The reason to terminate the environment, if the page cannot be provided.
pub fn resolve<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    policy: ReplacementPolicy,
    fault_va: VirtualAddress,
) -> Result<(), TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    let va = fault_va.page_base();
    if policy == ReplacementPolicy::Optimal {
        return optimal_fault(env, frames, page_file, va);
    }

    if !env.working_set.is_full() {
        bring_in(env, frames, page_file, va)?;
        let index = env.working_set.place(WorkingSetElement::new(va));
        log::trace!("{:?}: placed {va} at {index}", env.id);
        return Ok(());
    }

    let victim = select_victim(env, frames, page_file, policy)?;
    let Some(victim_va) = env.working_set.get(victim).map(|e| e.va) else {
        return Err(TerminationReason::OutOfMemory(va));
    };
    evict(env, frames, page_file, victim_va)?;
    if let Err(reason) = bring_in(env, frames, page_file, va) {
        env.working_set.remove(victim);
        return Err(reason);
    }

    if policy == ReplacementPolicy::Lru {
        env.working_set.remove(victim);
        env.working_set.push_back(WorkingSetElement::new(va));
    } else {
        env.working_set.replace(victim, WorkingSetElement::new(va));
        env.working_set.advance_past(victim);
    }
    log::debug!("{:?}: {policy:?} evicted {victim_va} for {va}", env.id);
    Ok(())
}

/// Timer-tick aging for LRU: shift each time stamp right, feed the used bit
/// in at the top, then clear the used bit.
pub fn age_working_set<A: AddressSpace>(env: &mut Environment<A>) {
    let space = &mut env.space;
    for element in env.working_set.iter_mut() {
        let used = space.permissions(element.va).used();
        element.time_stamp = (element.time_stamp >> 1) | (u32::from(used) << 31);
        if used {
            clear_bits(space, element.va, PagePermissions::USED);
        }
    }
}

/// Faults an OPTIMAL replacement would take on `references`, starting with
/// `initial` resident and at most `max` pages resident.
///
/// The page whose next use is furthest away is replaced; a page never used
/// again is as far away as it gets. Ties go to the page found first.
#[must_use]
pub fn count_optimal_faults(
    initial: &[VirtualAddress],
    max: usize,
    references: &[VirtualAddress],
) -> usize {
    let mut resident: Vec<VirtualAddress> = initial.iter().map(|va| va.page_base()).collect();
    let mut faults = 0;

    for (i, reference) in references.iter().enumerate() {
        let page = reference.page_base();
        if resident.contains(&page) {
            continue;
        }
        faults += 1;
        if resident.len() < max {
            resident.push(page);
            continue;
        }

        let future = &references[i + 1..];
        let mut victim: Option<(usize, usize)> = None;
        for (index, candidate) in resident.iter().enumerate() {
            let distance = future
                .iter()
                .position(|f| f.page_base() == *candidate)
                .unwrap_or(usize::MAX);
            if victim.is_none_or(|(_, furthest)| distance > furthest) {
                victim = Some((index, distance));
            }
            if distance == usize::MAX {
                break;
            }
        }
        if let Some((index, _)) = victim {
            resident.remove(index);
            resident.push(page);
        }
    }
    faults
}

/// Whether a page missing from the page file may start out zeroed.
#[must_use]
pub const fn is_demand_zero(va: VirtualAddress) -> bool {
    va.is_within(USER_HEAP_START, USER_HEAP_MAX) || va.is_within(USTACKBOTTOM, USTACKTOP)
}

fn select_victim<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    policy: ReplacementPolicy,
) -> Result<usize, TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    let start = env.working_set.cursor().unwrap_or(0);
    Ok(match policy {
        ReplacementPolicy::Fifo | ReplacementPolicy::Optimal => start,
        ReplacementPolicy::Clock => clock_victim(env, start),
        ReplacementPolicy::ModifiedClock => modified_clock_victim(env, frames, page_file, start)?,
        ReplacementPolicy::NChanceClock(n) => nchance_victim(env, start, n),
        ReplacementPolicy::Lru => lru_victim(env),
    })
}

/// One ring: clear the used bit of used pages, stop at the first unused one.
/// If every page was used, all bits are now clear and `start` is the victim.
fn clock_victim<A: AddressSpace>(env: &mut Environment<A>, start: usize) -> usize {
    let len = env.working_set.len();
    for step in 0..len {
        let index = (start + step) % len;
        let Some(va) = env.working_set.get(index).map(|e| e.va) else {
            break;
        };
        if !env.space.permissions(va).used() {
            return index;
        }
        clear_bits(&mut env.space, va, PagePermissions::USED);
    }
    start
}

fn modified_clock_victim<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    start: usize,
) -> Result<usize, TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    let len = env.working_set.len();
    for ring in 0..MODIFIED_CLOCK_RINGS {
        let second_pass = ring % 2 == 1;
        for step in 0..len {
            let index = (start + step) % len;
            let Some(va) = env.working_set.get(index).map(|e| e.va) else {
                break;
            };
            let permissions = env.space.permissions(va);
            if !second_pass {
                if !permissions.used() && !permissions.modified() {
                    return Ok(index);
                }
                continue;
            }

            if permissions.modified() {
                write_back(env, frames, page_file, va)?;
            }
            if !permissions.used() {
                return Ok(index);
            }
            clear_bits(&mut env.space, va, PagePermissions::USED);
        }
    }
    log::warn!("{:?}: modified clock found no victim, using the cursor", env.id);
    Ok(start)
}

/// A used page gets its bit and sweep count reset; an unused one is evicted
/// on the `n`th sweep that finds it unused.
fn nchance_victim<A: AddressSpace>(env: &mut Environment<A>, start: usize, n: u32) -> usize {
    let n = n.max(1);
    let len = env.working_set.len();
    let rings = usize::try_from(n).unwrap_or(usize::MAX).saturating_add(1);
    for step in 0..len.saturating_mul(rings) {
        let index = (start + step) % len;
        let Some(element) = env.working_set.get_mut(index) else {
            break;
        };
        if env.space.permissions(element.va).used() {
            element.sweeps_counter = 0;
            clear_bits(&mut env.space, element.va, PagePermissions::USED);
            continue;
        }
        element.sweeps_counter += 1;
        if element.sweeps_counter >= n {
            element.sweeps_counter = 0;
            return index;
        }
    }
    start
}

fn lru_victim<A>(env: &Environment<A>) -> usize {
    env.working_set
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| e.time_stamp)
        .map_or(0, |(index, _)| index)
}

/// OPTIMAL keeps pages mapped and only toggles their present bit, recording
/// every reference for offline analysis.
fn optimal_fault<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    va: VirtualAddress,
) -> Result<(), TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    if env.optimal.shadow.is_none() {
        env.optimal.shadow = Some(env.working_set.addresses().collect());
    }

    if env.space.frame(va).is_none() {
        bring_in(env, frames, page_file, va)?;
    } else if let Err(e) = env
        .space
        .set_permissions(va, PagePermissions::PRESENT, PagePermissions::NONE)
    {
        log::warn!("{:?}: cannot mark {va} present: {e}", env.id);
    }

    let max = env.working_set.max();
    let shadow = env.optimal.shadow.get_or_insert_default();
    if !shadow.contains(&va) {
        if shadow.len() >= max {
            for page in shadow.drain(..) {
                clear_bits(&mut env.space, page, PagePermissions::PRESENT);
            }
        }
        shadow.push(va);
    }
    env.optimal.references.push(va);
    Ok(())
}

/// Write a resident page to the page file and clear its modified bit.
fn write_back<A, F, P>(
    env: &mut Environment<A>,
    frames: &F,
    page_file: &mut P,
    va: VirtualAddress,
) -> Result<(), TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    let Some(bytes) = env.space.frame(va).and_then(|frame| frames.frame_bytes(frame)) else {
        log::warn!("{:?}: no frame to write back for {va}", env.id);
        return Ok(());
    };
    if let Err(e) = page_file.update_page(env.id, va, bytes) {
        log::error!("{:?}: cannot write back {va}: {e}", env.id);
        return Err(TerminationReason::PageFileFull(va));
    }
    clear_bits(&mut env.space, va, PagePermissions::MODIFIED);
    Ok(())
}

fn evict<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    va: VirtualAddress,
) -> Result<(), TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    if env.space.permissions(va).modified() {
        write_back(env, frames, page_file, va)?;
    }
    unmap_frame(&mut env.space, frames, va);
    Ok(())
}

/// Map a zeroed frame at `va` and restore its content from the page file.
fn bring_in<A, F, P>(
    env: &mut Environment<A>,
    frames: &mut F,
    page_file: &mut P,
    va: VirtualAddress,
) -> Result<(), TerminationReason>
where
    A: AddressSpace,
    F: FrameAllocator + ?Sized,
    P: PageFile + ?Sized,
{
    let frame = allocate_and_map(&mut env.space, frames, va, FAULTED_PAGE).map_err(|e| {
        log::error!("{:?}: no frame for {va}: {e}", env.id);
        TerminationReason::OutOfMemory(va)
    })?;

    let restored = frames
        .frame_bytes_mut(frame)
        .map_or(Err(PageFileError::NotPresent), |bytes| {
            page_file.read_page(env.id, va, bytes)
        });
    match restored {
        Ok(()) => Ok(()),
        Err(PageFileError::NotPresent) if is_demand_zero(va) => Ok(()),
        Err(e) => {
            log::error!("{:?}: {va} cannot be restored: {e}", env.id);
            unmap_frame(&mut env.space, frames, va);
            Err(TerminationReason::MissingPage(va))
        }
    }
}

fn clear_bits<A: AddressSpace + ?Sized>(space: &mut A, va: VirtualAddress, bits: PagePermissions) {
    if let Err(e) = space.set_permissions(va, PagePermissions::NONE, bits) {
        log::warn!("cannot clear {bits:?} on {va}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(ns: &[u64]) -> Vec<VirtualAddress> {
        ns.iter().map(|n| VirtualAddress::new(n * 0x1000)).collect()
    }

    #[test]
    fn optimal_reference_example() {
        assert_eq!(count_optimal_faults(&[], 2, &pages(&[1, 2, 3, 1, 4, 2])), 5);
    }

    #[test]
    fn optimal_uses_the_initial_set_and_page_granularity() {
        let refs: Vec<_> = pages(&[1, 2, 3]).into_iter().map(|va| va + 0x10).collect();
        assert_eq!(count_optimal_faults(&pages(&[1, 2]), 2, &refs), 1);
        assert_eq!(count_optimal_faults(&pages(&[1, 2, 3]), 3, &refs), 0);
        assert_eq!(count_optimal_faults(&[], 0, &refs), 3);
    }

    #[test]
    fn optimal_evicts_the_furthest_next_use() {
        // at the fault on 3, page 2 is needed later than page 1
        let refs = pages(&[1, 2, 3, 1, 2]);
        assert_eq!(count_optimal_faults(&[], 2, &refs), 4);
    }

    #[test]
    fn optimal_leaves_its_inputs_alone() {
        let initial = pages(&[5]);
        let refs = pages(&[1, 5, 1]);
        let (i, r) = (initial.clone(), refs.clone());
        count_optimal_faults(&initial, 1, &refs);
        assert_eq!((initial, refs), (i, r));
    }

    #[test]
    fn demand_zero_regions() {
        assert!(is_demand_zero(VirtualAddress::new(USER_HEAP_START)));
        assert!(is_demand_zero(VirtualAddress::new(USTACKTOP - 1)));
        assert!(!is_demand_zero(VirtualAddress::new(USTACKTOP)));
        assert!(!is_demand_zero(VirtualAddress::new(0x0080_0000)));
    }

    #[test]
    fn write_back_without_a_frame_stores_nothing() {
        use crate::{EnvId, MemoryPageFile};
        use kernel_memory_addresses::PhysicalAddress;
        use kernel_vmem::{FrameTable, SoftAddressSpace};

        let mut env = Environment::new(EnvId(1), SoftAddressSpace::new(), 4);
        let frames = FrameTable::new(PhysicalAddress::new(0x10_0000), 2);
        let mut file = MemoryPageFile::new(4);
        let va = VirtualAddress::new(USER_HEAP_START);

        assert_eq!(write_back(&mut env, &frames, &mut file, va), Ok(()));
        assert!(file.is_empty());
        assert_eq!(file.writes(), 0);
    }
}
