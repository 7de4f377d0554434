//! The core allocator.
//!
//! Global, lock-free-first state deciding which cell owns which CPU, which
//! cell is currently running where, and how idle cores flow between cells.
//! There is no global lock: the free and idle bitmaps are atomic words, and
//! the per-CPU owner/borrower slots each carry their own cache-line-aligned
//! lock so parallel allocation on different CPUs never contends.
//!
//! Reclaim is asynchronous by construction: an owner wanting its core back
//! raises the borrower's yield flag and returns. The core materialises when
//! the borrower honors the flag on its next kernel entry and the core is
//! pushed back through [`CoreAllocator::return_core`]. The allocator never
//! spins on another cell's progress.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::bitalloc::BitAlloc;
use crate::cell::Cell;
use crate::channel::ChannelPage;
use crate::cpumask::{bit, iter_cpus, AtomicCpuMask, CpuMask, MASK_ALL, NUM_CPU};
use klog::{klog, klog_always};
use trace::{increment_counter, TraceCounter};

/// Number of cell priority classes; lower numeric value is higher priority.
pub const NUM_PRIO: usize = 64;

/// Bounded number of probes into the idle pool per requested core. Caps
/// livelock when idle cores are snatched concurrently.
pub const IDLE_ALLOC_TRIALS: usize = 3;

/// Sentinel for allocation paths running without a worker CPU context
/// (boot, teardown, tests). Never compares equal to a real CPU id.
pub const SELF_CPU_NONE: usize = usize::MAX;

// ============================================================================
// Per-CPU cell slots
// ============================================================================

/// A per-CPU reference to a cell (the owner or the borrower of that CPU).
///
/// The slot holds a weak reference: cells are owned by their protection
/// domains, and the cell destructor clears every slot still naming it, so
/// a dead weak pointer is never observed by a correct teardown. Each slot
/// is cache-line aligned; the embedded lock serializes the read-check-write
/// sequences of the borrow and reserve paths.
#[repr(align(64))]
struct CellSlot {
    cell: RwLock<Option<Weak<Cell>>>,
}

impl CellSlot {
    const fn new() -> Self {
        Self {
            cell: RwLock::new(None),
        }
    }

    /// Resolve the slot to a live cell.
    fn get(&self) -> Option<Arc<Cell>> {
        self.cell.read().as_ref().and_then(Weak::upgrade)
    }

    /// Whether the slot names `target` (works during `target`'s drop).
    fn is(&self, target: &Cell) -> bool {
        self.cell
            .read()
            .as_ref()
            .map(|weak| core::ptr::eq(weak.as_ptr(), target))
            .unwrap_or(false)
    }

    fn set(&self, cell: &Arc<Cell>) {
        *self.cell.write() = Some(Arc::downgrade(cell));
    }

    /// Clear the slot if it names `target`.
    fn clear_if(&self, target: &Cell) {
        let mut guard = self.cell.write();
        let matches = guard
            .as_ref()
            .map(|weak| core::ptr::eq(weak.as_ptr(), target))
            .unwrap_or(false);
        if matches {
            *guard = None;
        }
    }
}

// ============================================================================
// The allocator
// ============================================================================

pub struct CoreAllocator {
    /// CPUs not currently in any cell's current mask.
    free_map: BitAlloc,
    /// CPUs whose worker recently parked. Distinct from the free map: an
    /// idle CPU may still be claimed by a cell that has nothing to do.
    idle_mask: AtomicCpuMask,
    /// Owning cell per CPU.
    owners: [CellSlot; NUM_CPU],
    /// Borrowing cell per CPU.
    borrowers: [CellSlot; NUM_CPU],
    /// Live cells bucketed by priority, for diagnostics and validation.
    cells: [Mutex<Vec<Weak<Cell>>>; NUM_PRIO],
    /// Serializes diagnostic dumps only.
    dump_lock: Mutex<()>,
}

impl CoreAllocator {
    pub const fn new() -> Self {
        const SLOT: CellSlot = CellSlot::new();
        const BUCKET: Mutex<Vec<Weak<Cell>>> = Mutex::new(Vec::new());
        Self {
            free_map: BitAlloc::new(),
            idle_mask: AtomicCpuMask::new(0),
            owners: [SLOT; NUM_CPU],
            borrowers: [SLOT; NUM_CPU],
            cells: [BUCKET; NUM_PRIO],
            dump_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Cell lifecycle
    // ------------------------------------------------------------------

    /// Create a cell bound to the habitat `mask << offset` and record its
    /// ownership of every habitat core.
    pub fn create_cell(
        &'static self,
        prio: u8,
        mask: CpuMask,
        offset: usize,
        channels: Arc<ChannelPage>,
    ) -> Arc<Cell> {
        assert!((prio as usize) < NUM_PRIO, "priority {} out of range", prio);
        let cell = Arc::new(Cell::new(self, prio, mask, offset, channels));
        self.cells[prio as usize]
            .lock()
            .push(Arc::downgrade(&cell));
        for cpu in iter_cpus(cell.owned_mask()) {
            self.set_owner(&cell, cpu);
        }
        cell
    }

    /// Forget a cell: called from the cell destructor after it has yielded
    /// all cores, so no owner or borrower slot may keep naming it.
    pub(crate) fn unregister(&self, cell: &Cell) {
        for cpu in 0..NUM_CPU {
            self.owners[cpu].clear_if(cell);
            self.borrowers[cpu].clear_if(cell);
        }
        self.cells[cell.prio() as usize]
            .lock()
            .retain(|weak| !core::ptr::eq(weak.as_ptr(), cell));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The cell owning `cpu`, if any.
    pub fn owner(&self, cpu: usize) -> Option<Arc<Cell>> {
        self.owners[cpu].get()
    }

    /// The cell currently borrowing `cpu`, if any.
    pub fn borrower(&self, cpu: usize) -> Option<Arc<Cell>> {
        self.borrowers[cpu].get()
    }

    /// Whether `cell` owns `cpu`.
    pub fn is_owner(&self, cell: &Cell, cpu: usize) -> bool {
        self.owners[cpu].is(cell)
    }

    /// Whether `cell` is recorded as the borrower of `cpu`.
    pub fn borrowed(&self, cell: &Cell, cpu: usize) -> bool {
        self.borrowers[cpu].is(cell)
    }

    /// Snapshot of the free map (diagnostics and tests).
    pub fn free_mask(&self) -> CpuMask {
        self.free_map.snapshot()
    }

    /// Snapshot of the idle mask.
    pub fn idle_cpus(&self) -> CpuMask {
        self.idle_mask.load()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Acquire up to `count` CPUs for `claimant`.
    ///
    /// Returns the bitmask actually granted, which may be empty: scarcity
    /// is not an error. Per requested core, in priority order:
    ///
    /// 1. claim a free core from the claimant's own habitat;
    /// 2. failing that, raise yield flags on habitat cores lent to other
    ///    cells (asynchronous: only cores that come back immediately are
    ///    counted, the rest materialise on later allocations);
    /// 3. failing that, probe the global idle pool a bounded number of
    ///    times and borrow a core from a foreign habitat.
    ///
    /// `self_cpu` is the CPU the requesting worker runs on; it is exempt
    /// from reclaim so a cell never pulls the core out from under its own
    /// request.
    pub fn alloc(&self, claimant: &Arc<Cell>, count: usize, self_cpu: usize) -> CpuMask {
        if count == 0 {
            return 0;
        }
        increment_counter(TraceCounter::AllocCalls, 1);

        let mut granted: CpuMask = 0;
        let mut allocated = 0usize;
        let mut remaining = count;

        while remaining > 0 {
            let mut claimed = self.free_map.alloc_with_mask(claimant.owned_mask());

            if claimed.is_none() {
                // Habitat exhausted: ask lent-out cores back, then fall
                // over to the idle pool.
                let reclaimed = self.reclaim_cores(claimant, remaining, self_cpu);
                if reclaimed > 0 {
                    allocated += reclaimed;
                    remaining -= reclaimed.min(remaining);
                    if remaining == 0 {
                        break;
                    }
                }
                for _ in 0..IDLE_ALLOC_TRIALS {
                    claimed = self.free_map.alloc_with_mask(self.idle_mask.load());
                    if claimed.is_some() {
                        break;
                    }
                }
            }

            let Some(cpu) = claimed else {
                break;
            };
            debug_assert!(!claimant.has_core(cpu));

            let borrowed = !self.is_owner(claimant, cpu);
            if borrowed {
                let mut slot = self.borrowers[cpu].cell.write();
                if let Some(previous) = slot.as_ref().and_then(Weak::upgrade) {
                    if previous.channel(cpu).yield_requested() {
                        // The previous borrower was already told to give
                        // this core up: it belongs with its owner, not
                        // with us.
                        self.return_core_locked(&previous, cpu, &mut slot);
                        drop(slot);
                        self.idle_mask.clr(cpu);
                        continue;
                    }
                }
                claimant.set_current(cpu);
                claimant.set_borrowed(cpu);
                *slot = Some(Arc::downgrade(claimant));
                drop(slot);
                increment_counter(TraceCounter::CoresBorrowed, 1);
            } else {
                self.owners[cpu].set(claimant);
                claimant.set_current(cpu);
            }

            granted |= bit(cpu);
            allocated += 1;
            remaining -= 1;
            self.idle_mask.clr(cpu);
        }

        claimant.calc_stealing_limit(allocated);
        increment_counter(TraceCounter::CoresGranted, granted.count_ones() as u64);
        granted
    }

    /// Raise yield flags on up to `want` habitat cores of `claimant` that
    /// other cells are borrowing.
    ///
    /// Returns the number of cores that came back immediately (borrowers
    /// without a worker to signal); cores merely flagged stay outstanding
    /// until their borrower traps.
    fn reclaim_cores(&self, claimant: &Arc<Cell>, want: usize, self_cpu: usize) -> usize {
        let mut reclaimed = 0;
        for cpu in iter_cpus(claimant.owned_mask()) {
            if reclaimed == want {
                break;
            }
            if cpu == self_cpu {
                continue;
            }
            let Some(borrower) = self.borrowers[cpu].get() else {
                continue;
            };
            if core::ptr::eq(Arc::as_ptr(&borrower), Arc::as_ptr(claimant)) {
                continue;
            }
            claimant.set_requested(cpu);
            borrower.yield_cores(bit(cpu), false);
            if claimant.has_core(cpu) {
                // The borrower had no worker to signal and returned the
                // core on the spot.
                reclaimed += 1;
            }
        }
        reclaimed
    }

    // ------------------------------------------------------------------
    // Reservation
    // ------------------------------------------------------------------

    /// Insist that `cpu` be part of `reservant`'s current mask immediately.
    ///
    /// Fails if `reservant` does not own `cpu`. If the core is lent out,
    /// the borrower's yield flag is raised and the reservation is
    /// established while the borrower is still draining; `return_core`
    /// tolerates the already-set current bit.
    pub fn reserve(&self, reservant: &Arc<Cell>, cpu: usize) -> bool {
        if cpu >= NUM_CPU || !self.is_owner(reservant, cpu) {
            return false;
        }
        if let Some(borrower) = self.borrowers[cpu].get() {
            if !core::ptr::eq(Arc::as_ptr(&borrower), Arc::as_ptr(reservant)) {
                borrower.yield_cores(bit(cpu), false);
            }
        }
        self.free_map.reserve(cpu);
        self.idle_mask.clr(cpu);
        reservant.set_current(cpu);
        true
    }

    // ------------------------------------------------------------------
    // Yield and return
    // ------------------------------------------------------------------

    /// Voluntary release of `cpu` by `yielder`.
    ///
    /// Marks the core idle and free. Does not block and does not wake
    /// anyone. A no-op unless `yielder` still plausibly holds the core
    /// (running on it or owning it).
    pub fn yield_cpu(&self, yielder: &Cell, cpu: usize) {
        if !yielder.has_core(cpu) && !self.is_owner(yielder, cpu) {
            return;
        }
        // A voluntary yield of a borrowed core vacates the borrower slot;
        // a stale entry would break borrower-reachability for the next
        // claimant.
        self.borrowers[cpu].clear_if(yielder);
        yielder.yield_core(cpu, false);
        self.idle_mask.set(cpu);
        self.free_map.release(cpu);
        increment_counter(TraceCounter::VoluntaryYields, 1);
    }

    /// A borrower honors a reclaim: push `cpu` back to its owner.
    ///
    /// The caller is responsible for waking the owner's worker.
    pub fn return_core(&self, borrower: &Cell, cpu: usize) {
        let mut slot = self.borrowers[cpu].cell.write();
        self.return_core_locked(borrower, cpu, &mut slot);
    }

    /// Return path with the borrower slot lock already held (the borrow
    /// path of `alloc` runs it under its read-check-write sequence).
    fn return_core_locked(
        &self,
        borrower: &Cell,
        cpu: usize,
        slot: &mut Option<Weak<Cell>>,
    ) {
        borrower.yield_core(cpu, true);
        let names_borrower = slot
            .as_ref()
            .map(|weak| core::ptr::eq(weak.as_ptr(), borrower))
            .unwrap_or(false);
        if names_borrower {
            *slot = None;
        }
        match self.owners[cpu].get() {
            Some(owner) => {
                // test-and-set: a racing reserve may have claimed the bit
                // already, and it must not be toggled twice.
                owner.set_current(cpu);
                owner.clr_requested(cpu);
            }
            None => {
                // The owner was revoked while the core was on loan. With
                // nobody to hand it to, the core re-enters the free pool;
                // swallowing it here would leak the CPU for good.
                klog!(Warn, "returned CPU {} has no owner, releasing it", cpu);
                self.idle_mask.set(cpu);
                self.free_map.release(cpu);
            }
        }
        increment_counter(TraceCounter::CoresReturned, 1);
    }

    // ------------------------------------------------------------------
    // Habitat configuration
    // ------------------------------------------------------------------

    /// Record `cell` as the owner of `cpu`. A displaced owner still
    /// running on the core is demoted to borrower status so the new owner
    /// can reclaim it.
    pub fn set_owner(&self, cell: &Arc<Cell>, cpu: usize) {
        let previous = {
            let mut guard = self.owners[cpu].cell.write();
            let previous = guard.as_ref().and_then(Weak::upgrade);
            *guard = Some(Arc::downgrade(cell));
            previous
        };
        if let Some(previous) = previous {
            let displaced = !core::ptr::eq(Arc::as_ptr(&previous), Arc::as_ptr(cell));
            if displaced && previous.has_core(cpu) {
                previous.set_borrowed(cpu);
                self.borrowers[cpu].set(&previous);
            }
        }
    }

    /// Bulk variant of [`set_owner`](Self::set_owner) over a habitat
    /// stripe.
    pub fn set_owner_mask(&self, cell: &Arc<Cell>, mask: CpuMask, offset: usize) {
        let stripe = if offset >= NUM_CPU { 0 } else { mask << offset };
        for cpu in iter_cpus(stripe) {
            self.set_owner(cell, cpu);
        }
    }

    /// Forget `cell`'s ownership of `cpu` (habitat shrink).
    ///
    /// A cell still running on the relinquished core keeps it, but as a
    /// borrower: the demotion keeps the core reclaimable by whichever
    /// cell the habitat stripe is handed to next.
    pub(crate) fn drop_ownership(&self, cell: &Arc<Cell>, cpu: usize) {
        if cell.has_core(cpu) {
            cell.set_borrowed(cpu);
            self.borrowers[cpu].set(cell);
        }
        self.owners[cpu].clear_if(cell);
    }

    /// Carve the global CPU pool: everything outside
    /// `[offset, offset + size)` becomes permanently unallocatable.
    pub fn init_habitat(&self, offset: usize, size: usize) {
        let window = window_mask(offset, size);
        self.free_map.retire_mask(!window & MASK_ALL);
        klog!(Info, "habitat window {:#x}", window);
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Debug invariant: no CPU is claimed by two cells.
    pub fn valid_allocation(&self) -> bool {
        let mut possessors: [Option<*const Cell>; NUM_CPU] = [None; NUM_CPU];
        for bucket in self.cells.iter() {
            for weak in bucket.lock().iter() {
                let Some(cell) = weak.upgrade() else {
                    continue;
                };
                for cpu in iter_cpus(cell.current_mask()) {
                    if possessors[cpu].is_some() {
                        return false;
                    }
                    possessors[cpu] = Some(Arc::as_ptr(&cell));
                }
            }
        }
        true
    }

    /// Log one line per live cell. Serialized by the dump lock.
    pub fn dump_cells(&self) {
        let _guard = self.dump_lock.lock();
        klog_always!("---------<Allocations>---------");
        for bucket in self.cells.iter() {
            for weak in bucket.lock().iter() {
                if let Some(cell) = weak.upgrade() {
                    klog_always!(
                        "prio {:2} habitat {:#018x} allocation {:#018x}",
                        cell.prio(),
                        cell.owned_mask(),
                        cell.current_mask()
                    );
                }
            }
        }
        klog_always!("-------------------------------");
    }
}

/// Mask of the CPUs in `[offset, offset + size)`, clamped to the CPU range.
fn window_mask(offset: usize, size: usize) -> CpuMask {
    if offset >= NUM_CPU || size == 0 {
        return 0;
    }
    let end = (offset + size).min(NUM_CPU);
    let upto_end = if end >= 64 { u64::MAX } else { (1u64 << end) - 1 };
    let below_start = (1u64 << offset) - 1;
    upto_end & !below_start
}

// ============================================================================
// Global instance
// ============================================================================

static CORE_ALLOC: CoreAllocator = CoreAllocator::new();

/// The boot-time global allocator instance.
pub fn core_alloc() -> &'static CoreAllocator {
    &CORE_ALLOC
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn fresh_alloc() -> &'static CoreAllocator {
        Box::leak(Box::new(CoreAllocator::new()))
    }

    fn cell_with_workers(
        alloc: &'static CoreAllocator,
        prio: u8,
        mask: CpuMask,
    ) -> Arc<Cell> {
        let cell = alloc.create_cell(prio, mask, 0, Arc::new(ChannelPage::new()));
        for cpu in iter_cpus(mask) {
            cell.register_worker(cpu).unwrap();
        }
        cell
    }

    #[test]
    fn test_own_first_allocation() {
        // Scenario: A owns 0b0011, B owns 0b1100, everything idle.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 4);
        let a = cell_with_workers(alloc, 10, 0b0011);
        let _b = cell_with_workers(alloc, 10, 0b1100);

        let granted = alloc.alloc(&a, 2, SELF_CPU_NONE);
        assert_eq!(granted, 0b0011);
        assert_eq!(a.current_mask(), 0b0011);
        assert_eq!(a.borrowed_mask(), 0);
        assert!(alloc.valid_allocation());
    }

    #[test]
    fn test_no_borrow_of_busy_cores() {
        // Scenario: after A holds its own cores, B gets exactly its own
        // two; the third request fails because A's cores are not idle.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 4);
        let a = cell_with_workers(alloc, 10, 0b0011);
        let b = cell_with_workers(alloc, 10, 0b1100);

        assert_eq!(alloc.alloc(&a, 2, SELF_CPU_NONE), 0b0011);
        let granted = alloc.alloc(&b, 3, SELF_CPU_NONE);
        assert_eq!(granted, 0b1100);
        assert_eq!(b.current_mask(), 0b1100);
        assert_eq!(b.borrowed_mask(), 0);
        assert!(alloc.valid_allocation());
    }

    #[test]
    fn test_borrow_idle_core_of_quiescent_owner() {
        // Scenario: B yields its core 1; A then gets its own core 0 plus
        // core 1 on loan.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0001);
        let b = cell_with_workers(alloc, 10, 0b0010);

        alloc.yield_cpu(&b, 1);

        let granted = alloc.alloc(&a, 2, SELF_CPU_NONE);
        assert_eq!(granted, 0b0011);
        assert_eq!(a.current_mask(), 0b0011);
        assert_eq!(a.borrowed_mask(), 0b0010);
        assert!(alloc.borrowed(&a, 1));
        assert!(alloc.valid_allocation());
    }

    #[test]
    fn test_owner_reclaims_lent_core() {
        // Scenario: continuing from the loan of core 1 to A, owner B asks
        // for it back. The reclaim is asynchronous: B gets nothing now,
        // A's worker honors the flag, the core flows back and B is woken.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0001);
        a.register_worker(1).unwrap();
        let b = cell_with_workers(alloc, 10, 0b0010);

        alloc.yield_cpu(&b, 1);
        assert_eq!(alloc.alloc(&a, 2, SELF_CPU_NONE), 0b0011);

        let granted = alloc.alloc(&b, 1, SELF_CPU_NONE);
        assert_eq!(granted, 0);
        assert!(a.channel(1).yield_requested());
        assert!(b.requested_core(1));

        // A's worker on CPU 1 enters the yield syscall and honors the flag.
        alloc.return_core(&a, 1);
        b.wake_core(1);

        assert_eq!(a.current_mask() & 0b0010, 0);
        assert!(alloc.borrower(1).is_none());
        assert_eq!(b.current_mask() & 0b0010, 0b0010);
        assert!(!b.requested_core(1));
        assert!(!a.channel(1).yield_requested());
        assert!(b.wake_pending(1));
        assert!(alloc.valid_allocation());
    }

    #[test]
    fn test_reserve_races_with_active_borrower() {
        // Scenario: owner A reserves CPU 1 while B is borrowing it. The
        // reservation is established immediately; B's later return must
        // not toggle A's already-set bit.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0010);
        let b = cell_with_workers(alloc, 10, 0b0001);
        b.register_worker(1).unwrap();

        alloc.yield_cpu(&a, 1);
        assert_eq!(alloc.alloc(&b, 2, SELF_CPU_NONE), 0b0011);
        assert!(alloc.borrowed(&b, 1));

        assert!(alloc.reserve(&a, 1));
        assert!(b.channel(1).yield_requested());
        assert!(!alloc.free_map.is_free(1));
        assert!(a.has_core(1));

        // B honors the flag.
        alloc.return_core(&b, 1);
        assert!(a.has_core(1));
        assert!(!b.has_core(1));
        assert!(alloc.borrower(1).is_none());
        assert!(alloc.valid_allocation());
    }

    #[test]
    fn test_reserve_fails_for_non_owner() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 4);
        let a = cell_with_workers(alloc, 10, 0b0011);
        let b = cell_with_workers(alloc, 10, 0b1100);
        assert!(!alloc.reserve(&a, 2));
        assert!(!alloc.reserve(&b, 0));
        assert!(!alloc.reserve(&a, NUM_CPU));
    }

    #[test]
    fn test_priority_never_preempts_running_owner() {
        // Scenario: A holds all four cores it owns; B owns nothing. B's
        // request comes back empty and raises no yield flags.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 4);
        let a = cell_with_workers(alloc, 10, 0b1111);
        let b = alloc.create_cell(20, 0, 0, Arc::new(ChannelPage::new()));

        assert_eq!(alloc.alloc(&a, 4, SELF_CPU_NONE), 0b1111);
        assert_eq!(alloc.alloc(&b, 1, SELF_CPU_NONE), 0);
        for cpu in 0..4 {
            assert!(!a.channel(cpu).yield_requested());
        }
    }

    #[test]
    fn test_alloc_zero_is_a_noop() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 4);
        let a = cell_with_workers(alloc, 10, 0b0011);
        let free_before = alloc.free_mask();
        assert_eq!(alloc.alloc(&a, 0, SELF_CPU_NONE), 0);
        assert_eq!(alloc.free_mask(), free_before);
        assert_eq!(a.current_mask(), 0);
    }

    #[test]
    fn test_alloc_with_empty_habitat_borrows_only() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0011);
        let b = alloc.create_cell(20, 0, 0, Arc::new(ChannelPage::new()));

        // A sleeps on both cores, leaving them idle.
        alloc.yield_cpu(&a, 0);
        alloc.yield_cpu(&a, 1);

        let granted = alloc.alloc(&b, 2, SELF_CPU_NONE);
        assert_eq!(granted, 0b0011);
        assert_eq!(b.borrowed_mask(), 0b0011);
        assert!(alloc.borrowed(&b, 0));
        assert!(alloc.borrowed(&b, 1));
    }

    #[test]
    fn test_flagged_core_returns_to_owner_instead_of_reborrow() {
        // A core reached through the idle pool whose recorded borrower
        // still has its yield flag up must go back to its owner, not to
        // the next claimant.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0001);
        a.register_worker(1).unwrap();
        let b = cell_with_workers(alloc, 10, 0b0010);
        let c = alloc.create_cell(20, 0, 0, Arc::new(ChannelPage::new()));

        // B's core 1 goes idle, A borrows it, B reclaims it (flag now up).
        alloc.yield_cpu(&b, 1);
        assert_eq!(alloc.alloc(&a, 2, SELF_CPU_NONE), 0b0011);
        assert_eq!(alloc.alloc(&b, 1, SELF_CPU_NONE), 0);
        assert!(a.channel(1).yield_requested());

        // Contract violation: the core shows up free and idle while the
        // flagged borrower is still recorded.
        alloc.free_map.release(1);
        alloc.idle_mask.set(1);

        // C probes the idle pool and reaches core 1: the allocator hands
        // it back to owner B instead of re-borrowing it.
        let granted = alloc.alloc(&c, 1, SELF_CPU_NONE);
        assert_eq!(granted, 0);
        assert!(alloc.borrower(1).is_none());
        assert!(!a.channel(1).yield_requested());
        assert!(!a.has_core(1));
        assert!(b.has_core(1));
    }

    #[test]
    fn test_round_trip_restores_state() {
        // alloc -> add_cores -> yield_cores(release) -> yield leaves the
        // free map, current mask and borrower slot as they were.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let x = cell_with_workers(alloc, 10, 0b0001);

        let free_before = alloc.free_mask();
        let current_before = x.current_mask();
        assert!(alloc.borrower(0).is_none());

        let granted = alloc.alloc(&x, 1, SELF_CPU_NONE);
        assert_eq!(granted, 0b0001);
        x.add_cores(granted);
        x.yield_cores(granted, true);
        // The worker observes the flag and completes the yield.
        x.yield_core(0, true);
        alloc.yield_cpu(&x, 0);

        assert_eq!(alloc.free_mask(), free_before);
        assert_eq!(x.current_mask(), current_before);
        assert!(alloc.borrower(0).is_none());
    }

    #[test]
    fn test_set_owner_demotes_running_owner() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0001);
        assert_eq!(alloc.alloc(&a, 1, SELF_CPU_NONE), 0b0001);

        let b = alloc.create_cell(5, 0, 0, Arc::new(ChannelPage::new()));
        alloc.set_owner(&b, 0);

        assert!(alloc.is_owner(&b, 0));
        assert!(alloc.borrowed(&a, 0));
        assert!(a.borrowed_mask() & 0b0001 != 0);
    }

    #[test]
    fn test_init_habitat_window() {
        let alloc = fresh_alloc();
        alloc.init_habitat(2, 2);
        let a = cell_with_workers(alloc, 10, 0b1111);
        // Only CPUs 2 and 3 are inside the window.
        let granted = alloc.alloc(&a, 4, SELF_CPU_NONE);
        assert_eq!(granted, 0b1100);
    }

    #[test]
    fn test_reclaim_skips_self_cpu() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0011);
        let b = alloc.create_cell(10, 0, 0, Arc::new(ChannelPage::new()));
        b.register_worker(0).unwrap();
        b.register_worker(1).unwrap();

        // A sleeps on both cores; B borrows both.
        alloc.yield_cpu(&a, 0);
        alloc.yield_cpu(&a, 1);
        assert_eq!(alloc.alloc(&b, 2, SELF_CPU_NONE), 0b0011);

        // A allocates from CPU 0: its own CPU must not be reclaimed.
        assert_eq!(alloc.alloc(&a, 2, 0), 0);
        assert!(!b.channel(0).yield_requested());
        assert!(b.channel(1).yield_requested());
    }

    #[test]
    fn test_cell_teardown_returns_borrowed_cores() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0011);
        alloc.yield_cpu(&a, 0);
        alloc.yield_cpu(&a, 1);

        let b = alloc.create_cell(20, 0, 0, Arc::new(ChannelPage::new()));
        assert_eq!(alloc.alloc(&b, 2, SELF_CPU_NONE), 0b0011);
        assert_eq!(b.borrowed_mask(), 0b0011);

        drop(b);

        assert!(alloc.borrower(0).is_none());
        assert!(alloc.borrower(1).is_none());
        assert_eq!(a.current_mask(), 0b0011);
        assert!(alloc.valid_allocation());
    }

    #[test]
    fn test_ownerless_return_releases_core() {
        // The owner is revoked while its core is on loan; when the
        // borrower finally returns the core it must enter the free pool
        // instead of leaking.
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0010);
        let b = alloc.create_cell(20, 0, 0, Arc::new(ChannelPage::new()));

        alloc.yield_cpu(&a, 1);
        assert_eq!(alloc.alloc(&b, 1, SELF_CPU_NONE), 0b0010);
        assert!(alloc.borrowed(&b, 1));

        drop(a);
        assert!(alloc.owner(1).is_none());

        alloc.return_core(&b, 1);
        assert!(!b.has_core(1));
        assert!(alloc.borrower(1).is_none());
        assert!(alloc.free_map.is_free(1));
        assert!(alloc.idle_cpus() & 0b0010 != 0);

        // The released core is allocatable again.
        let c = cell_with_workers(alloc, 10, 0b0010);
        assert_eq!(alloc.alloc(&c, 1, SELF_CPU_NONE), 0b0010);
    }

    #[test]
    fn test_valid_allocation_detects_duplicates() {
        let alloc = fresh_alloc();
        alloc.init_habitat(0, 2);
        let a = cell_with_workers(alloc, 10, 0b0001);
        let b = cell_with_workers(alloc, 11, 0b0010);
        assert_eq!(alloc.alloc(&a, 1, SELF_CPU_NONE), 0b0001);
        assert_eq!(alloc.alloc(&b, 1, SELF_CPU_NONE), 0b0010);
        assert!(alloc.valid_allocation());

        // Force a duplicate claim behind the allocator's back.
        b.set_current(0);
        assert!(!alloc.valid_allocation());
    }

    #[test]
    fn test_window_mask() {
        assert_eq!(window_mask(0, 4), 0b1111);
        assert_eq!(window_mask(2, 2), 0b1100);
        assert_eq!(window_mask(0, 64), u64::MAX);
        assert_eq!(window_mask(62, 10), 0b11u64 << 62);
        assert_eq!(window_mask(64, 4), 0);
        assert_eq!(window_mask(0, 0), 0);
    }
}
