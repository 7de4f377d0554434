//! Cells: resource principals owning a habitat of CPU cores.
//!
//! A cell groups a protection domain's worker execution contexts with its
//! core entitlement. The habitat (`owned_mask`) is assigned at creation and
//! by explicit habitat updates; the set of cores the cell is actually
//! running on (`current_mask`) is mutated only by allocator paths. Cores in
//! `current_mask` that the cell does not own are tracked in `borrowed_mask`
//! and can be pulled back by their owner at any time through the yield
//! protocol.
//!
//! # Worker states on a CPU `c`
//!
//! ```text
//! IDLE            : not in current_mask
//! RUNNING         : in current_mask, yield_flag = 0
//! YIELD_REQUESTED : in current_mask, yield_flag = 1
//!
//! IDLE            --add_cores--------------> RUNNING
//! RUNNING         --yield_cores (reclaim)--> YIELD_REQUESTED
//! RUNNING         --voluntary yield--------> IDLE
//! YIELD_REQUESTED --worker honors flag-----> IDLE (borrowed: owner woken)
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use spin::Mutex;

use crate::channel::{Channel, ChannelPage};
use crate::core_allocator::CoreAllocator;
use crate::cpumask::{iter_cpus, AtomicCpuMask, CpuMask, NUM_CPU};
use crate::worker::Worker;
use klog::klog;
use trace::{increment_counter, TraceCounter};

/// Errors surfaced by cell worker management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellError {
    /// A worker is already registered on this (cell, CPU) pair.
    WorkerExists,
}

/// A resource principal and its per-CPU scheduling state.
pub struct Cell {
    alloc: &'static CoreAllocator,
    /// Priority class; strictly lower numeric value is higher priority.
    prio: u8,
    /// The habitat: cores owned by this cell.
    owned_mask: AtomicCpuMask,
    /// Cores this cell is currently running a worker on.
    current_mask: AtomicCpuMask,
    /// Subset of `current_mask` not owned by this cell.
    borrowed_mask: AtomicCpuMask,
    /// Cores asked back from a borrower but not yet received.
    requested_mask: AtomicCpuMask,
    /// Cores whose workers have a reclaim pending (bookkeeping mirror of
    /// the channel flags).
    cores_to_reclaim: AtomicCpuMask,
    /// Per-CPU worker handles.
    workers: [Mutex<Option<Arc<Worker>>>; NUM_CPU],
    /// The channel page shared with this cell's user space.
    channels: Arc<ChannelPage>,
    /// Number of registered workers; numerator of the stealing quota.
    max_workers: AtomicU32,
    /// Advisory work-stealing cap, recomputed at each allocation.
    stealing_limit: AtomicU16,
    /// Cores counted by the most recent allocation.
    remainder: AtomicU16,
}

impl Cell {
    pub(crate) fn new(
        alloc: &'static CoreAllocator,
        prio: u8,
        mask: CpuMask,
        offset: usize,
        channels: Arc<ChannelPage>,
    ) -> Self {
        const NO_WORKER: Mutex<Option<Arc<Worker>>> = Mutex::new(None);
        Self {
            alloc,
            prio,
            owned_mask: AtomicCpuMask::new(shifted(mask, offset)),
            current_mask: AtomicCpuMask::new(0),
            borrowed_mask: AtomicCpuMask::new(0),
            requested_mask: AtomicCpuMask::new(0),
            cores_to_reclaim: AtomicCpuMask::new(0),
            workers: [NO_WORKER; NUM_CPU],
            channels,
            max_workers: AtomicU32::new(0),
            stealing_limit: AtomicU16::new(0),
            remainder: AtomicU16::new(0),
        }
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn prio(&self) -> u8 {
        self.prio
    }

    #[inline]
    pub fn owned_mask(&self) -> CpuMask {
        self.owned_mask.load()
    }

    #[inline]
    pub fn current_mask(&self) -> CpuMask {
        self.current_mask.load()
    }

    #[inline]
    pub fn borrowed_mask(&self) -> CpuMask {
        self.borrowed_mask.load()
    }

    #[inline]
    pub fn requested_mask(&self) -> CpuMask {
        self.requested_mask.load()
    }

    #[inline]
    pub fn reclaim_mask(&self) -> CpuMask {
        self.cores_to_reclaim.load()
    }

    /// Whether this cell currently runs on `cpu`.
    #[inline]
    pub fn has_core(&self, cpu: usize) -> bool {
        self.current_mask.chk(cpu)
    }

    /// Whether this cell has an outstanding reclaim for `cpu`.
    #[inline]
    pub fn requested_core(&self, cpu: usize) -> bool {
        self.requested_mask.chk(cpu)
    }

    /// The channel shared with this cell's worker on `cpu`.
    #[inline]
    pub fn channel(&self, cpu: usize) -> &Channel {
        self.channels.channel(cpu)
    }

    /// Most recent stealing quota.
    #[inline]
    pub fn stealing_limit(&self) -> u16 {
        self.stealing_limit.load(Ordering::Acquire)
    }

    /// Cores counted by the most recent allocation.
    #[inline]
    pub fn remainder(&self) -> u16 {
        self.remainder.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Allocator-side mask mutation
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn set_current(&self, cpu: usize) -> bool {
        self.current_mask.set(cpu)
    }

    #[inline]
    pub(crate) fn set_borrowed(&self, cpu: usize) {
        self.borrowed_mask.set(cpu);
    }

    #[inline]
    pub(crate) fn set_requested(&self, cpu: usize) {
        self.requested_mask.set(cpu);
    }

    #[inline]
    pub(crate) fn clr_requested(&self, cpu: usize) {
        self.requested_mask.clr(cpu);
    }

    /// Recompute the stealing quota after an allocation that counted
    /// `allocated` cores.
    pub(crate) fn calc_stealing_limit(&self, allocated: usize) {
        let limit = if allocated == 0 {
            0
        } else {
            self.max_workers.load(Ordering::Relaxed) as usize / allocated
        };
        self.stealing_limit.store(limit as u16, Ordering::Release);
        self.remainder.store(allocated as u16, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Worker management
    // ------------------------------------------------------------------

    /// Install the per-CPU worker handle for `cpu`.
    ///
    /// A cell has at most one worker per CPU; a second registration on the
    /// same CPU fails.
    pub fn register_worker(&self, cpu: usize) -> Result<(), CellError> {
        let mut slot = self.workers[cpu].lock();
        if slot.is_some() {
            return Err(CellError::WorkerExists);
        }
        *slot = Some(Arc::new(Worker::new(cpu)));
        self.max_workers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Destroy the worker handle on `cpu` (cell teardown).
    pub fn remove_worker(&self, cpu: usize) {
        let mut slot = self.workers[cpu].lock();
        if slot.take().is_some() {
            self.max_workers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// The worker handle on `cpu`, cloned out so wake and park never run
    /// under the slot lock (a parked worker must not hold it).
    fn worker(&self, cpu: usize) -> Option<Arc<Worker>> {
        self.workers[cpu].lock().clone()
    }

    /// Whether a worker is registered on `cpu`.
    pub fn worker_registered(&self, cpu: usize) -> bool {
        self.workers[cpu].lock().is_some()
    }

    /// Whether the worker on `cpu` has an undelivered wake-up.
    pub fn wake_pending(&self, cpu: usize) -> bool {
        self.worker(cpu).map(|w| w.wake_pending()).unwrap_or(false)
    }

    /// Block the worker on `cpu` until its next wake-up.
    ///
    /// Returns `true` if a wake permit was consumed.
    pub fn park_worker(&self, cpu: usize) -> bool {
        match self.worker(cpu) {
            Some(worker) => worker.park(),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Core activation and the yield protocol
    // ------------------------------------------------------------------

    /// Activate the workers on every CPU in `mask` after an allocation.
    ///
    /// Publishes the current stealing quota into each worker's channel
    /// before the wake so a woken worker observes it. Bits without a
    /// registered worker are ignored.
    pub fn add_cores(&self, mask: CpuMask) {
        let limit = self.stealing_limit();
        let remainder = self.remainder();
        for cpu in iter_cpus(mask) {
            let Some(worker) = self.worker(cpu) else {
                klog!(Warn, "no worker for CPU {} in cell prio {}", cpu, self.prio);
                continue;
            };
            self.channels.channel(cpu).publish_quota(limit, remainder);
            worker.wake();
            increment_counter(TraceCounter::WorkerWakes, 1);
        }
    }

    /// Request that this cell vacate every CPU in `mask`.
    ///
    /// For each CPU with a registered worker the yield flag is raised; the
    /// flag is the interlock, so a CPU whose flag is already up is skipped
    /// rather than re-signalled. A borrowed CPU without a worker cannot
    /// honor a flag and is handed straight back to its owner. With
    /// `release` the CPU additionally enters the free pool.
    ///
    /// Returns the number of CPUs actually processed.
    pub fn yield_cores(&self, mask: CpuMask, release: bool) -> usize {
        let mut processed = 0;
        for cpu in iter_cpus(mask) {
            if self.worker_registered(cpu) {
                let channel = self.channels.channel(cpu);
                if channel.request_yield() {
                    channel
                        .delta_setflag
                        .store(cpu_local::cycles(), Ordering::Release);
                    self.cores_to_reclaim.set(cpu);
                    increment_counter(TraceCounter::ReclaimsRequested, 1);
                    processed += 1;
                }
            } else if self.borrowed_mask.chk(cpu) {
                // No worker to observe a flag: return the core immediately.
                self.alloc.return_core(self, cpu);
                if let Some(owner) = self.alloc.owner(cpu) {
                    owner.wake_core(cpu);
                }
                processed += 1;
            }
            if release {
                self.alloc.yield_cpu(self, cpu);
            }
        }
        processed
    }

    /// Terminal step of the yield protocol on `cpu`.
    ///
    /// Runs on the worker's own path (via the yield syscall) or on the
    /// owner's behalf when a core is returned. Clears the running and
    /// reclaim bookkeeping bits; with `clear_flag` also lowers the channel
    /// yield flag.
    pub fn yield_core(&self, cpu: usize, clear_flag: bool) {
        self.current_mask.clr(cpu);
        self.cores_to_reclaim.clr(cpu);
        self.borrowed_mask.clr(cpu);
        if clear_flag {
            self.channels.channel(cpu).clear_yield();
        }
    }

    /// Publish the stealing quota and wake the worker on `cpu`.
    pub fn wake_core(&self, cpu: usize) {
        let Some(worker) = self.worker(cpu) else {
            klog!(Warn, "wake for CPU {} ignored, no worker", cpu);
            return;
        };
        self.channels
            .channel(cpu)
            .publish_quota(self.stealing_limit(), self.remainder());
        worker.wake();
        increment_counter(TraceCounter::WorkerWakes, 1);
    }

    /// Reassign a cell's habitat stripe and propagate ownership into the
    /// allocator.
    ///
    /// An associated function because the allocator records new ownership
    /// through a weak reference to the cell.
    pub fn update(cell: &Arc<Cell>, mask: CpuMask, offset: usize) {
        let new_owned = shifted(mask, offset);
        let old_owned = cell.owned_mask.swap(new_owned);
        for cpu in iter_cpus(new_owned & !old_owned) {
            cell.alloc.set_owner(cell, cpu);
        }
        for cpu in iter_cpus(old_owned & !new_owned) {
            cell.alloc.drop_ownership(cell, cpu);
        }
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        // Borrowed cores must reach their owners before this cell's weak
        // references go stale.
        for cpu in iter_cpus(self.borrowed_mask.load()) {
            self.alloc.return_core(self, cpu);
            if let Some(owner) = self.alloc.owner(cpu) {
                owner.wake_core(cpu);
            }
        }
        for cpu in iter_cpus(self.current_mask.load()) {
            self.alloc.yield_cpu(self, cpu);
        }
        for slot in self.workers.iter() {
            *slot.lock() = None;
        }
        self.alloc.unregister(self);
    }
}

/// Shift a habitat stripe to its bit offset, saturating at the CPU range.
fn shifted(mask: CpuMask, offset: usize) -> CpuMask {
    if offset >= NUM_CPU {
        0
    } else {
        mask << offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_allocator::{CoreAllocator, SELF_CPU_NONE};
    use alloc::boxed::Box;

    fn fresh() -> (&'static CoreAllocator, Arc<Cell>) {
        let alloc: &'static CoreAllocator = Box::leak(Box::new(CoreAllocator::new()));
        let cell = alloc.create_cell(10, 0b0011, 0, Arc::new(ChannelPage::new()));
        (alloc, cell)
    }

    #[test]
    fn test_double_worker_registration_rejected() {
        let (_, cell) = fresh();
        assert_eq!(cell.register_worker(0), Ok(()));
        assert_eq!(cell.register_worker(0), Err(CellError::WorkerExists));
        cell.remove_worker(0);
        assert_eq!(cell.register_worker(0), Ok(()));
    }

    #[test]
    fn test_add_cores_publishes_quota_and_wakes() {
        let (alloc, cell) = fresh();
        cell.register_worker(0).unwrap();
        cell.register_worker(1).unwrap();
        let granted = alloc.alloc(&cell, 2, SELF_CPU_NONE);
        assert_eq!(granted, 0b0011);
        cell.add_cores(granted);
        assert_eq!(cell.channel(0).remainder.load(Ordering::Acquire), 2);
        assert_eq!(cell.channel(0).limit.load(Ordering::Acquire), 1);
        assert!(cell.wake_pending(0));
        assert!(cell.wake_pending(1));
    }

    #[test]
    fn test_add_cores_ignores_missing_worker() {
        let (alloc, cell) = fresh();
        cell.register_worker(0).unwrap();
        let granted = alloc.alloc(&cell, 2, SELF_CPU_NONE);
        // CPU 1 has no worker: must not panic, CPU 0 still woken.
        cell.add_cores(granted);
        assert!(cell.wake_pending(0));
        assert!(!cell.wake_pending(1));
    }

    #[test]
    fn test_yield_cores_flag_interlock() {
        let (alloc, cell) = fresh();
        cell.register_worker(1).unwrap();
        alloc.alloc(&cell, 2, SELF_CPU_NONE);
        assert_eq!(cell.yield_cores(0b0010, false), 1);
        assert!(cell.channel(1).yield_requested());
        assert!(cell.reclaim_mask() & 0b0010 != 0);
        // Pending request is not re-issued.
        assert_eq!(cell.yield_cores(0b0010, false), 0);
    }

    #[test]
    fn test_yield_core_clears_bookkeeping() {
        let (alloc, cell) = fresh();
        cell.register_worker(1).unwrap();
        alloc.alloc(&cell, 2, SELF_CPU_NONE);
        cell.yield_cores(0b0010, false);
        cell.yield_core(1, true);
        assert!(!cell.has_core(1));
        assert_eq!(cell.reclaim_mask() & 0b0010, 0);
        assert!(!cell.channel(1).yield_requested());
    }

    #[test]
    fn test_update_moves_habitat() {
        let (alloc, cell) = fresh();
        Cell::update(&cell, 0b11, 2);
        assert_eq!(cell.owned_mask(), 0b1100);
        assert!(alloc.is_owner(&cell, 2));
        assert!(alloc.is_owner(&cell, 3));
        assert!(!alloc.is_owner(&cell, 0));
    }

    #[test]
    fn test_update_shrink_demotes_running_core() {
        // Shrinking a habitat under a running cell turns the relinquished
        // core into a borrowed one instead of leaving a dangling claim.
        let (alloc, cell) = fresh();
        cell.register_worker(0).unwrap();
        cell.register_worker(1).unwrap();
        assert_eq!(alloc.alloc(&cell, 2, SELF_CPU_NONE), 0b0011);

        Cell::update(&cell, 0b01, 0);
        assert_eq!(cell.owned_mask(), 0b0001);
        assert!(!alloc.is_owner(&cell, 1));
        assert!(cell.has_core(1));
        assert!(alloc.borrowed(&cell, 1));

        // The next owner of CPU 1 reclaims it through the normal path.
        let other = alloc.create_cell(5, 0, 0, Arc::new(ChannelPage::new()));
        Cell::update(&other, 0b10, 0);
        assert!(alloc.is_owner(&other, 1));
        assert_eq!(alloc.alloc(&other, 1, SELF_CPU_NONE), 0);
        assert!(cell.channel(1).yield_requested());

        // The demoted cell honors the flag; the core flows to its owner.
        alloc.return_core(&cell, 1);
        assert!(!cell.has_core(1));
        assert!(alloc.borrower(1).is_none());
        assert!(other.has_core(1));
    }
}
