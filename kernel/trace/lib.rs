//! Per-CPU kernel counters.
//!
//! Low-overhead atomic counters for scheduler and allocator hot paths.
//! Counters are maintained per-CPU to avoid cache line contention; the
//! increment path is a single `Relaxed` fetch-add on the local CPU's slot.
//!
//! Aggregated snapshots iterate all CPU slots and sum the values. This is
//! slower and only meant for diagnostics.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use cpu_local::CpuLocal;

/// Number of defined trace counters. Matches [`TraceCounter`] variants.
pub const TRACE_COUNTER_COUNT: usize = 8;

// ============================================================================
// Counter Enumeration
// ============================================================================

/// Predefined counters for core-allocation hot paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceCounter {
    /// Allocation requests entered.
    AllocCalls = 0,
    /// Cores granted across all allocations.
    CoresGranted = 1,
    /// Cores granted that belong to another cell.
    CoresBorrowed = 2,
    /// Yield flags raised on behalf of reclaiming owners.
    ReclaimsRequested = 3,
    /// Cores handed back to their owner.
    CoresReturned = 4,
    /// Voluntary core releases.
    VoluntaryYields = 5,
    /// Worker wake-ups issued.
    WorkerWakes = 6,
    /// Syscalls entered through the dispatch table.
    SyscallEntry = 7,
}

/// Human-readable counter names for diagnostics export.
const COUNTER_NAMES: [&str; TRACE_COUNTER_COUNT] = [
    "core.alloc_calls",
    "core.granted",
    "core.borrowed",
    "core.reclaims",
    "core.returned",
    "core.yields",
    "core.wakes",
    "syscall.entry",
];

/// Get the human-readable name for a counter.
#[inline]
pub fn counter_name(counter: TraceCounter) -> &'static str {
    COUNTER_NAMES[counter as usize]
}

// ============================================================================
// Per-CPU Counter Storage
// ============================================================================

/// Per-CPU counter array. Each CPU has its own instance.
struct PerCpuCounters {
    counts: [AtomicU64; TRACE_COUNTER_COUNT],
}

impl PerCpuCounters {
    fn new() -> Self {
        Self {
            counts: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn add(&self, counter: TraceCounter, delta: u64) {
        self.counts[counter as usize].fetch_add(delta, Ordering::Relaxed);
    }

    fn reset_all(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> [u64; TRACE_COUNTER_COUNT] {
        let mut out = [0u64; TRACE_COUNTER_COUNT];
        for (idx, c) in self.counts.iter().enumerate() {
            out[idx] = c.load(Ordering::Acquire);
        }
        out
    }
}

/// Global per-CPU counter storage.
static PER_CPU_COUNTERS: CpuLocal<PerCpuCounters> = CpuLocal::new(PerCpuCounters::new);

// ============================================================================
// Public API
// ============================================================================

/// Increment a counter on the current CPU.
///
/// Safe from any context; no lock contention with other CPUs.
#[inline]
pub fn increment_counter(counter: TraceCounter, delta: u64) {
    PER_CPU_COUNTERS.with(|slot| slot.add(counter, delta));
}

/// Reset all counters across all CPUs. Diagnostics only.
pub fn reset_counters() {
    for cpu in 0..cpu_local::max_cpus() {
        let _ = PER_CPU_COUNTERS.with_cpu(cpu, |slot| slot.reset_all());
    }
}

/// Counter values for a single CPU.
#[derive(Clone, Debug)]
pub struct CpuCounterSnapshot {
    /// CPU index (0-based).
    pub cpu: usize,
    /// Counter values indexed by [`TraceCounter`].
    pub counts: [u64; TRACE_COUNTER_COUNT],
}

/// Aggregated counter snapshot across all CPUs.
#[derive(Clone, Debug)]
pub struct TraceCounterSnapshot {
    /// Sum of each counter across all CPUs.
    pub total: [u64; TRACE_COUNTER_COUNT],
    /// Per-CPU breakdown for diagnostics.
    pub per_cpu: Vec<CpuCounterSnapshot>,
}

impl TraceCounterSnapshot {
    /// Get the total for a specific counter.
    #[inline]
    pub fn get(&self, counter: TraceCounter) -> u64 {
        self.total[counter as usize]
    }

    /// Iterate over all counters with names.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        COUNTER_NAMES.iter().copied().zip(self.total.iter().copied())
    }
}

/// Aggregate counters across all CPUs.
pub fn snapshot_counters() -> TraceCounterSnapshot {
    let mut total = [0u64; TRACE_COUNTER_COUNT];
    let mut per_cpu = Vec::new();
    for cpu in 0..cpu_local::max_cpus() {
        if let Some(counts) = PER_CPU_COUNTERS.with_cpu(cpu, |slot| slot.snapshot()) {
            for (idx, val) in counts.iter().enumerate() {
                total[idx] = total[idx].saturating_add(*val);
            }
            per_cpu.push(CpuCounterSnapshot { cpu, counts });
        }
    }
    TraceCounterSnapshot { total, per_cpu }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_snapshot() {
        reset_counters();
        increment_counter(TraceCounter::AllocCalls, 1);
        increment_counter(TraceCounter::AllocCalls, 2);
        increment_counter(TraceCounter::CoresGranted, 5);
        let snap = snapshot_counters();
        assert_eq!(snap.get(TraceCounter::AllocCalls), 3);
        assert_eq!(snap.get(TraceCounter::CoresGranted), 5);
    }

    #[test]
    fn test_counter_names_align() {
        assert_eq!(counter_name(TraceCounter::SyscallEntry), "syscall.entry");
        assert_eq!(COUNTER_NAMES.len(), TRACE_COUNTER_COUNT);
    }
}
