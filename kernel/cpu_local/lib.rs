//! Per-CPU storage and CPU identity for Nidus.
//!
//! Provides a per-CPU storage abstraction (`CpuLocal<T>`) using CPU-ID
//! indexed slots, plus the two platform facts every other kernel crate needs:
//! which logical CPU is executing right now, and a monotonic cycle counter.
//!
//! Both facts come from hardware drivers (APIC enumeration, TSC) that live
//! outside this crate. The boot path registers resolver callbacks here once
//! those drivers are up; before registration, `current_cpu_id` reports CPU 0
//! and `cycles` reports 0, which is sufficient for the single-core early
//! boot phase.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cpu_local::CpuLocal;
//! use core::sync::atomic::AtomicUsize;
//!
//! static MY_DATA: CpuLocal<AtomicUsize> = CpuLocal::new(|| AtomicUsize::new(0));
//!
//! MY_DATA.with(|d| d.fetch_add(1, Ordering::Relaxed));
//! ```

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use spin::Once;

/// Number of logical CPUs the kernel is built for.
///
/// All set-of-CPU state elsewhere in the kernel is a bitmask over
/// `[0, NUM_CPU)`, so this must not exceed the machine word width.
pub const NUM_CPU: usize = 64;

/// Get the maximum number of supported CPUs.
pub const fn max_cpus() -> usize {
    NUM_CPU
}

// ============================================================================
// CPU Identity
// ============================================================================

/// Resolver signature: returns the logical index of the executing CPU.
pub type CpuIdFn = fn() -> usize;

/// Resolver signature: returns a monotonic cycle count.
pub type CyclesFn = fn() -> u64;

/// Registered CPU-identity resolver (APIC-backed on real hardware).
static CPU_ID_RESOLVER: Once<CpuIdFn> = Once::new();

/// Registered cycle counter (TSC-backed on real hardware).
static CYCLE_COUNTER: Once<CyclesFn> = Once::new();

/// Register the CPU-identity resolver. Only the first registration wins.
///
/// Must be called before any application processor starts executing kernel
/// code; until then every caller is reported as CPU 0.
pub fn register_cpu_id_resolver(resolver: CpuIdFn) {
    CPU_ID_RESOLVER.call_once(|| resolver);
}

/// Register the cycle counter used for scheduling telemetry.
pub fn register_cycle_counter(counter: CyclesFn) {
    CYCLE_COUNTER.call_once(|| counter);
}

/// Get the logical index of the executing CPU.
///
/// Falls back to CPU 0 before the resolver is registered (early boot).
#[inline]
pub fn current_cpu_id() -> usize {
    match CPU_ID_RESOLVER.get() {
        Some(resolver) => {
            let id = resolver();
            assert!(id < NUM_CPU, "CPU ID {} out of range (max {})", id, NUM_CPU);
            id
        }
        None => 0,
    }
}

/// Read the monotonic cycle counter, or 0 before registration.
#[inline]
pub fn cycles() -> u64 {
    match CYCLE_COUNTER.get() {
        Some(counter) => counter(),
        None => 0,
    }
}

// ============================================================================
// Per-CPU Storage
// ============================================================================

/// Per-CPU storage wrapper.
///
/// Stores one instance of `T` per CPU, lazily initialised on first access.
/// Slots are heap-allocated via `Box<[MaybeUninit<T>]>` so large per-CPU
/// types never transit the stack during initialisation.
pub struct CpuLocal<T> {
    /// Initialisation function for each CPU's slot.
    init: fn() -> T,
    /// Per-CPU slots, heap-allocated and initialised lazily via Once.
    slots: Once<UnsafeCell<Box<[MaybeUninit<T>]>>>,
}

// Safety: each CPU only accesses its own slot; cross-CPU access is limited
// to types with interior synchronization (see with_cpu).
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send + Sync> Sync for CpuLocal<T> {}

impl<T> CpuLocal<T> {
    /// Create a new per-CPU storage with the given initialiser.
    ///
    /// The initialiser is called once per CPU slot on first access.
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            init,
            slots: Once::new(),
        }
    }

    fn get_slots(&self) -> &UnsafeCell<Box<[MaybeUninit<T>]>> {
        self.slots.call_once(|| {
            let mut arr = Box::new_uninit_slice(NUM_CPU);
            for slot in arr.iter_mut() {
                slot.write((self.init)());
            }
            UnsafeCell::new(arr)
        })
    }

    /// Access the current CPU's slot.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let id = current_cpu_id();
        // Safety: current_cpu_id() asserts id < NUM_CPU, and get_slots()
        // initialises every slot before returning.
        let slot = unsafe {
            let arr = &*self.get_slots().get();
            arr.get(id)
                .expect("CPU slot missing after bounds check")
                .assume_init_ref()
        };
        f(slot)
    }

    /// Access a specific CPU's slot.
    ///
    /// Used for cross-CPU reads such as counter aggregation. Safe only when
    /// `T` supports concurrent access (e.g. uses atomics).
    ///
    /// Returns `None` if `cpu_id` is out of range.
    #[inline]
    pub fn with_cpu<R>(&self, cpu_id: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        if cpu_id >= NUM_CPU {
            return None;
        }
        // Safety: slots are initialised in get_slots(); cpu_id bounds checked.
        let slot = unsafe {
            let arr = &*self.get_slots().get();
            match arr.get(cpu_id) {
                Some(s) => s.assume_init_ref(),
                None => return None,
            }
        };
        Some(f(slot))
    }
}
