//! Nidus cell scheduling.
//!
//! The dynamic CPU-core allocator and its cells. Coordinates, across all
//! CPUs concurrently, which cell owns which core, which cell currently runs
//! where, and how idle cores flow between cells in response to load. The
//! ceding discipline is priority-ordered and non-preemptive: a borrower is
//! never descheduled, it is asked (through its worker channel) to yield and
//! does so on its next kernel entry.

#![no_std]

extern crate alloc;

pub mod bitalloc;
pub mod cell;
pub mod channel;
pub mod core_allocator;
pub mod cpumask;
pub mod worker;

pub use cell::{Cell, CellError};
pub use channel::{Channel, ChannelPage, CHANNELS_PER_PAGE};
pub use core_allocator::{core_alloc, CoreAllocator, IDLE_ALLOC_TRIALS, NUM_PRIO, SELF_CPU_NONE};
pub use cpumask::{bit, bit_scan_forward, iter_cpus, CpuMask, NUM_CPU};
pub use worker::{register_park_hook, register_wake_hook, Worker, WorkerSm};
