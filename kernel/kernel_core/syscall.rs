//! Syscall dispatch.
//!
//! Register-based hypercall interface of the cell scheduler. Operation
//! numbers are positional in the dispatch table; capability and argument
//! errors are caught here and translated to exit codes, while resource
//! scarcity is never an error: `alloc_cores` reports a short grant through
//! its result registers and still exits with `Success`.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use cap::{CapId, CapRights};
use cpu_local::{current_cpu_id, cycles};
use klog::klog;
use sched::{bit_scan_forward, core_alloc, Cell, CellError, CoreAllocator, NUM_CPU};
use trace::{increment_counter, TraceCounter};

use crate::pd::{Pd, PdError};

// ============================================================================
// Operation numbers and exit codes
// ============================================================================

/// Voluntary core release, optionally parking the worker.
pub const SYS_YIELD: u64 = 16;
/// Map a fresh channel page and record the worker entry point.
pub const SYS_MXINIT: u64 = 17;
/// Acquire up to N cores and activate their workers.
pub const SYS_ALLOC_CORES: u64 = 18;
/// Query the owned or current core mask.
pub const SYS_CORE_ALLOCATION: u64 = 19;
/// Create a cell or update its habitat.
pub const SYS_CREATE_CELL: u64 = 20;
/// Update a habitat stripe.
pub const SYS_CELL_CTRL: u64 = 21;
/// Query the current CPU id.
pub const SYS_CPUID: u64 = 23;
/// Wake the owner's worker on a specific CPU.
pub const SYS_RESERVE_CORE: u64 = 24;
/// Carve the global CPU pool at boot.
pub const SYS_CREATE_HABITAT: u64 = 25;

/// Syscall exit codes. Concrete bit patterns are fixed by the surrounding
/// ABI and opaque to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    BadCap = 1,
    BadCpu = 2,
    BadPar = 3,
    QuoOom = 4,
}

/// Sub-operations of [`SYS_YIELD`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldOp {
    /// Hand a borrowed core back to its owner, then park.
    ReturnCore,
    /// Release the core into the free pool, then park.
    Sleep,
    /// Release the core without parking the worker.
    NoBlock,
}

impl YieldOp {
    fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(YieldOp::ReturnCore),
            1 => Some(YieldOp::Sleep),
            2 => Some(YieldOp::NoBlock),
            _ => None,
        }
    }
}

/// Input/output registers of one syscall.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysRegs {
    /// Argument registers, positional per operation.
    pub args: [u64; 4],
    /// Result registers.
    pub out: [u64; 2],
}

impl SysRegs {
    pub fn with_args(args: [u64; 4]) -> Self {
        Self { args, out: [0; 2] }
    }
}

/// The calling execution context as seen by the dispatcher.
pub struct EcContext {
    /// The caller's protection domain.
    pub pd: Arc<Pd>,
    /// Whether the caller is a cell worker (yield is worker-only).
    pub is_worker: bool,
    /// The allocator instance syscalls operate on.
    pub alloc: &'static CoreAllocator,
}

impl EcContext {
    /// Context against the boot-time global allocator.
    pub fn new(pd: Arc<Pd>, is_worker: bool) -> Self {
        Self {
            pd,
            is_worker,
            alloc: core_alloc(),
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Dispatch one syscall. Unknown operation numbers exit with `BadPar`.
pub fn dispatch(current: &EcContext, op: u64, regs: &mut SysRegs) -> ExitCode {
    increment_counter(TraceCounter::SyscallEntry, 1);
    match op {
        SYS_YIELD => sys_yield(current, regs),
        SYS_MXINIT => sys_mxinit(current, regs),
        SYS_ALLOC_CORES => sys_alloc_cores(current, regs),
        SYS_CORE_ALLOCATION => sys_core_allocation(current, regs),
        SYS_CREATE_CELL => sys_create_cell(current, regs),
        SYS_CELL_CTRL => sys_cell_ctrl(current, regs),
        SYS_CPUID => sys_cpuid(current, regs),
        SYS_RESERVE_CORE => sys_reserve_core(current, regs),
        SYS_CREATE_HABITAT => sys_create_habitat(current, regs),
        _ => ExitCode::BadPar,
    }
}

/// Worker registration glue used by execution-context creation.
///
/// A second worker on the same (cell, CPU) pair is refused.
pub fn register_worker(pd: &Pd, cpu: usize) -> ExitCode {
    if cpu >= NUM_CPU {
        return ExitCode::BadCpu;
    }
    let Some(cell) = pd.cell() else {
        return ExitCode::BadCap;
    };
    match cell.register_worker(cpu) {
        Ok(()) => ExitCode::Success,
        Err(CellError::WorkerExists) => {
            klog!(Warn, "worker already registered on CPU {}", cpu);
            ExitCode::BadCpu
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn sys_yield(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let cpu = current_cpu_id();
    let Some(cell) = current.pd.cell() else {
        klog!(Warn, "yield without a cell on CPU {}", cpu);
        return ExitCode::BadCap;
    };
    if !current.is_worker {
        klog!(Warn, "yield by non-worker on CPU {}", cpu);
        return ExitCode::BadCap;
    }
    let Some(op) = YieldOp::from_raw(regs.args[0]) else {
        return ExitCode::BadPar;
    };

    match op {
        YieldOp::ReturnCore => {
            let channel = cell.channel(cpu);
            channel.delta_block.store(cycles(), Ordering::Release);
            if current.alloc.borrowed(&cell, cpu) {
                // The owner asked for this core back; push it home and
                // activate the owner's worker.
                current.alloc.return_core(&cell, cpu);
                if let Some(owner) = current.alloc.owner(cpu) {
                    owner.wake_core(cpu);
                }
            } else if channel.yield_requested() {
                // The request went stale (the core already flowed back);
                // honoring it is still the worker's job.
                cell.yield_core(cpu, true);
            }
        }
        YieldOp::Sleep | YieldOp::NoBlock => {
            current.alloc.yield_cpu(&cell, cpu);
        }
    }

    // Put the yielding worker to sleep.
    if op != YieldOp::NoBlock {
        cell.park_worker(cpu);
    }
    ExitCode::Success
}

fn sys_mxinit(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let entry = regs.args[0];
    let channel_gva = regs.args[1];
    let prio = regs.args[2];
    klog!(Info, "channel page for prio {} at {:#x}", prio, channel_gva);
    match current.pd.mxinit(entry, channel_gva) {
        Ok(_) => ExitCode::Success,
        Err(PdError::ChannelsExist) => ExitCode::BadPar,
        Err(PdError::QuotaExhausted) => ExitCode::QuoOom,
    }
}

fn sys_alloc_cores(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let cpu = current_cpu_id();
    let Some(cell) = current.pd.cell() else {
        return ExitCode::BadCap;
    };
    let count = regs.args[0] as usize;

    let channel = cell.channel(cpu);
    channel.delta_enter.store(
        cycles().wrapping_sub(channel.delta_enter.load(Ordering::Acquire)),
        Ordering::Release,
    );

    let start_alloc = cycles();
    let granted = current.alloc.alloc(&cell, count, cpu);
    channel
        .delta_alloc
        .store(cycles().wrapping_sub(start_alloc), Ordering::Release);

    let start_activate = cycles();
    cell.add_cores(granted);
    channel
        .delta_activate
        .store(cycles().wrapping_sub(start_activate), Ordering::Release);
    channel.delta_return.store(cycles(), Ordering::Release);

    // A short (even empty) grant is not an error; the remainder register
    // tells the caller how much of the request was satisfied.
    regs.out[0] = granted;
    regs.out[1] = cell.remainder() as u64;
    ExitCode::Success
}

fn sys_core_allocation(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let Some(cell) = current.pd.cell() else {
        return ExitCode::BadCap;
    };
    let owned = regs.args[0] != 0;
    regs.out[0] = if owned {
        cell.owned_mask()
    } else {
        cell.current_mask()
    };
    ExitCode::Success
}

fn sys_create_cell(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let sel = CapId(regs.args[0]);
    let prio = regs.args[1];
    let mask = regs.args[2];
    let offset = regs.args[3] as usize;

    let Ok(entry) = cap::space().lookup_with_rights(sel, CapRights::CTRL) else {
        klog!(Warn, "create_cell: bad PD cap {:?}", sel);
        return ExitCode::BadCap;
    };
    let Some(pd) = entry.object.as_any().downcast_ref::<Pd>() else {
        klog!(Warn, "create_cell: cap {:?} is not a PD", sel);
        return ExitCode::BadCap;
    };
    if prio as usize >= sched::NUM_PRIO {
        return ExitCode::BadPar;
    }

    let cell = match pd.cell() {
        Some(cell) => {
            Cell::update(&cell, mask, offset);
            cell
        }
        None => {
            // The channel page must exist before workers can be driven.
            let Some(channels) = pd.channels() else {
                return ExitCode::BadPar;
            };
            let cell = current.alloc.create_cell(prio as u8, mask, offset, channels);
            pd.set_cell(cell.clone());
            cell
        }
    };

    // The first habitat core is claimed up front so the cell can start a
    // worker immediately.
    if let Some(first_cpu) = bit_scan_forward(cell.owned_mask()) {
        current.alloc.reserve(&cell, first_cpu);
        klog!(Info, "reserved CPU {} for new cell", first_cpu);
    }
    ExitCode::Success
}

fn sys_cell_ctrl(_current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let sel = CapId(regs.args[0]);
    let mask = regs.args[1];
    let index = regs.args[2] as usize;

    let Ok(entry) = cap::space().lookup_with_rights(sel, CapRights::CTRL) else {
        klog!(Warn, "cell_ctrl: bad PD cap {:?}", sel);
        return ExitCode::BadCap;
    };
    let Some(pd) = entry.object.as_any().downcast_ref::<Pd>() else {
        return ExitCode::BadCap;
    };
    let Some(cell) = pd.cell() else {
        return ExitCode::BadCap;
    };
    Cell::update(&cell, mask, index);
    ExitCode::Success
}

fn sys_cpuid(_current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    regs.out[0] = current_cpu_id() as u64;
    ExitCode::Success
}

fn sys_reserve_core(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let Some(cell) = current.pd.cell() else {
        return ExitCode::BadCap;
    };
    let cpu = regs.args[0] as usize;
    if cpu >= NUM_CPU || !current.alloc.is_owner(&cell, cpu) {
        return ExitCode::BadCpu;
    }
    cell.wake_core(cpu);
    ExitCode::Success
}

fn sys_create_habitat(current: &EcContext, regs: &mut SysRegs) -> ExitCode {
    let offset = regs.args[0] as usize;
    let size = regs.args[1] as usize;
    current.alloc.init_habitat(offset, size);
    ExitCode::Success
}
