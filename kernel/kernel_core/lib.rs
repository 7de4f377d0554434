//! Nidus kernel core: protection domains and the syscall boundary.
//!
//! Everything user space can do to the cell scheduler enters through
//! [`syscall::dispatch`]; the scheduler itself lives in the `sched` crate
//! and never sees a capability or a register file.

#![no_std]

extern crate alloc;

pub mod pd;
pub mod syscall;

pub use pd::{Pd, PdError};
pub use syscall::{dispatch, register_worker, EcContext, ExitCode, SysRegs, YieldOp};
