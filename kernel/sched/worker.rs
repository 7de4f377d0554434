//! Per-CPU worker handles.
//!
//! Each cell runs at most one worker per CPU. The worker blocks inside the
//! yield syscall on a per-CPU binary semaphore; `add_cores`/`wake_core`
//! release it. The actual context switch and the cross-CPU kick (IPI) are
//! platform concerns: the boot path registers hooks here, and before
//! registration a wake is just the semaphore transition.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;

/// Hook signature: called with the CPU id of the affected worker.
pub type WorkerHookFn = fn(cpu: usize);

/// Kick a remote CPU after a permit was raised (IPI send on hardware).
static WAKE_HOOK: Once<WorkerHookFn> = Once::new();

/// Block the calling worker until its permit is raised (scheduler hand-off
/// on hardware).
static PARK_HOOK: Once<WorkerHookFn> = Once::new();

/// Register the wake-side hook. First registration wins.
pub fn register_wake_hook(hook: WorkerHookFn) {
    WAKE_HOOK.call_once(|| hook);
}

/// Register the park-side hook. First registration wins.
pub fn register_park_hook(hook: WorkerHookFn) {
    PARK_HOOK.call_once(|| hook);
}

/// Binary semaphore carrying wake-ups to a sleeping worker.
///
/// An up on a worker that is not parked is a no-op: the permit saturates
/// at one and the next down consumes it without blocking.
pub struct WorkerSm {
    permit: AtomicBool,
}

impl WorkerSm {
    pub const fn new() -> Self {
        Self {
            permit: AtomicBool::new(false),
        }
    }

    /// Raise the permit. Returns `true` if it was newly raised.
    #[inline]
    pub fn up(&self) -> bool {
        !self.permit.swap(true, Ordering::AcqRel)
    }

    /// Consume the permit if present, without blocking.
    #[inline]
    pub fn try_down(&self) -> bool {
        self.permit.swap(false, Ordering::AcqRel)
    }
}

/// Handle for the per-CPU worker of a cell: its wake primitive plus the
/// CPU it is pinned to.
pub struct Worker {
    cpu: usize,
    sm: WorkerSm,
}

impl Worker {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            sm: WorkerSm::new(),
        }
    }

    /// The CPU this worker is pinned to.
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Wake the worker. Idempotent; kicks the remote CPU only on a fresh
    /// permit.
    pub fn wake(&self) {
        if self.sm.up() {
            if let Some(hook) = WAKE_HOOK.get() {
                hook(self.cpu);
            }
        }
    }

    /// Block until woken, consuming the permit.
    ///
    /// Returns `true` if a permit was consumed. Without a registered park
    /// hook (early boot, tests) a missing permit returns `false` instead
    /// of blocking.
    pub fn park(&self) -> bool {
        if self.sm.try_down() {
            return true;
        }
        if let Some(hook) = PARK_HOOK.get() {
            hook(self.cpu);
            return self.sm.try_down();
        }
        false
    }

    /// Whether a wake-up is pending.
    #[inline]
    pub fn wake_pending(&self) -> bool {
        self.sm.permit.load(Ordering::Acquire)
    }
}
